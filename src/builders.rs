// Builder Patterns - fluent APIs for constructing registry and pipeline
// values with sensible defaults and validation at `build()` time.

use crate::registry::{BackendConfig, DatabaseEntry, ModelConfig, SourceType};
use crate::types::{DatabaseName, Fingerprint, IngestTier, ValidatedPath};
use anyhow::{anyhow, Result};
use chrono::Utc;

/// Fluent builder for a `DatabaseEntry` registration.
pub struct DatabaseEntryBuilder {
    name: Option<DatabaseName>,
    path: Option<ValidatedPath>,
    source_folder: Option<ValidatedPath>,
    source_type: SourceType,
    file_extensions: Vec<String>,
    recursive: bool,
    preprocessing_pipeline: Vec<String>,
    auto_watch: bool,
    watch_interval_seconds: u64,
    backend_config: BackendConfig,
    model_config: Option<ModelConfig>,
    description: String,
}

impl DatabaseEntryBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            path: None,
            source_folder: None,
            source_type: SourceType::Generic,
            file_extensions: Vec::new(),
            recursive: true,
            preprocessing_pipeline: Vec::new(),
            auto_watch: false,
            watch_interval_seconds: 30,
            backend_config: BackendConfig::file_based_default(),
            model_config: None,
            description: String::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Result<Self> {
        self.name = Some(DatabaseName::new(name.into())?);
        Ok(self)
    }

    pub fn path(mut self, path: impl AsRef<std::path::Path>) -> Result<Self> {
        self.path = Some(ValidatedPath::new(path)?);
        Ok(self)
    }

    pub fn source_folder(mut self, path: impl AsRef<std::path::Path>) -> Result<Self> {
        self.source_folder = Some(ValidatedPath::new(path)?);
        Ok(self)
    }

    pub fn source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    pub fn file_extension(mut self, ext: impl Into<String>) -> Self {
        self.file_extensions.push(ext.into());
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn preprocessing_step(mut self, name: impl Into<String>) -> Self {
        self.preprocessing_pipeline.push(name.into());
        self
    }

    pub fn auto_watch(mut self, enabled: bool) -> Self {
        self.auto_watch = enabled;
        self
    }

    pub fn watch_interval_seconds(mut self, seconds: u64) -> Result<Self> {
        crate::validation::registry::validate_watch_interval(seconds)?;
        self.watch_interval_seconds = seconds;
        Ok(self)
    }

    pub fn backend_config(mut self, config: BackendConfig) -> Self {
        self.backend_config = config;
        self
    }

    pub fn model_config(mut self, config: ModelConfig) -> Self {
        self.model_config = Some(config);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn build(self) -> Result<DatabaseEntry> {
        let name = self.name.ok_or_else(|| anyhow!("database name is required"))?;
        let path = self.path.ok_or_else(|| anyhow!("database path is required"))?;

        self.backend_config.validate()?;

        Ok(DatabaseEntry {
            name,
            path,
            source_folder: self.source_folder,
            source_type: self.source_type,
            file_extensions: self.file_extensions,
            recursive: self.recursive,
            preprocessing_pipeline: self.preprocessing_pipeline,
            auto_watch: self.auto_watch,
            watch_interval_seconds: self.watch_interval_seconds,
            backend_type: self.backend_config.backend_type(),
            backend_config: self.backend_config,
            model_config: self.model_config.unwrap_or_default(),
            description: self.description,
        })
    }
}

impl Default for DatabaseEntryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Fluent builder for a single `IngestionItem` handed to the pipeline by a
/// watcher scan or a one-shot `ingest` invocation.
pub struct IngestionItemBuilder {
    source_path: Option<ValidatedPath>,
    extracted_text: Option<String>,
    metadata: serde_json::Map<String, serde_json::Value>,
    tier_hint: IngestTier,
}

impl IngestionItemBuilder {
    pub fn new() -> Self {
        Self {
            source_path: None,
            extracted_text: None,
            metadata: serde_json::Map::new(),
            tier_hint: IngestTier::Enriched,
        }
    }

    pub fn source_path(mut self, path: impl AsRef<std::path::Path>) -> Result<Self> {
        self.source_path = Some(ValidatedPath::new(path)?);
        Ok(self)
    }

    pub fn extracted_text(mut self, text: impl Into<String>) -> Self {
        self.extracted_text = Some(text.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn tier_hint(mut self, tier_hint: IngestTier) -> Self {
        self.tier_hint = tier_hint;
        self
    }

    pub fn build(self) -> Result<crate::pipeline::IngestionItem> {
        let source_path = self
            .source_path
            .ok_or_else(|| anyhow!("ingestion item source_path is required"))?;
        let extracted_text = self
            .extracted_text
            .ok_or_else(|| anyhow!("ingestion item extracted_text is required"))?;

        let fingerprint = Fingerprint::of_content(extracted_text.as_bytes());

        Ok(crate::pipeline::IngestionItem {
            fingerprint,
            source_path,
            extracted_text,
            metadata: serde_json::Value::Object(self.metadata),
            tier_hint: self.tier_hint,
            attempt_count: 0,
            enqueued_at: Utc::now(),
        })
    }
}

impl Default for IngestionItemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_entry_builder_requires_name_and_path() {
        assert!(DatabaseEntryBuilder::new().build().is_err());

        let entry = DatabaseEntryBuilder::new()
            .name("proj1")
            .unwrap()
            .path("/tmp/hybridrag/proj1")
            .unwrap()
            .watch_interval_seconds(30)
            .unwrap()
            .build();
        assert!(entry.is_ok());
        let entry = entry.unwrap();
        assert_eq!(entry.name.as_str(), "proj1");
        assert!(!entry.auto_watch);
    }

    #[test]
    fn test_database_entry_builder_rejects_sub_minimum_watch_interval() {
        assert!(DatabaseEntryBuilder::new().watch_interval_seconds(5).is_err());
    }

    #[test]
    fn test_ingestion_item_builder() {
        let item = IngestionItemBuilder::new()
            .source_path("docs/readme.md")
            .unwrap()
            .extracted_text("hello world")
            .metadata("project_tag", "proj1")
            .tier_hint(IngestTier::Fast)
            .build()
            .unwrap();

        assert_eq!(item.extracted_text, "hello world");
        assert_eq!(item.tier_hint, IngestTier::Fast);
        assert_eq!(item.metadata["project_tag"], "proj1");
    }

    #[test]
    fn test_ingestion_item_builder_requires_fields() {
        assert!(IngestionItemBuilder::new().build().is_err());
    }
}
