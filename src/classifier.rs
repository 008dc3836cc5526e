// Classifier & Preprocessor (`spec.md` §4.4).
//
// Selects and runs a named preprocessing chain for a scanned file. The
// registration-table shape (`Box<dyn Preprocessor>` keyed by name) follows
// `mcp::tools::MCPToolRegistry`'s handler-registration pattern, generalized
// from MCP tool names to preprocessing pipeline names.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{HybridRagError, Result};
use crate::pure::tier_hint_for_mtime;
use crate::registry::{DatabaseEntry, SourceType};
use crate::types::IngestTier;

/// `(text, metadata)` produced by a preprocessor. `metadata` always carries
/// `{source_path, pipeline_name, tier_hint}`; `project_tag` is optional.
pub struct PreprocessedChunk {
    pub text: String,
    pub metadata: Value,
    pub tier_hint: IngestTier,
}

pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, path: &Path, raw: &[u8], ctx: &PreprocessContext) -> Result<Vec<PreprocessedChunk>>;
}

pub struct PreprocessContext<'a> {
    pub entry: &'a DatabaseEntry,
    pub file_mtime_secs: i64,
    pub bulk_cutoff_secs: i64,
}

impl<'a> PreprocessContext<'a> {
    fn tier_hint(&self) -> IngestTier {
        tier_hint_for_mtime(self.file_mtime_secs, self.bulk_cutoff_secs)
    }
}

/// `generic`: read-decode-normalize, one chunk per file.
pub struct GenericPreprocessor;

impl Preprocessor for GenericPreprocessor {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn process(&self, path: &Path, raw: &[u8], ctx: &PreprocessContext) -> Result<Vec<PreprocessedChunk>> {
        let text = String::from_utf8_lossy(raw).into_owned();
        let tier_hint = ctx.tier_hint();
        let metadata = json!({
            "source_path": path.to_string_lossy(),
            "pipeline_name": self.name(),
            "tier_hint": tier_hint.to_string(),
        });
        Ok(vec![PreprocessedChunk { text, metadata, tier_hint }])
    }
}

/// `conversation-extraction`: parses a session-history JSON format, emits
/// one chunk per logical turn with role metadata, strips tool-call noise.
pub struct ConversationExtractionPreprocessor;

#[derive(serde::Deserialize)]
struct Turn {
    role: String,
    content: String,
    #[serde(default)]
    tool_call: bool,
}

#[derive(serde::Deserialize)]
struct Session {
    turns: Vec<Turn>,
}

impl Preprocessor for ConversationExtractionPreprocessor {
    fn name(&self) -> &'static str {
        "conversation-extraction"
    }

    fn process(&self, path: &Path, raw: &[u8], ctx: &PreprocessContext) -> Result<Vec<PreprocessedChunk>> {
        let session: Session = serde_json::from_slice(raw).map_err(|e| {
            HybridRagError::engine_permanent(format!("malformed conversation session: {e}"))
        })?;

        let tier_hint = ctx.tier_hint();
        let chunks = session
            .turns
            .into_iter()
            .filter(|turn| !turn.tool_call)
            .enumerate()
            .map(|(index, turn)| PreprocessedChunk {
                text: turn.content,
                metadata: json!({
                    "source_path": path.to_string_lossy(),
                    "pipeline_name": self.name(),
                    "tier_hint": tier_hint.to_string(),
                    "role": turn.role,
                    "turn_index": index,
                }),
                tier_hint,
            })
            .collect();
        Ok(chunks)
    }
}

pub struct Classifier {
    registry: HashMap<&'static str, Box<dyn Preprocessor>>,
}

impl Classifier {
    pub fn new() -> Self {
        let mut registry: HashMap<&'static str, Box<dyn Preprocessor>> = HashMap::new();
        registry.insert("generic", Box::new(GenericPreprocessor));
        registry.insert("conversation-extraction", Box::new(ConversationExtractionPreprocessor));
        Self { registry }
    }

    pub fn register(&mut self, preprocessor: Box<dyn Preprocessor>) {
        self.registry.insert(
            Box::leak(preprocessor.name().to_string().into_boxed_str()),
            preprocessor,
        );
    }

    /// Selects the preprocessing chain for `path` given the owning entry's
    /// `source_type` and `preprocessing_pipeline` list, then runs every
    /// named step that resolves to a registered preprocessor.
    pub fn classify_and_process(
        &self,
        path: &Path,
        raw: &[u8],
        ctx: &PreprocessContext,
    ) -> Result<Vec<PreprocessedChunk>> {
        let default_pipeline = match ctx.entry.source_type {
            SourceType::ConversationExtraction => "conversation-extraction",
            _ => "generic",
        };

        let steps: Vec<&str> = if ctx.entry.preprocessing_pipeline.is_empty() {
            vec![default_pipeline]
        } else {
            ctx.entry.preprocessing_pipeline.iter().map(String::as_str).collect()
        };

        let mut all_chunks = Vec::new();
        for step in steps {
            let preprocessor = self.registry.get(step).ok_or_else(|| {
                HybridRagError::input_invalid(format!("unknown preprocessing step '{step}'"))
            })?;
            all_chunks.extend(preprocessor.process(path, raw, ctx)?);
        }
        Ok(all_chunks)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_entry(source_type: SourceType) -> DatabaseEntry {
        crate::builders::DatabaseEntryBuilder::new()
            .name("proj1")
            .unwrap()
            .path("/tmp/hybridrag-test-proj1")
            .unwrap()
            .source_type(source_type)
            .build()
            .unwrap()
    }

    #[test]
    fn test_generic_preprocessor_is_default_for_generic_source() {
        let classifier = Classifier::new();
        let entry = sample_entry(SourceType::Generic);
        let ctx = PreprocessContext {
            entry: &entry,
            file_mtime_secs: 50,
            bulk_cutoff_secs: 100,
        };
        let chunks = classifier
            .classify_and_process(&PathBuf::from("notes.md"), b"hello world", &ctx)
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].tier_hint, IngestTier::Fast);
    }

    #[test]
    fn test_conversation_extraction_strips_tool_calls() {
        let classifier = Classifier::new();
        let entry = sample_entry(SourceType::ConversationExtraction);
        let ctx = PreprocessContext {
            entry: &entry,
            file_mtime_secs: 150,
            bulk_cutoff_secs: 100,
        };
        let raw = serde_json::json!({
            "turns": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "ignored", "tool_call": true},
                {"role": "assistant", "content": "hello"},
            ]
        })
        .to_string();

        let chunks = classifier
            .classify_and_process(&PathBuf::from("session.json"), raw.as_bytes(), &ctx)
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "hi");
        assert_eq!(chunks[1].text, "hello");
        assert_eq!(chunks[0].tier_hint, IngestTier::Enriched);
    }

    #[test]
    fn test_unknown_pipeline_step_is_input_invalid() {
        let classifier = Classifier::new();
        let mut entry = sample_entry(SourceType::Generic);
        entry.preprocessing_pipeline = vec!["does-not-exist".to_string()];
        let ctx = PreprocessContext {
            entry: &entry,
            file_mtime_secs: 50,
            bulk_cutoff_secs: 100,
        };
        let err = classifier
            .classify_and_process(&PathBuf::from("x.md"), b"data", &ctx)
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InputInvalid);
    }
}
