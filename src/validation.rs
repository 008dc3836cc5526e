// Validation Layer
// Runtime validation of the invariants in `spec.md` §3, kept separate from the
// types that use it so the error context stays uniform across the registry,
// backend config, and ledger.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::Path;

/// Validation errors with detailed context.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Precondition failed: {condition}")]
    PreconditionFailed { condition: String, context: String },

    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },
}

/// Validation context for better error messages.
#[derive(Clone)]
pub struct ValidationContext {
    operation: String,
    attributes: HashMap<String, String>,
}

impl ValidationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn validate(self, condition: bool, message: &str) -> Result<()> {
        if !condition {
            let context = format!(
                "Operation: {}, Attributes: {:?}",
                self.operation, self.attributes
            );
            bail!(ValidationError::PreconditionFailed {
                condition: message.to_string(),
                context,
            });
        }
        Ok(())
    }
}

/// Path validation with detailed checks.
pub mod path {
    use super::*;
    use std::ffi::OsStr;

    const MAX_PATH_LENGTH: usize = 4096;

    const RESERVED_NAMES: &[&str] = &[
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    pub fn validate_file_path(path: &str) -> Result<()> {
        let ctx = ValidationContext::new("validate_file_path").with_attribute("path", path);

        ctx.clone()
            .validate(!path.is_empty(), "Path cannot be empty")?;

        ctx.clone().validate(
            path.len() < MAX_PATH_LENGTH,
            &format!("Path exceeds maximum length of {MAX_PATH_LENGTH}"),
        )?;

        ctx.clone()
            .validate(!path.contains('\0'), "Path contains null bytes")?;

        let path_obj = Path::new(path);

        for component in path_obj.components() {
            if let std::path::Component::ParentDir = component {
                bail!(ValidationError::InvalidInput {
                    field: "path".to_string(),
                    reason: "Parent directory references (..) not allowed".to_string(),
                });
            }
        }

        if let Some(stem) = path_obj.file_stem().and_then(OsStr::to_str) {
            let upper = stem.to_uppercase();
            if RESERVED_NAMES.contains(&upper.as_str()) {
                bail!(ValidationError::InvalidInput {
                    field: "path".to_string(),
                    reason: format!("Reserved filename: {stem}"),
                });
            }
        }

        if path_obj.to_str().is_none() {
            bail!(ValidationError::InvalidInput {
                field: "path".to_string(),
                reason: "Path is not valid UTF-8".to_string(),
            });
        }

        Ok(())
    }

    pub fn validate_directory_path(path: &str) -> Result<()> {
        validate_file_path(path)?;

        let path_obj = Path::new(path);
        if path_obj.extension().is_some() {
            bail!(ValidationError::InvalidInput {
                field: "path".to_string(),
                reason: "Directory path should not have a file extension".to_string(),
            });
        }

        Ok(())
    }
}

/// Registry-record field validation (`spec.md` §3 `DatabaseEntry` invariants).
pub mod registry {
    use super::*;
    use once_cell::sync::Lazy;
    use regex::Regex;

    static NAME_PATTERN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[a-z0-9_-]+$").expect("static regex is valid"));

    pub fn validate_database_name(name: &str) -> Result<()> {
        let ctx = ValidationContext::new("database_name").with_attribute("name", name);

        ctx.clone()
            .validate(!name.is_empty(), "Database name cannot be empty")?;
        ctx.clone()
            .validate(name.len() <= 64, "Database name too long (max 64 chars)")?;
        ctx.validate(
            NAME_PATTERN.is_match(name),
            "Database name must match [a-z0-9_-]+",
        )?;

        Ok(())
    }

    pub fn validate_watch_interval(seconds: u64) -> Result<()> {
        ValidationContext::new("watch_interval")
            .with_attribute("seconds", seconds.to_string())
            .validate(seconds >= 10, "watch_interval_seconds must be >= 10")
    }
}

/// `BackendConfig` field validation (`spec.md` §3 "Validation:" paragraph).
pub mod backend {
    use super::*;

    const ALLOWED_VECTOR_INDEX_KINDS: &[&str] = &["hnsw", "ivfflat"];

    pub fn validate_port(port: u32) -> Result<()> {
        ValidationContext::new("backend_port")
            .with_attribute("port", port.to_string())
            .validate((1..=65535).contains(&port), "port must be in 1..=65535")
    }

    pub fn validate_max_connections(max_connections: u32) -> Result<()> {
        ValidationContext::new("backend_max_connections")
            .with_attribute("max_connections", max_connections.to_string())
            .validate(
                (1..=100).contains(&max_connections),
                "max_connections must be in 1..=100",
            )
    }

    pub fn validate_vector_index_kind(kind: &str) -> Result<()> {
        ValidationContext::new("vector_index_kind")
            .with_attribute("kind", kind)
            .validate(
                ALLOWED_VECTOR_INDEX_KINDS.contains(&kind),
                "vector_index_kind must be one of hnsw, ivfflat",
            )
    }

    /// Checks the "embedding_dim matches the embedding model's true output width"
    /// invariant (`spec.md` §3, §7 scenario 6).
    pub fn validate_embedding_dim(configured: u32, observed: u32) -> Result<()> {
        ValidationContext::new("embedding_dim")
            .with_attribute("configured", configured.to_string())
            .with_attribute("observed", observed.to_string())
            .validate(
                configured == observed,
                &format!(
                    "embedding dimension mismatch: configured {configured} != observed {observed}"
                ),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_validation() {
        assert!(path::validate_file_path("/test/file.md").is_ok());
        assert!(path::validate_file_path("relative/path.txt").is_ok());

        assert!(path::validate_file_path("").is_err());
        assert!(path::validate_file_path("../../../etc/passwd").is_err());
        assert!(path::validate_file_path("file\0with\0nulls").is_err());
        assert!(path::validate_file_path("CON.txt").is_err());

        let long_path = "x".repeat(5000);
        assert!(path::validate_file_path(&long_path).is_err());
    }

    #[test]
    fn test_database_name_validation() {
        assert!(registry::validate_database_name("proj1").is_ok());
        assert!(registry::validate_database_name("Proj1").is_err());
        assert!(registry::validate_database_name("proj 1").is_err());
        assert!(registry::validate_database_name("").is_err());
    }

    #[test]
    fn test_backend_validation() {
        assert!(backend::validate_port(5432).is_ok());
        assert!(backend::validate_port(0).is_err());
        assert!(backend::validate_port(70000).is_err());

        assert!(backend::validate_max_connections(10).is_ok());
        assert!(backend::validate_max_connections(0).is_err());
        assert!(backend::validate_max_connections(101).is_err());

        assert!(backend::validate_vector_index_kind("hnsw").is_ok());
        assert!(backend::validate_vector_index_kind("flat").is_err());
    }

    #[test]
    fn test_embedding_dim_mismatch() {
        assert!(backend::validate_embedding_dim(768, 768).is_ok());
        let err = backend::validate_embedding_dim(768, 1536).unwrap_err();
        assert!(err.to_string().contains("768"));
        assert!(err.to_string().contains("1536"));
    }
}
