// Error kind taxonomy (`spec.md` §7).
//
// Every fallible operation in this crate returns `HybridRagError` (or, internally,
// `anyhow::Error` that gets classified into one at the CLI/dispatcher boundary).
// `ErrorKind` carries no payload of its own; the payload lives on `HybridRagError`
// so a diagnosis always travels with a database name and a masked backend footer.

use crate::types::DatabaseName;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Schema violation, unknown database, port out of range.
    InputInvalid,
    /// Registry lookup miss, missing path.
    NotFound,
    /// Duplicate register, migration already in progress, already running.
    Conflict,
    /// Queue full, tier-semaphore exhausted, registry-lock timeout.
    Busy,
    /// T3/T4 soft timeout (handed off as a background task); fatal elsewhere.
    DeadlineExceeded,
    /// Connection failure, missing extension.
    BackendUnavailable,
    /// Network jitter, provider rate limit — retried per pipeline policy.
    EngineTransient,
    /// Malformed input, shape mismatch — quarantined, not retried.
    EnginePermanent,
    /// Migration count or spot-check mismatch.
    VerificationFailed,
    /// Unclassified; bug-class; fail-closed.
    Internal,
}

impl ErrorKind {
    /// CLI exit code mapping (`spec.md` §6).
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::InputInvalid => 1,
            ErrorKind::NotFound => 2,
            ErrorKind::Conflict => 3,
            ErrorKind::Busy | ErrorKind::DeadlineExceeded => 4,
            ErrorKind::BackendUnavailable => 5,
            ErrorKind::VerificationFailed => 6,
            ErrorKind::EngineTransient | ErrorKind::EnginePermanent | ErrorKind::Internal => 1,
        }
    }

    /// Ingestion workers retry `EngineTransient` with backoff and quarantine
    /// everything else that reaches them (`spec.md` §7 propagation policy).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::EngineTransient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InputInvalid => "input-invalid",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Busy => "busy",
            ErrorKind::DeadlineExceeded => "deadline-exceeded",
            ErrorKind::BackendUnavailable => "backend-unavailable",
            ErrorKind::EngineTransient => "engine-transient",
            ErrorKind::EnginePermanent => "engine-permanent",
            ErrorKind::VerificationFailed => "verification-failed",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// The crate's single error type. Every constructor takes a one-line diagnosis;
/// `database`/`source` are attached as context accumulates up the call stack.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {diagnosis}{}", self.database_suffix())]
pub struct HybridRagError {
    pub kind: ErrorKind,
    pub diagnosis: String,
    pub database: Option<DatabaseName>,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl HybridRagError {
    pub fn new(kind: ErrorKind, diagnosis: impl Into<String>) -> Self {
        Self {
            kind,
            diagnosis: diagnosis.into(),
            database: None,
            source: None,
        }
    }

    pub fn with_database(mut self, database: DatabaseName) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    fn database_suffix(&self) -> String {
        match &self.database {
            Some(name) => format!(" (database={name})"),
            None => String::new(),
        }
    }

    pub fn input_invalid(diagnosis: impl Into<String>) -> Self {
        Self::new(ErrorKind::InputInvalid, diagnosis)
    }

    pub fn not_found(diagnosis: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, diagnosis)
    }

    pub fn conflict(diagnosis: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, diagnosis)
    }

    pub fn busy(diagnosis: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, diagnosis)
    }

    pub fn deadline_exceeded(diagnosis: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, diagnosis)
    }

    pub fn backend_unavailable(diagnosis: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendUnavailable, diagnosis)
    }

    pub fn engine_transient(diagnosis: impl Into<String>) -> Self {
        Self::new(ErrorKind::EngineTransient, diagnosis)
    }

    pub fn engine_permanent(diagnosis: impl Into<String>) -> Self {
        Self::new(ErrorKind::EnginePermanent, diagnosis)
    }

    pub fn verification_failed(diagnosis: impl Into<String>) -> Self {
        Self::new(ErrorKind::VerificationFailed, diagnosis)
    }

    pub fn internal(diagnosis: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, diagnosis)
    }
}

pub type Result<T> = std::result::Result<T, HybridRagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(ErrorKind::InputInvalid.exit_code(), 1);
        assert_eq!(ErrorKind::NotFound.exit_code(), 2);
        assert_eq!(ErrorKind::Conflict.exit_code(), 3);
        assert_eq!(ErrorKind::Busy.exit_code(), 4);
        assert_eq!(ErrorKind::DeadlineExceeded.exit_code(), 4);
        assert_eq!(ErrorKind::BackendUnavailable.exit_code(), 5);
        assert_eq!(ErrorKind::VerificationFailed.exit_code(), 6);
    }

    #[test]
    fn test_only_engine_transient_is_retryable() {
        assert!(ErrorKind::EngineTransient.is_retryable());
        assert!(!ErrorKind::EnginePermanent.is_retryable());
        assert!(!ErrorKind::BackendUnavailable.is_retryable());
    }

    #[test]
    fn test_diagnosis_carries_database_name() {
        let db = DatabaseName::new("proj1").unwrap();
        let err = HybridRagError::not_found("missing path").with_database(db);
        assert!(err.to_string().contains("proj1"));
        assert!(err.to_string().contains("not-found"));
    }
}
