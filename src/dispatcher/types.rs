// Dispatcher response shapes (`spec.md` §4.8, §6).
//
// Adapted from `mcp::types::MCPError`'s `{code, message, data}` shape: this
// crate's dispatcher speaks in `HybridRagError`/`ErrorKind` rather than
// JSON-RPC error codes, but every response (success or error) still carries
// the mandatory backend metadata footer.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::registry::BackendType;
use crate::types::DatabaseName;

/// `{database_name, backend_type, backend_identity}`, mandatory on every
/// dispatcher response, success or error (`spec.md` §4.8).
#[derive(Debug, Clone, Serialize)]
pub struct BackendFooter {
    pub database_name: DatabaseName,
    pub backend_type: BackendType,
    pub backend_identity: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub status: TaskStatus,
    pub detail: Option<String>,
    /// Populated once a background T3/T4 call completes (`spec.md` §4.8); a
    /// poller sees an empty list while the task is still `Running`.
    pub suggested_multihop_seeds: Vec<String>,
}

pub struct TaskHandle {
    pub id: Uuid,
    pub join: Arc<tokio::task::JoinHandle<()>>,
    pub progress: watch::Receiver<TaskProgress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub footer: BackendFooter,
    pub top_k_requested: Option<usize>,
    pub top_k_effective: Option<usize>,
    /// Set when the requested `top_k` exceeded the tier cap and was clamped.
    pub clamped_from: Option<usize>,
    pub suggested_escalation: Option<String>,
    pub suggested_multihop_seeds: Vec<String>,
    pub task_handle: Option<Uuid>,
    pub progress: Option<TaskProgress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResponse {
    pub result: serde_json::Value,
    pub metadata: ResponseMetadata,
}
