// Query Dispatcher (`spec.md` §4.8): the tool surface an external agent
// calls into, classified by tier, resource-capped per `(Tier, database)`,
// with T3/T4 handed off as background tasks.
//
// The name-keyed handler registration is grounded on
// `mcp::tools::MCPToolRegistry`'s dispatch-by-method-prefix shape; the
// background-task/progress-poll shape is grounded on
// `mcp::server`'s dedicated-thread-per-connection pattern, adapted to a
// `tokio::task` + `watch` progress channel instead of an OS thread, since
// tier semaphores already bound concurrency.

pub mod types;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::info;
use uuid::Uuid;

use crate::backend::BackendFactory;
use crate::error::{HybridRagError, Result};
use crate::pure::extract_multihop_seeds;
use crate::registry::{DatabaseEntry, SharedRegistry};
use crate::types::{DatabaseName, Tier};
use types::BackendFooter;
pub use types::{DispatchResponse, TaskHandle, TaskProgress, TaskStatus};

/// How many hits a query response's `suggested_multihop_seeds` carries at
/// most (`spec.md` §4.8).
const MULTIHOP_SEED_LIMIT: usize = 5;

/// One tool's static shape: which tier it belongs to and how its input is
/// routed to the engine. `query_kind` distinguishes tools that map onto
/// `StorageHandle::query` from ones (`status`, `health-check`) that do not
/// touch the engine at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Diagnostic,
    EngineQuery,
}

pub struct ToolDescriptor {
    pub name: &'static str,
    pub tier: Tier,
    pub kind: QueryKind,
}

pub fn known_tools() -> &'static [ToolDescriptor] {
    const TOOLS: &[ToolDescriptor] = &[
        ToolDescriptor { name: "status", tier: Tier::T1, kind: QueryKind::Diagnostic },
        ToolDescriptor { name: "health-check", tier: Tier::T1, kind: QueryKind::Diagnostic },
        ToolDescriptor { name: "get-logs", tier: Tier::T1, kind: QueryKind::Diagnostic },
        ToolDescriptor { name: "local-query", tier: Tier::T2, kind: QueryKind::EngineQuery },
        ToolDescriptor { name: "extract-context", tier: Tier::T2, kind: QueryKind::EngineQuery },
        ToolDescriptor { name: "global-query", tier: Tier::T3, kind: QueryKind::EngineQuery },
        ToolDescriptor { name: "hybrid-query", tier: Tier::T3, kind: QueryKind::EngineQuery },
        ToolDescriptor { name: "generic-query", tier: Tier::T3, kind: QueryKind::EngineQuery },
        ToolDescriptor { name: "multihop-query", tier: Tier::T4, kind: QueryKind::EngineQuery },
    ];
    TOOLS
}

fn describe(tool_name: &str) -> Result<&'static ToolDescriptor> {
    known_tools()
        .iter()
        .find(|t| t.name == tool_name)
        .ok_or_else(|| HybridRagError::input_invalid(format!("unknown tool '{tool_name}'")))
}

/// Per-`(Tier, database)` concurrency gate (`spec.md` §4.8). Background
/// tiers (T3/T4) need two distinct gates: `running`, bounding how many calls
/// actually execute against the engine at once, and `admission`, bounding how
/// many calls may be running *or* queued waiting for a `running` permit.
/// `spec.md` §8 Scenario 2 (cap=1, three overlapping calls: 1st admitted,
/// 2nd queued with a pollable task handle, 3rd busy) needs the queued call to
/// hold an admission slot without yet holding a running slot; sizing
/// admission at twice the concurrency cap gives exactly that one extra queued
/// slot per tier for cap=1, and scales the same way for larger caps.
struct SemaphorePool {
    running: DashMap<(Tier, DatabaseName), Arc<Semaphore>>,
    admission: DashMap<(Tier, DatabaseName), Arc<Semaphore>>,
}

impl SemaphorePool {
    fn new() -> Self {
        Self { running: DashMap::new(), admission: DashMap::new() }
    }

    fn running(&self, tier: Tier, database: &DatabaseName) -> Option<Arc<Semaphore>> {
        let cap = tier.concurrency_cap_per_db()?;
        Some(
            self.running
                .entry((tier, database.clone()))
                .or_insert_with(|| Arc::new(Semaphore::new(cap)))
                .clone(),
        )
    }

    fn admission(&self, tier: Tier, database: &DatabaseName) -> Option<Arc<Semaphore>> {
        let cap = tier.concurrency_cap_per_db()?;
        Some(
            self.admission
                .entry((tier, database.clone()))
                .or_insert_with(|| Arc::new(Semaphore::new(cap * 2)))
                .clone(),
        )
    }
}

pub struct ToolRegistry {
    registry: SharedRegistry,
    backend_factory: Arc<BackendFactory>,
    semaphores: SemaphorePool,
    tasks: DashMap<Uuid, TaskHandle>,
}

impl ToolRegistry {
    pub fn new(registry: SharedRegistry, backend_factory: Arc<BackendFactory>) -> Self {
        Self {
            registry,
            backend_factory,
            semaphores: SemaphorePool::new(),
            tasks: DashMap::new(),
        }
    }

    /// Entry point every CLI/tool-server call goes through.
    pub async fn dispatch(
        &self,
        tool_name: &str,
        database: &DatabaseName,
        text: &str,
        top_k_requested: Option<usize>,
        context_seeds: Option<Vec<String>>,
    ) -> Result<DispatchResponse> {
        let descriptor = describe(tool_name)?;
        let entry = self.registry.resolve(database)?;
        let footer = self.backend_footer(&entry);
        let (top_k, clamped_from) = resolve_top_k(descriptor.tier, top_k_requested);

        if descriptor.kind == QueryKind::Diagnostic {
            return Ok(DispatchResponse {
                result: serde_json::json!({ "tool": tool_name, "status": "ok" }),
                metadata: types::ResponseMetadata {
                    footer,
                    top_k_requested,
                    top_k_effective: top_k,
                    clamped_from,
                    suggested_escalation: None,
                    suggested_multihop_seeds: Vec::new(),
                    task_handle: None,
                    progress: None,
                },
            });
        }

        if descriptor.tier.is_background() {
            // Admission, not execution: bounds how many calls may be running
            // or queued at once. Rejecting here (rather than on the running
            // semaphore) is what lets the 2nd of three overlapping calls
            // queue instead of bouncing immediately.
            let admission_permit = match self.semaphores.admission(descriptor.tier, database) {
                Some(sem) => Some(
                    sem.try_acquire_owned()
                        .map_err(|_| HybridRagError::busy(format!("tier {} is at capacity for {database}", descriptor.tier)))?,
                ),
                None => None,
            };
            let running = self.semaphores.running(descriptor.tier, database);
            return self
                .dispatch_background(descriptor, entry, footer, text.to_string(), top_k, clamped_from, context_seeds, admission_permit, running)
                .await;
        }

        let permit = match self.semaphores.running(descriptor.tier, database) {
            Some(sem) => Some(
                sem.try_acquire_owned()
                    .map_err(|_| HybridRagError::busy(format!("tier {} is at capacity for {database}", descriptor.tier)))?,
            ),
            None => None,
        };

        let handles = self.backend_factory.handles_for(&entry).await?;
        let result = tokio::time::timeout(descriptor.tier.soft_timeout(), handles.storage.query(text, top_k.unwrap_or(5), descriptor.tier))
            .await
            .map_err(|_| HybridRagError::deadline_exceeded(format!("{tool_name} exceeded its soft timeout")).with_database(database.clone()))??;
        drop(permit);

        let suggested_multihop_seeds = seeds_for_tool(descriptor, &result);
        Ok(DispatchResponse {
            result,
            metadata: types::ResponseMetadata {
                footer,
                top_k_requested,
                top_k_effective: top_k,
                clamped_from,
                suggested_escalation: None,
                suggested_multihop_seeds,
                task_handle: None,
                progress: None,
            },
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_background(
        &self,
        descriptor: &'static ToolDescriptor,
        entry: DatabaseEntry,
        footer: BackendFooter,
        text: String,
        top_k: Option<usize>,
        clamped_from: Option<usize>,
        context_seeds: Option<Vec<String>>,
        admission_permit: Option<tokio::sync::OwnedSemaphorePermit>,
        running: Option<Arc<Semaphore>>,
    ) -> Result<DispatchResponse> {
        let task_id = Uuid::new_v4();
        let (progress_tx, progress_rx) =
            watch::channel(TaskProgress { status: TaskStatus::Running, detail: None, suggested_multihop_seeds: Vec::new() });
        let tier = descriptor.tier;
        let backend_factory = self.backend_factory.clone();

        let handle = tokio::spawn(async move {
            let _admission_permit = admission_permit;
            // Queues here, rather than rejecting, when `running` is at
            // capacity: admission already bounded how many calls could reach
            // this point (`spec.md` §8 Scenario 2).
            let _running_permit = match running {
                Some(sem) => match sem.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        let _ = progress_tx.send(TaskProgress {
                            status: TaskStatus::Failed,
                            detail: Some("tier semaphore closed".to_string()),
                            suggested_multihop_seeds: Vec::new(),
                        });
                        return;
                    }
                },
                None => None,
            };

            let handles = match backend_factory.handles_for(&entry).await {
                Ok(h) => h,
                Err(e) => {
                    let _ = progress_tx.send(TaskProgress {
                        status: TaskStatus::Failed,
                        detail: Some(e.to_string()),
                        suggested_multihop_seeds: Vec::new(),
                    });
                    return;
                }
            };

            let query_text = match &context_seeds {
                Some(seeds) if !seeds.is_empty() => format!("{text} [[seeds: {}]]", seeds.join(",")),
                _ => text,
            };

            match handles.storage.query(&query_text, top_k.unwrap_or(10), tier).await {
                Ok(result) => {
                    let seeds = seeds_for_tool(descriptor, &result);
                    let _ = progress_tx.send(TaskProgress {
                        status: TaskStatus::Completed,
                        detail: Some(result.to_string()),
                        suggested_multihop_seeds: seeds,
                    });
                }
                Err(e) => {
                    let _ = progress_tx.send(TaskProgress {
                        status: TaskStatus::Failed,
                        detail: Some(e.to_string()),
                        suggested_multihop_seeds: Vec::new(),
                    });
                }
            }
        });

        self.tasks.insert(task_id, TaskHandle { id: task_id, join: Arc::new(handle), progress: progress_rx.clone() });

        Ok(DispatchResponse {
            result: serde_json::json!({ "accepted": true }),
            metadata: types::ResponseMetadata {
                footer,
                top_k_requested: top_k,
                top_k_effective: top_k,
                clamped_from,
                suggested_escalation: None,
                suggested_multihop_seeds: progress_rx.borrow().suggested_multihop_seeds.clone(),
                task_handle: Some(task_id),
                progress: Some(progress_rx.borrow().clone()),
            },
        })
    }

    pub fn poll_task(&self, task_id: Uuid) -> Result<TaskProgress> {
        self.tasks
            .get(&task_id)
            .map(|t| t.progress.borrow().clone())
            .ok_or_else(|| HybridRagError::not_found(format!("no task {task_id}")))
    }

    /// Aborts the background task at its next suspension point (`spec.md`
    /// §4.8 "Cancellation"): partial results are never surfaced to the poller.
    pub fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        let Some((_, task)) = self.tasks.remove(&task_id) else {
            return Err(HybridRagError::not_found(format!("no task {task_id}")));
        };
        task.join.abort();
        info!(%task_id, "background task cancelled");
        Ok(())
    }

    fn backend_footer(&self, entry: &DatabaseEntry) -> BackendFooter {
        BackendFooter {
            database_name: entry.name.clone(),
            backend_type: entry.backend_type,
            backend_identity: entry.backend_config.masked_summary(),
        }
    }
}

/// Escalation seeds for every query tool except `multihop-query` itself,
/// which is already the top of the escalation chain (`spec.md` §4.8).
fn seeds_for_tool(descriptor: &ToolDescriptor, result: &serde_json::Value) -> Vec<String> {
    if descriptor.name == "multihop-query" {
        return Vec::new();
    }
    extract_multihop_seeds(result, MULTIHOP_SEED_LIMIT)
}

/// `top_k` clamp per `spec.md` §4.8: `None` uses the tier default; a request
/// above the tier cap is silently clamped and the clamp is reported.
fn resolve_top_k(tier: Tier, requested: Option<usize>) -> (Option<usize>, Option<usize>) {
    let Some(requested) = requested else {
        return (tier.default_top_k(), None);
    };
    match tier.top_k_cap() {
        Some(cap) if requested > cap => (Some(cap), Some(requested)),
        _ => (Some(requested), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_top_k_clamps_to_tier_cap() {
        let (effective, clamped_from) = resolve_top_k(Tier::T2, Some(50));
        assert_eq!(effective, Some(10));
        assert_eq!(clamped_from, Some(50));
    }

    #[test]
    fn test_resolve_top_k_uses_tier_default_when_absent() {
        let (effective, clamped_from) = resolve_top_k(Tier::T3, None);
        assert_eq!(effective, Some(10));
        assert_eq!(clamped_from, None);
    }

    #[test]
    fn test_describe_rejects_unknown_tool() {
        assert!(describe("does-not-exist").is_err());
    }

    #[test]
    fn test_describe_classifies_tier_correctly() {
        assert_eq!(describe("multihop-query").unwrap().tier, Tier::T4);
        assert_eq!(describe("status").unwrap().tier, Tier::T1);
    }

    #[tokio::test]
    async fn test_dispatch_diagnostic_tool_bypasses_engine() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(crate::registry::Registry::open(dir.path().join("registry.yaml")).unwrap());
        let entry = crate::builders::DatabaseEntryBuilder::new()
            .name("proj1")
            .unwrap()
            .path(dir.path().join("proj1"))
            .unwrap()
            .build()
            .unwrap();
        registry.register(entry.clone()).unwrap();

        let factory = Arc::new(BackendFactory::new());
        let dispatcher = ToolRegistry::new(registry, factory);
        let response = dispatcher.dispatch("status", &entry.name, "", None, None).await.unwrap();
        assert_eq!(response.result["status"], "ok");
    }
}
