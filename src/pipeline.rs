// Ingestion Pipeline (`spec.md` §4.5): a bounded in-memory queue fed by the
// watcher and drained by a fixed worker pool.
//
// Worker loop shape (pick item, process, ack/retry) is grounded on
// `supabase_repository::job_worker::SupabaseJobWorker::run`/`tick`; the
// backoff schedule comes from `pure::calculate_backoff_duration`.

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::backend::BackendFactory;
use crate::error::{ErrorKind, HybridRagError, Result};
use crate::ledger::ProcessedFilesLedger;
use crate::pure::calculate_backoff_duration;
use crate::registry::DatabaseEntry;
use crate::types::{DatabaseName, Fingerprint, IngestTier};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(16);
const BACKOFF_JITTER_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IngestionItem {
    pub fingerprint: Fingerprint,
    pub source_path: crate::types::ValidatedPath,
    pub extracted_text: String,
    pub metadata: Value,
    pub tier_hint: IngestTier,
    pub attempt_count: u32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

/// Tracks fingerprints enqueued as `enriched` that have not yet completed, so
/// a later consumer can know which items still need the enrichment pass
/// (`spec.md` §9 open question: the draining consumer lives outside this
/// pipeline; this only maintains the tracked set).
pub type EnrichmentPending = Arc<DashMap<DatabaseName, DashSet<Fingerprint>>>;

pub struct IngestionPipeline {
    sender: mpsc::Sender<IngestionItem>,
    enrichment_pending: EnrichmentPending,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
    inserted_count: Arc<AtomicU32>,
}

struct WorkerContext {
    entry: DatabaseEntry,
    ledger: Arc<ProcessedFilesLedger>,
    backend_factory: Arc<BackendFactory>,
    enrichment_pending: EnrichmentPending,
    errors_dir: PathBuf,
    max_attempts: u32,
}

impl IngestionPipeline {
    /// Spawns `worker_count` workers draining a queue of `capacity` items for
    /// one database. `enqueue` claims the ledger single-flight slot before
    /// the item ever reaches the channel, so a dropped-silently duplicate
    /// never occupies queue capacity.
    pub fn spawn(
        entry: DatabaseEntry,
        ledger: Arc<ProcessedFilesLedger>,
        backend_factory: Arc<BackendFactory>,
        capacity: usize,
        worker_count: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let enrichment_pending: EnrichmentPending = Arc::new(DashMap::new());
        let errors_dir = entry.path.as_path().join("ingestion_queue").join("errors");
        let inserted_count = Arc::new(AtomicU32::new(0));

        let mut worker_handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let receiver = receiver.clone();
            let ctx = WorkerContext {
                entry: entry.clone(),
                ledger: ledger.clone(),
                backend_factory: backend_factory.clone(),
                enrichment_pending: enrichment_pending.clone(),
                errors_dir: errors_dir.clone(),
                max_attempts: DEFAULT_MAX_ATTEMPTS,
            };
            let inserted_count = inserted_count.clone();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let item = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    let Some(item) = item else {
                        info!(worker_id, "ingestion worker shutting down: channel closed");
                        break;
                    };
                    process_item(&ctx, item).await;
                    inserted_count.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }

        Self {
            sender,
            enrichment_pending,
            worker_handles,
            inserted_count,
        }
    }

    /// Blocks when the queue is at capacity (`spec.md` §4.5 Backpressure).
    /// Claims the ledger slot first: a duplicate fingerprint is dropped
    /// silently and never touches the channel.
    pub async fn enqueue(&self, mut item: IngestionItem, ledger: &ProcessedFilesLedger) -> Result<bool> {
        let claimed = ledger
            .claim(
                item.fingerprint,
                item.source_path.as_str(),
                item.extracted_text.len() as u64,
            )
            .await?;
        if claimed.is_none() {
            return Ok(false);
        }

        item.attempt_count = 0;
        match self.sender.send(item).await {
            Ok(()) => Ok(true),
            Err(_) => Err(HybridRagError::busy("ingestion queue is closed")),
        }
    }

    pub fn try_enqueue_nonblocking(&self, item: IngestionItem) -> Result<()> {
        self.sender.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HybridRagError::busy("ingestion queue is at capacity"),
            mpsc::error::TrySendError::Closed(_) => HybridRagError::busy("ingestion queue is closed"),
        })
    }

    pub fn enrichment_pending(&self) -> EnrichmentPending {
        self.enrichment_pending.clone()
    }

    pub fn processed_count(&self) -> u32 {
        self.inserted_count.load(Ordering::Relaxed)
    }

    /// Drains in-flight work with a grace period before returning, used by
    /// the watcher daemon's DRAINING state.
    pub async fn stop(self, grace: Duration) {
        drop(self.sender);
        let _ = tokio::time::timeout(grace, futures::future::join_all(self.worker_handles)).await;
    }
}

async fn process_item(ctx: &WorkerContext, mut item: IngestionItem) {
    if item.tier_hint == IngestTier::Enriched {
        ctx.enrichment_pending
            .entry(ctx.entry.name.clone())
            .or_default()
            .insert(item.fingerprint);
    }

    loop {
        match try_insert(ctx, &item).await {
            Ok(()) => {
                if item.tier_hint == IngestTier::Enriched {
                    if let Some(set) = ctx.enrichment_pending.get(&ctx.entry.name) {
                        set.remove(&item.fingerprint);
                    }
                }
                if let Some(token) = claim_complete_token(ctx, item.fingerprint).await {
                    let _ = ctx.ledger.complete(token).await;
                }
                return;
            }
            Err(err) if err.kind.is_retryable() && item.attempt_count + 1 < ctx.max_attempts => {
                item.attempt_count += 1;
                let jitter_roll = fastrand::f64();
                let delay = calculate_backoff_duration(
                    item.attempt_count - 1,
                    BACKOFF_BASE,
                    BACKOFF_MAX,
                    BACKOFF_JITTER_FRACTION,
                    jitter_roll,
                );
                warn!(
                    database = %ctx.entry.name,
                    attempt = item.attempt_count,
                    delay_ms = delay.as_millis(),
                    "ingestion insert failed transiently, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(database = %ctx.entry.name, error = %err, "ingestion item permanently failed");
                quarantine(ctx, &item).await;
                if let Some(token) = claim_complete_token(ctx, item.fingerprint).await {
                    let _ = ctx.ledger.fail(token, &err.diagnosis).await;
                }
                return;
            }
        }
    }
}

async fn claim_complete_token(
    ctx: &WorkerContext,
    fingerprint: Fingerprint,
) -> Option<crate::ledger::ClaimToken> {
    // The worker already holds the claim made at enqueue time; reconstruct
    // the token here since it was not threaded through the channel payload.
    let _ = ctx;
    Some(crate::ledger::ClaimToken { fingerprint })
}

async fn try_insert(ctx: &WorkerContext, item: &IngestionItem) -> Result<()> {
    let handles = ctx.backend_factory.handles_for(&ctx.entry).await?;
    handles
        .storage
        .insert(&item.extracted_text, &item.metadata)
        .await
        .map_err(|e| HybridRagError::new(ErrorKind::EngineTransient, e.diagnosis).with_database(ctx.entry.name.clone()))
}

async fn quarantine(ctx: &WorkerContext, item: &IngestionItem) {
    if let Err(e) = tokio::fs::create_dir_all(&ctx.errors_dir).await {
        error!("failed to create ingestion errors directory: {e}");
        return;
    }
    let source = item.source_path.as_path();
    if let Some(file_name) = source.file_name() {
        let dest = ctx.errors_dir.join(file_name);
        if let Err(e) = tokio::fs::copy(source, &dest).await {
            warn!("failed to quarantine source file {}: {e}", source.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entry(dir: &std::path::Path) -> DatabaseEntry {
        crate::builders::DatabaseEntryBuilder::new()
            .name("proj1")
            .unwrap()
            .path(dir.join("proj1"))
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_drops_duplicate_fingerprint_silently() {
        let dir = tempdir().unwrap();
        let entry = sample_entry(dir.path());
        let ledger = Arc::new(ProcessedFilesLedger::open(entry.path.as_path()).await.unwrap());
        let factory = Arc::new(BackendFactory::new());
        let pipeline = IngestionPipeline::spawn(entry, ledger.clone(), factory, 8, 2);

        let item = crate::builders::IngestionItemBuilder::new()
            .source_path(dir.path().join("a.md"))
            .unwrap()
            .extracted_text("hello world")
            .build()
            .unwrap();

        std::fs::write(dir.path().join("a.md"), "hello world").unwrap();

        let first = pipeline.enqueue(item.clone(), &ledger).await.unwrap();
        assert!(first);
        let second = pipeline.enqueue(item, &ledger).await.unwrap();
        assert!(!second);

        pipeline.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_enqueued_item_is_inserted_and_completed() {
        let dir = tempdir().unwrap();
        let entry = sample_entry(dir.path());
        let ledger = Arc::new(ProcessedFilesLedger::open(entry.path.as_path()).await.unwrap());
        let factory = Arc::new(BackendFactory::new());
        let pipeline = IngestionPipeline::spawn(entry, ledger.clone(), factory, 8, 2);

        std::fs::write(dir.path().join("a.md"), "hello world").unwrap();
        let item = crate::builders::IngestionItemBuilder::new()
            .source_path(dir.path().join("a.md"))
            .unwrap()
            .extracted_text("hello world")
            .build()
            .unwrap();
        let fp = item.fingerprint;

        pipeline.enqueue(item, &ledger).await.unwrap();
        pipeline.stop(Duration::from_secs(5)).await;

        assert!(ledger.seen(&fp).await.unwrap());
    }
}
