// Migration Coordinator (`spec.md` §4.9): copies a database's content from
// its current backend to a different `BackendConfig`, behind an exclusive
// registry lease and a watcher pause/resume interlock, resuming from the
// last checkpoint across a process restart.
//
// Checkpoint persistence (`checkpoint` submodule) is grounded on
// `registry::Registry::persist`'s write-temp/fsync/rename discipline,
// applied per job instead of to the whole registry file. The watcher
// pause/resume handshake is grounded on `watcher::supervisor`'s PID/heartbeat
// liveness model, generalized to a third file the daemon mirrors its state
// into (`watcher::state_file_path`).

pub mod checkpoint;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::BackendFactory;
use crate::engine::{MigrationRecord, StorageHandle};
use crate::error::{HybridRagError, Result};
use crate::pure::seeded_spot_check_indices;
use crate::registry::{BackendConfig, BackendType, DatabaseEntry, SharedRegistry};
use crate::types::DatabaseName;
use crate::watcher::supervisor::WatcherSupervisor;
use crate::watcher::{WatcherSignal, WatcherState};
use checkpoint::CheckpointStore;

const DEFAULT_BATCH_SIZE: usize = 1_000;
const DEFAULT_SPOT_CHECK_COUNT: usize = 20;
const WATCHER_PAUSE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Paused,
    Failed,
    Completed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationCounts {
    pub total: u64,
    pub migrated: u64,
    pub failed: u64,
}

/// Checkpoint for one logical store: `spec.md` §4.9 phase 5, "after each
/// batch persist a checkpoint `{store_name, last_key, migrated_count}`".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreCheckpoint {
    pub store_name: String,
    pub last_key: Option<String>,
    pub migrated_count: u64,
    pub total_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    pub job_id: String,
    pub database_name: DatabaseName,
    pub source_backend: BackendType,
    pub target_backend: BackendType,
    pub status: MigrationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub checkpoints: BTreeMap<String, StoreCheckpoint>,
    pub counts: MigrationCounts,
    pub last_error: Option<String>,
}

impl MigrationJob {
    fn new(database_name: DatabaseName, job_id: String, source_backend: BackendType, target_backend: BackendType) -> Self {
        Self {
            job_id,
            database_name,
            source_backend,
            target_backend,
            status: MigrationStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            checkpoints: BTreeMap::new(),
            counts: MigrationCounts::default(),
            last_error: None,
        }
    }

    pub fn checkpoint_for(&self, store: &str) -> Option<&StoreCheckpoint> {
        self.checkpoints.get(store)
    }

    fn set_checkpoint(&mut self, checkpoint: StoreCheckpoint) {
        self.checkpoints.insert(checkpoint.store_name.clone(), checkpoint);
    }
}

pub struct MigrationOptions {
    pub batch_size: usize,
    pub verify: bool,
    pub resume: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            verify: true,
            resume: false,
        }
    }
}

/// Drives one database through the nine migration phases. Holds no
/// per-job state itself; everything survives a restart in the checkpoint
/// file (`checkpoint_dir`).
pub struct MigrationCoordinator {
    registry: SharedRegistry,
    backend_factory: Arc<BackendFactory>,
    supervisor: Arc<WatcherSupervisor>,
    checkpoint_dir: PathBuf,
    pause_timeout: Duration,
}

impl MigrationCoordinator {
    pub fn new(
        registry: SharedRegistry,
        backend_factory: Arc<BackendFactory>,
        supervisor: Arc<WatcherSupervisor>,
        checkpoint_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            backend_factory,
            supervisor,
            checkpoint_dir,
            pause_timeout: WATCHER_PAUSE_TIMEOUT,
        }
    }

    /// Overrides the phase-2 pause deadline. Exposed for tests; production
    /// callers get `spec.md` §4.9's 60s default.
    pub fn with_pause_timeout(mut self, timeout: Duration) -> Self {
        self.pause_timeout = timeout;
        self
    }

    /// Runs (or resumes) a migration to completion. Phase 1 (claim) and the
    /// final release bracket everything else so a job id is never left
    /// leased after this returns, success or failure.
    pub async fn migrate(
        &self,
        name: &DatabaseName,
        target_config: BackendConfig,
        options: MigrationOptions,
    ) -> Result<MigrationJob> {
        target_config
            .validate()
            .map_err(|e| HybridRagError::input_invalid(e.to_string()).with_database(name.clone()))?;

        let job_id = if options.resume {
            CheckpointStore::existing_job_id(&self.checkpoint_dir, name)?
        } else {
            Uuid::new_v4().to_string()
        };

        // Phase 1: Claim.
        self.registry.claim_migration_lease(name, &job_id)?;
        let result = self.run_job(name, &job_id, target_config, &options).await;
        // Phase 9: Release. Always runs, even on failure: a failed job must
        // not permanently block a retry from claiming the lease again.
        if let Err(e) = self.registry.release_migration_lease(name) {
            warn!(database = %name, error = %e, "failed to release migration lease");
        }
        result
    }

    async fn run_job(
        &self,
        name: &DatabaseName,
        job_id: &str,
        target_config: BackendConfig,
        options: &MigrationOptions,
    ) -> Result<MigrationJob> {
        let source_entry = self.registry.resolve(name)?;
        let mut job = CheckpointStore::read(&self.checkpoint_dir, name)?
            .filter(|j| j.job_id == job_id)
            .unwrap_or_else(|| {
                MigrationJob::new(name.clone(), job_id.to_string(), source_entry.backend_type, target_config.backend_type())
            });

        // Phase 2: Pause watcher.
        self.supervisor.send_signal(name, WatcherSignal::Pause)?;
        if !self.supervisor.wait_for_state(name, WatcherState::Paused, self.pause_timeout).await {
            job.status = MigrationStatus::Failed;
            job.last_error = Some("watcher did not reach paused state within the pause deadline".to_string());
            CheckpointStore::save(&self.checkpoint_dir, &job)?;
            return Err(HybridRagError::deadline_exceeded(format!("watcher for {name} did not pause in time"))
                .with_database(name.clone()));
        }
        job.status = MigrationStatus::InProgress;
        CheckpointStore::save(&self.checkpoint_dir, &job)?;

        let outcome = self.copy_and_verify(&source_entry, &target_config, options, &mut job).await;

        // Phase 8: Resume watcher, regardless of the copy outcome.
        self.supervisor.send_signal(name, WatcherSignal::Resume)?;

        match outcome {
            Ok(()) => {
                job.status = MigrationStatus::Completed;
                job.completed_at = Some(Utc::now());
                CheckpointStore::save(&self.checkpoint_dir, &job)?;
                info!(database = %name, job_id, "migration completed");
                Ok(job)
            }
            Err(e) => {
                job.status = MigrationStatus::Failed;
                job.last_error = Some(e.to_string());
                CheckpointStore::save(&self.checkpoint_dir, &job)?;
                Err(e)
            }
        }
    }

    /// Phases 3-7: snapshot, plan, copy, verify, promote.
    async fn copy_and_verify(
        &self,
        source_entry: &DatabaseEntry,
        target_config: &BackendConfig,
        options: &MigrationOptions,
        job: &mut MigrationJob,
    ) -> Result<()> {
        let source_handles = self.backend_factory.handles_for(source_entry).await?;

        let mut target_entry = source_entry.clone();
        target_entry.backend_type = target_config.backend_type();
        target_entry.backend_config = target_config.clone();
        let target_handles = self.backend_factory.handles_for(&target_entry).await?;

        // Phase 3: Snapshot.
        let stores = source_handles.storage.store_names().await?;

        // Phase 4/5: Plan + Copy, ordered by source key, one checkpoint per batch.
        let mut total = 0u64;
        let mut migrated = 0u64;
        for store in &stores {
            let total_count = source_handles.storage.store_count(store).await?;
            total += total_count;

            let mut checkpoint = job.checkpoint_for(store).cloned().unwrap_or_else(|| StoreCheckpoint {
                store_name: store.clone(),
                last_key: None,
                migrated_count: 0,
                total_count,
            });
            checkpoint.total_count = total_count;

            loop {
                let batch = source_handles
                    .storage
                    .export_batch(store, checkpoint.last_key.as_deref(), options.batch_size)
                    .await?;
                if batch.is_empty() {
                    break;
                }
                target_handles.storage.import_batch(store, &batch).await?;
                checkpoint.last_key = batch.last().map(|r| r.key.clone());
                checkpoint.migrated_count += batch.len() as u64;
                job.set_checkpoint(checkpoint.clone());
                CheckpointStore::save(&self.checkpoint_dir, job)?;
            }
            migrated += checkpoint.migrated_count;
        }
        job.counts = MigrationCounts { total, migrated, failed: 0 };
        CheckpointStore::save(&self.checkpoint_dir, job)?;

        if options.verify {
            self.verify_stores(&stores, job, &source_handles.storage, &target_handles.storage).await?;
        }

        // Phase 7: Promote.
        self.registry.promote_backend(&source_entry.name, target_config.clone())?;
        self.backend_factory.invalidate(&source_entry.name);
        info!(database = %source_entry.name, "migration promoted target backend");
        Ok(())
    }

    /// Phase 6: re-count every target store, then a deterministic spot-check
    /// of `DEFAULT_SPOT_CHECK_COUNT` positions (seeded by `job_id`, so a
    /// resumed verify pass samples the same positions). Any mismatch fails
    /// closed: the job is failed and `promote_backend` is never called.
    async fn verify_stores(
        &self,
        stores: &[String],
        job: &MigrationJob,
        source: &Arc<dyn StorageHandle>,
        target: &Arc<dyn StorageHandle>,
    ) -> Result<()> {
        let seed = spot_check_seed(&job.job_id);
        for store in stores {
            let expected = job.checkpoint_for(store).map(|c| c.total_count).unwrap_or(0);
            let target_count = target.store_count(store).await?;
            if target_count != expected {
                return Err(HybridRagError::verification_failed(format!(
                    "store '{store}' count mismatch after migration: source {expected}, target {target_count}"
                ))
                .with_database(job.database_name.clone()));
            }

            let indices = seeded_spot_check_indices(seed, expected as usize, DEFAULT_SPOT_CHECK_COUNT);
            if indices.is_empty() {
                continue;
            }
            let sample_size = indices.iter().max().map(|m| m + 1).unwrap_or(0);
            let source_sample = export_prefix(source, store, sample_size).await?;
            let target_sample = export_prefix(target, store, sample_size).await?;

            for idx in indices {
                let matches = match (source_sample.get(idx), target_sample.get(idx)) {
                    (Some(a), Some(b)) => a.text == b.text && a.metadata == b.metadata,
                    _ => false,
                };
                if !matches {
                    return Err(HybridRagError::verification_failed(format!(
                        "store '{store}' spot-check mismatch at position {idx}"
                    ))
                    .with_database(job.database_name.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Exports the first `count` records of a store, in stable key order, by
/// paging `export_batch` until `count` records are collected or the store
/// is exhausted.
async fn export_prefix(handle: &Arc<dyn StorageHandle>, store: &str, count: u64) -> Result<Vec<MigrationRecord>> {
    let mut out = Vec::with_capacity(count as usize);
    let mut after: Option<String> = None;
    while (out.len() as u64) < count {
        let remaining = (count - out.len() as u64) as usize;
        let batch = handle.export_batch(store, after.as_deref(), remaining).await?;
        if batch.is_empty() {
            break;
        }
        after = batch.last().map(|r| r.key.clone());
        out.extend(batch);
    }
    Ok(out)
}

fn spot_check_seed(job_id: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    job_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
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
    async fn test_migrate_file_based_to_file_based_copies_and_promotes() {
        let dir = tempdir().unwrap();
        let entry = sample_entry(dir.path());
        let registry = Arc::new(Registry::open(dir.path().join("registry.yaml")).unwrap());
        registry.register(entry.clone()).unwrap();

        let factory = Arc::new(BackendFactory::new());
        let handles = factory.handles_for(&entry).await.unwrap();
        handles.storage.insert("doc one", &serde_json::json!({"source": "a.md"})).await.unwrap();
        handles.storage.insert("doc two", &serde_json::json!({"source": "b.md"})).await.unwrap();

        let supervisor = Arc::new(WatcherSupervisor::new(dir.path().to_path_buf(), PathBuf::from("watcher_daemon")));
        // No real daemon process is running in this test; the watcher state
        // file is pre-seeded as paused so the pause interlock is satisfied
        // without spawning a process.
        std::fs::create_dir_all(dir.path().join("watchers")).unwrap();
        std::fs::write(dir.path().join("watchers").join("proj1.state"), "paused").unwrap();

        let coordinator = MigrationCoordinator::new(
            registry.clone(),
            factory.clone(),
            supervisor,
            dir.path().join("migrations"),
        );

        // A second file-based config is a distinct `BackendConfig` value even
        // though it maps to the same `BackendType`, which is enough to
        // exercise the full copy/verify/promote path without a real server.
        let target_config = BackendConfig::FileBased {
            file_size_warning_mb: 999.0,
            total_size_warning_mb: 9999.0,
            performance_degradation_pct: 10.0,
        };

        let job = coordinator
            .migrate(&entry.name, target_config, MigrationOptions::default())
            .await
            .unwrap();

        assert_eq!(job.status, MigrationStatus::Completed);
        assert_eq!(job.counts.total, 2);
        assert_eq!(job.counts.migrated, 2);

        let updated = registry.resolve(&entry.name).unwrap();
        if let BackendConfig::FileBased { file_size_warning_mb, .. } = updated.backend_config {
            assert_eq!(file_size_warning_mb, 999.0);
        } else {
            panic!("expected file-based config after promotion");
        }
    }

    #[tokio::test]
    async fn test_migrate_fails_closed_when_watcher_never_pauses() {
        let dir = tempdir().unwrap();
        let entry = sample_entry(dir.path());
        let registry = Arc::new(Registry::open(dir.path().join("registry.yaml")).unwrap());
        registry.register(entry.clone()).unwrap();

        let factory = Arc::new(BackendFactory::new());
        let supervisor = Arc::new(WatcherSupervisor::new(dir.path().to_path_buf(), PathBuf::from("watcher_daemon")));
        let coordinator = MigrationCoordinator::new(registry.clone(), factory, supervisor, dir.path().join("migrations"))
            .with_pause_timeout(Duration::from_millis(200));

        // No state file is ever written, so the watcher never appears paused.
        let target_config = BackendConfig::file_based_default();
        let err = coordinator
            .migrate(&entry.name, target_config, MigrationOptions { batch_size: 10, verify: false, resume: false })
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::DeadlineExceeded);

        // The lease must not be left held after a failed attempt.
        registry.claim_migration_lease(&entry.name, "next-job").unwrap();
    }

    #[test]
    fn test_spot_check_seed_is_deterministic() {
        assert_eq!(spot_check_seed("job-1"), spot_check_seed("job-1"));
        assert_ne!(spot_check_seed("job-1"), spot_check_seed("job-2"));
    }
}
