// Watcher Daemon (`spec.md` §4.6): one state machine per registered
// database, scanning its source folder on a timer and feeding discoveries
// into the ingestion pipeline.
//
// The tick loop (scan, handle errors without crashing, sleep, repeat) is
// grounded on `supabase_repository::job_worker::SupabaseJobWorker::run`/
// `tick`; the heartbeat task is grounded on `JobHeartbeat`'s spawn + Drop-abort
// shape.

pub mod supervisor;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::backend::BackendFactory;
use crate::classifier::{Classifier, PreprocessContext};
use crate::error::{HybridRagError, Result};
use crate::ledger::ProcessedFilesLedger;
use crate::pipeline::IngestionPipeline;
use crate::pure::{evaluate_proactive_warnings, is_scan_candidate, update_ewma, HEARTBEAT_INTERVAL};
use crate::registry::DatabaseEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WatcherState {
    Init,
    Scanning,
    Idle,
    Paused,
    Draining,
    Stopped,
}

impl std::fmt::Display for WatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WatcherState::Init => "init",
            WatcherState::Scanning => "scanning",
            WatcherState::Idle => "idle",
            WatcherState::Paused => "paused",
            WatcherState::Draining => "draining",
            WatcherState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Signals a running daemon accepts from the supervisor.
#[derive(Debug, Clone, Copy)]
pub enum WatcherSignal {
    Pause,
    Resume,
    Stop,
}

struct RateBaseline {
    baseline_per_min: Option<f64>,
    window_started_at: std::time::Instant,
    completed_in_window: u32,
}

pub struct WatcherDaemon {
    entry: DatabaseEntry,
    ledger: Arc<ProcessedFilesLedger>,
    classifier: Arc<Classifier>,
    backend_factory: Arc<BackendFactory>,
    pipeline: Arc<IngestionPipeline>,
    state: watch::Sender<WatcherState>,
    signal_tx: watch::Sender<Option<WatcherSignal>>,
    signal_rx: watch::Receiver<Option<WatcherSignal>>,
    stopped: AtomicBool,
    rate_baseline: Mutex<RateBaseline>,
    heartbeat_path: PathBuf,
    pid_path: PathBuf,
    signal_path: PathBuf,
    state_path: PathBuf,
}

const DRAIN_GRACE: Duration = Duration::from_secs(30);
const WARMUP_WINDOW: Duration = Duration::from_secs(60 * 60);
const EWMA_ALPHA: f64 = 0.2;
/// How often the daemon polls its signal file for a cross-process
/// pause/resume/stop request (`spec.md` §4.9 phase 2: the Migration
/// Coordinator runs in a different process than the watcher it pauses).
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Path to the file a supervisor or migration coordinator writes to request
/// a pause/resume/stop of the watcher for `name`, since that caller does not
/// share the daemon's in-process `watch` channel.
pub fn signal_file_path(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join("watchers").join(format!("{name}.signal"))
}

/// Path to the file the daemon mirrors its `WatcherState` into, so a
/// cross-process caller (the migration coordinator, `watcher status`) can
/// observe state transitions without sharing the in-process channel.
pub fn state_file_path(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join("watchers").join(format!("{name}.state"))
}

pub fn read_state_file(state_dir: &Path, name: &str) -> Option<WatcherState> {
    let raw = std::fs::read_to_string(state_file_path(state_dir, name)).ok()?;
    match raw.trim() {
        "init" => Some(WatcherState::Init),
        "scanning" => Some(WatcherState::Scanning),
        "idle" => Some(WatcherState::Idle),
        "paused" => Some(WatcherState::Paused),
        "draining" => Some(WatcherState::Draining),
        "stopped" => Some(WatcherState::Stopped),
        _ => None,
    }
}

impl WatcherDaemon {
    pub fn new(
        entry: DatabaseEntry,
        ledger: Arc<ProcessedFilesLedger>,
        classifier: Arc<Classifier>,
        backend_factory: Arc<BackendFactory>,
        pipeline: Arc<IngestionPipeline>,
        state_dir: &Path,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Init);
        let (signal_tx, signal_rx) = watch::channel(None);
        let watchers_dir = state_dir.join("watchers");
        Self {
            heartbeat_path: watchers_dir.join(format!("{}.heartbeat", entry.name.as_str())),
            pid_path: watchers_dir.join(format!("{}.pid", entry.name.as_str())),
            signal_path: signal_file_path(state_dir, entry.name.as_str()),
            state_path: state_file_path(state_dir, entry.name.as_str()),
            entry,
            ledger,
            classifier,
            backend_factory,
            pipeline,
            state,
            signal_tx,
            signal_rx,
            stopped: AtomicBool::new(false),
            rate_baseline: Mutex::new(RateBaseline {
                baseline_per_min: None,
                window_started_at: std::time::Instant::now(),
                completed_in_window: 0,
            }),
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    fn set_state(&self, new_state: WatcherState) {
        self.state.send_replace(new_state);
        if let Some(parent) = self.state_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&self.state_path, new_state.to_string());
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    pub fn send_signal(&self, signal: WatcherSignal) {
        let _ = self.signal_tx.send(Some(signal));
    }

    /// Writes the PID and an initial heartbeat file, then runs the
    /// scan/sleep loop until a `Stop` signal arrives. Errors encountered
    /// mid-scan are logged and treated as transient; they never terminate
    /// the daemon (`spec.md` §4.6, "handles its own transient errors").
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.write_pid_file()?;
        self.write_heartbeat()?;
        let _heartbeat = Heartbeat::start(self.clone());
        let _signal_poller = SignalFilePoller::start(self.clone());

        self.set_state(WatcherState::Scanning);
        loop {
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }

            match self.consume_signal() {
                Some(WatcherSignal::Stop) => break,
                Some(WatcherSignal::Pause) => {
                    self.set_state(WatcherState::Paused);
                    self.wait_for_resume_or_stop().await;
                    if self.stopped.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Some(WatcherSignal::Resume) | None => {}
            }

            if self.state() == WatcherState::Paused {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            self.set_state(WatcherState::Scanning);
            if let Err(e) = self.scan_once().await {
                warn!(database = %self.entry.name, error = %e, "watcher scan failed transiently");
            }
            self.set_state(WatcherState::Idle);

            tokio::time::sleep(Duration::from_secs(self.entry.watch_interval_seconds)).await;
        }

        self.set_state(WatcherState::Draining);
        self.finish_draining().await;
        Ok(())
    }

    async fn finish_draining(&self) {
        let _ = self.remove_pid_file();
        let _ = std::fs::remove_file(&self.signal_path);
        info!(database = %self.entry.name, "watcher drained, waiting up to {:?}", DRAIN_GRACE);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.set_state(WatcherState::Stopped);
    }

    /// Reads and clears the signal file (one-shot, like an edge-triggered
    /// request) if present, forwarding it onto the in-process channel so the
    /// main loop's existing `consume_signal` logic handles it uniformly.
    fn poll_signal_file(&self) {
        let Ok(raw) = std::fs::read_to_string(&self.signal_path) else {
            return;
        };
        let _ = std::fs::remove_file(&self.signal_path);
        let signal = match raw.trim() {
            "pause" => Some(WatcherSignal::Pause),
            "resume" => Some(WatcherSignal::Resume),
            "stop" => Some(WatcherSignal::Stop),
            other => {
                warn!(database = %self.entry.name, signal = other, "ignoring unrecognized watcher signal file content");
                None
            }
        };
        if let Some(signal) = signal {
            self.send_signal(signal);
        }
    }

    async fn wait_for_resume_or_stop(&self) {
        loop {
            match self.consume_signal() {
                Some(WatcherSignal::Resume) => {
                    self.set_state(WatcherState::Scanning);
                    return;
                }
                Some(WatcherSignal::Stop) => {
                    self.stopped.store(true, Ordering::Relaxed);
                    return;
                }
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    }

    fn consume_signal(&self) -> Option<WatcherSignal> {
        let mut rx = self.signal_rx.clone();
        let value = *rx.borrow_and_update();
        if let Some(WatcherSignal::Stop) = value {
            self.stopped.store(true, Ordering::Relaxed);
        }
        value
    }

    async fn scan_once(&self) -> Result<()> {
        let root = match &self.entry.source_folder {
            Some(path) => path.as_path().to_path_buf(),
            None => self.entry.path.as_path().to_path_buf(),
        };
        let root_key = root.to_string_lossy().to_string();
        let delta_ts = self.ledger.last_scan_timestamp(&root_key).await?.unwrap_or(0);
        let scan_started_at = chrono::Utc::now().timestamp();
        // Independent of `delta_ts`: every candidate this scan has mtime >
        // delta_ts by construction, so reusing delta_ts as the bulk/tier
        // cutoff would make `tier_hint_for_mtime` structurally unable to
        // ever return `Fast` (`spec.md` §4.4).
        let bulk_cutoff_secs = (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp();

        let mut candidates = 0usize;
        let walker = WalkDir::new(&root).max_depth(if self.entry.recursive { usize::MAX } else { 1 });
        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !self.matches_extension(path) {
                continue;
            }
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            if !is_scan_candidate(mtime, delta_ts) {
                continue;
            }

            if let Err(e) = self.ingest_file(path, mtime, bulk_cutoff_secs).await {
                warn!(database = %self.entry.name, path = %path.display(), error = %e, "failed to ingest candidate file");
                continue;
            }
            candidates += 1;
        }

        self.ledger.record_scan_timestamp(&root_key, scan_started_at).await?;
        self.update_rate_baseline(candidates as u32).await;
        self.emit_proactive_warnings().await;
        info!(database = %self.entry.name, candidates, "scan complete");
        Ok(())
    }

    fn matches_extension(&self, path: &Path) -> bool {
        if self.entry.file_extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.entry.file_extensions.iter().any(|allowed| allowed.trim_start_matches('.') == ext))
            .unwrap_or(false)
    }

    async fn ingest_file(&self, path: &Path, mtime: i64, bulk_cutoff_secs: i64) -> Result<()> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| HybridRagError::internal(format!("failed to read {}", path.display())).with_source(e.into()))?;

        let ctx = PreprocessContext {
            entry: &self.entry,
            file_mtime_secs: mtime,
            bulk_cutoff_secs,
        };
        let chunks = self.classifier.classify_and_process(path, &raw, &ctx)?;

        for chunk in chunks {
            let mut builder = crate::builders::IngestionItemBuilder::new()
                .source_path(path)?
                .extracted_text(chunk.text)
                .tier_hint(chunk.tier_hint);
            if let Some(fields) = chunk.metadata.as_object() {
                for (key, value) in fields {
                    builder = builder.metadata(key.clone(), value.clone());
                }
            }
            let item = builder.build()?;
            self.pipeline.enqueue(item, &self.ledger).await?;
        }
        Ok(())
    }

    async fn update_rate_baseline(&self, completed: u32) {
        let mut baseline = self.rate_baseline.lock().await;
        baseline.completed_in_window += completed;
        if baseline.window_started_at.elapsed() >= Duration::from_secs(60) {
            let rate = baseline.completed_in_window as f64
                / (baseline.window_started_at.elapsed().as_secs_f64() / 60.0);
            if baseline.window_started_at.elapsed() <= WARMUP_WINDOW || baseline.baseline_per_min.is_none() {
                baseline.baseline_per_min = Some(update_ewma(baseline.baseline_per_min, rate, EWMA_ALPHA));
            }
            baseline.completed_in_window = 0;
            baseline.window_started_at = std::time::Instant::now();
        }
    }

    async fn emit_proactive_warnings(&self) {
        let crate::registry::BackendConfig::FileBased {
            file_size_warning_mb,
            total_size_warning_mb,
            performance_degradation_pct,
        } = &self.entry.backend_config
        else {
            return;
        };

        let Ok(handles) = self.backend_factory.handles_for(&self.entry).await else {
            return;
        };
        let Ok(metrics) = handles.metrics.collect().await else {
            return;
        };
        let largest_file_mb = metrics
            .file_sizes
            .as_ref()
            .and_then(|sizes| sizes.values().max())
            .map(|bytes| *bytes as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);
        let total_size_mb = metrics.total_size as f64 / (1024.0 * 1024.0);

        let baseline = self.rate_baseline.lock().await;
        let current_rate = baseline.completed_in_window as f64;
        let baseline_rate = baseline.baseline_per_min.unwrap_or(0.0);
        drop(baseline);

        let warnings = evaluate_proactive_warnings(
            largest_file_mb,
            *file_size_warning_mb,
            total_size_mb,
            *total_size_warning_mb,
            current_rate,
            baseline_rate,
            *performance_degradation_pct,
        );

        if warnings.file_size_exceeded {
            warn!(database = %self.entry.name, "file size warning exceeded; consider: migrate {} --to server-backed-v1", self.entry.name);
        }
        if warnings.total_size_exceeded {
            warn!(database = %self.entry.name, "total size warning exceeded; consider: migrate {} --to server-backed-v1", self.entry.name);
        }
        if warnings.rate_degraded {
            warn!(database = %self.entry.name, "ingest rate degraded below baseline; consider: migrate {} --to server-backed-v1", self.entry.name);
        }
    }

    fn write_pid_file(&self) -> Result<()> {
        if let Some(parent) = self.pid_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HybridRagError::internal("failed to create watcher state dir").with_source(e.into()))?;
        }
        std::fs::write(&self.pid_path, std::process::id().to_string())
            .map_err(|e| HybridRagError::internal("failed to write watcher PID file").with_source(e.into()))
    }

    fn remove_pid_file(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.pid_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn write_heartbeat(&self) -> Result<()> {
        if let Some(parent) = self.heartbeat_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HybridRagError::internal("failed to create watcher state dir").with_source(e.into()))?;
        }
        std::fs::write(&self.heartbeat_path, chrono::Utc::now().to_rfc3339())
            .map_err(|e| HybridRagError::internal("failed to write watcher heartbeat file").with_source(e.into()))
    }
}

/// RAII heartbeat ticker: spawned alongside the daemon's main loop, aborted
/// on drop. Grounded on `supabase_repository::job_worker::JobHeartbeat`.
struct Heartbeat {
    handle: tokio::task::JoinHandle<()>,
}

impl Heartbeat {
    fn start(daemon: Arc<WatcherDaemon>) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = daemon.write_heartbeat() {
                    warn!(database = %daemon.entry.name, error = %e, "watcher heartbeat write failed");
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// RAII poller for the cross-process signal file, paired with `Heartbeat`.
struct SignalFilePoller {
    handle: tokio::task::JoinHandle<()>,
}

impl SignalFilePoller {
    fn start(daemon: Arc<WatcherDaemon>) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SIGNAL_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                daemon.poll_signal_file();
            }
        });
        Self { handle }
    }
}

impl Drop for SignalFilePoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entry(dir: &Path) -> DatabaseEntry {
        crate::builders::DatabaseEntryBuilder::new()
            .name("proj1")
            .unwrap()
            .path(dir.join("proj1"))
            .unwrap()
            .watch_interval_seconds(3600)
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_scan_once_ingests_new_file_and_skips_already_seen() {
        let dir = tempdir().unwrap();
        let entry = sample_entry(dir.path());
        std::fs::create_dir_all(entry.path.as_path()).unwrap();
        std::fs::write(entry.path.as_path().join("a.md"), "hello world").unwrap();

        let ledger = Arc::new(ProcessedFilesLedger::open(entry.path.as_path()).await.unwrap());
        let classifier = Arc::new(Classifier::new());
        let factory = Arc::new(BackendFactory::new());
        let pipeline = Arc::new(IngestionPipeline::spawn(entry.clone(), ledger.clone(), factory.clone(), 16, 1));

        let daemon = Arc::new(WatcherDaemon::new(
            entry,
            ledger.clone(),
            classifier,
            factory,
            pipeline,
            dir.path(),
        ));

        daemon.scan_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.completed, 1);

        daemon.scan_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.completed, 1, "rescanning unmodified content must not re-enqueue it");
    }

    #[test]
    fn test_watcher_state_display() {
        assert_eq!(WatcherState::Paused.to_string(), "paused");
        assert_eq!(WatcherState::Draining.to_string(), "draining");
    }
}
