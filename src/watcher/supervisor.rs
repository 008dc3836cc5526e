// Watcher Supervisor (`spec.md` §4.7): start/stop/status of watcher daemon
// processes, stale-PID recovery, and persistent-service unit rendering.
//
// Each watcher runs as a separate OS process (the `watcher_daemon` binary),
// not a task in the CLI's own process, so a daemon crash cannot take the CLI
// down with it and a supervisor restart does not require the CLI to still be
// running. Liveness is judged the way `start()` in `spec.md` §4.7 specifies:
// PID file present, process alive, heartbeat file fresher than
// `pure::STALE_HEARTBEAT_AGE`.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{HybridRagError, Result};
use crate::pure::STALE_HEARTBEAT_AGE;
use crate::registry::DatabaseEntry;
use crate::types::DatabaseName;

#[derive(Debug, Clone, serde::Serialize)]
pub struct WatcherStatus {
    pub name: DatabaseName,
    pub running: bool,
    pub pid: Option<u32>,
    pub heartbeat_age_secs: Option<u64>,
}

pub struct WatcherSupervisor {
    state_dir: PathBuf,
    daemon_binary: PathBuf,
}

const START_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const START_WAIT_POLL: Duration = Duration::from_millis(100);

impl WatcherSupervisor {
    pub fn new(state_dir: PathBuf, daemon_binary: PathBuf) -> Self {
        Self { state_dir, daemon_binary }
    }

    /// Locates the `watcher_daemon` binary next to the currently running
    /// executable, the way a single-archive CLI distribution ships it.
    pub fn discover(state_dir: PathBuf) -> Result<Self> {
        let current = std::env::current_exe()
            .map_err(|e| HybridRagError::internal("failed to resolve current executable").with_source(e.into()))?;
        let daemon_binary = current
            .parent()
            .ok_or_else(|| HybridRagError::internal("current executable has no parent directory"))?
            .join("hybridrag-watcher");
        Ok(Self::new(state_dir, daemon_binary))
    }

    fn pid_path(&self, name: &DatabaseName) -> PathBuf {
        self.state_dir.join("watchers").join(format!("{}.pid", name.as_str()))
    }

    fn heartbeat_path(&self, name: &DatabaseName) -> PathBuf {
        self.state_dir.join("watchers").join(format!("{}.heartbeat", name.as_str()))
    }

    /// Observed `WatcherState`, read from the state file the daemon mirrors
    /// its in-process state into. `None` if the daemon has never run or the
    /// file has not been written yet.
    pub fn watcher_state(&self, name: &DatabaseName) -> Option<super::WatcherState> {
        super::read_state_file(&self.state_dir, name.as_str())
    }

    /// Writes a cross-process pause/resume/stop request for the running
    /// daemon to pick up at its next signal-file poll (`spec.md` §4.9 phase 2).
    pub fn send_signal(&self, name: &DatabaseName, signal: super::WatcherSignal) -> Result<()> {
        let path = super::signal_file_path(&self.state_dir, name.as_str());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HybridRagError::internal("failed to create watcher state dir").with_source(e.into()))?;
        }
        let content = match signal {
            super::WatcherSignal::Pause => "pause",
            super::WatcherSignal::Resume => "resume",
            super::WatcherSignal::Stop => "stop",
        };
        std::fs::write(&path, content)
            .map_err(|e| HybridRagError::internal("failed to write watcher signal file").with_source(e.into()))
    }

    /// Polls `watcher_state` until it equals `target` or `timeout` elapses
    /// (`spec.md` §4.9 phase 2: "wait up to 60s for PAUSED state").
    pub async fn wait_for_state(&self, name: &DatabaseName, target: super::WatcherState, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.watcher_state(name) == Some(target) {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(START_WAIT_POLL).await;
        }
    }

    pub fn status(&self, name: &DatabaseName) -> WatcherStatus {
        let pid = read_pid(&self.pid_path(name));
        let heartbeat_age_secs = heartbeat_age_secs(&self.heartbeat_path(name));
        let running = match (pid, heartbeat_age_secs) {
            (Some(pid), Some(age)) => process_exists(pid) && age < STALE_HEARTBEAT_AGE.as_secs(),
            _ => false,
        };
        WatcherStatus {
            name: name.clone(),
            running,
            pid: if running { pid } else { None },
            heartbeat_age_secs,
        }
    }

    pub fn status_all(&self, entries: &[DatabaseEntry]) -> Vec<WatcherStatus> {
        entries.iter().map(|e| self.status(&e.name)).collect()
    }

    /// `spec.md` §4.7 `start(name)`.
    pub async fn start(&self, entry: &DatabaseEntry) -> Result<WatcherStatus> {
        let status = self.status(&entry.name);
        if status.running {
            info!(database = %entry.name, "watcher already running");
            return Ok(status);
        }

        if status.pid.is_some() || heartbeat_age_secs(&self.heartbeat_path(&entry.name)).is_some() {
            warn!(database = %entry.name, "clearing stale watcher PID/heartbeat files");
            let _ = std::fs::remove_file(self.pid_path(&entry.name));
            let _ = std::fs::remove_file(self.heartbeat_path(&entry.name));
        }

        let child = std::process::Command::new(&self.daemon_binary)
            .arg(entry.name.as_str())
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HYBRIDRAG_STATE_DIR", &self.state_dir)
            .spawn()
            .map_err(|e| {
                HybridRagError::backend_unavailable(format!(
                    "failed to spawn watcher daemon for {}: {e}",
                    entry.name
                ))
                .with_database(entry.name.clone())
            })?;

        let spawned_pid = child.id();
        let deadline = std::time::Instant::now() + START_WAIT_TIMEOUT;
        while std::time::Instant::now() < deadline {
            let status = self.status(&entry.name);
            if status.running {
                return Ok(status);
            }
            tokio::time::sleep(START_WAIT_POLL).await;
        }

        Err(HybridRagError::deadline_exceeded(format!(
            "watcher daemon (pid {spawned_pid}) did not report a heartbeat within {START_WAIT_TIMEOUT:?}"
        ))
        .with_database(entry.name.clone()))
    }

    pub async fn start_all(&self, entries: &[DatabaseEntry]) -> Vec<(DatabaseName, Result<WatcherStatus>)> {
        let mut results = Vec::new();
        for entry in entries.iter().filter(|e| e.auto_watch) {
            results.push((entry.name.clone(), self.start(entry).await));
        }
        results
    }

    /// Sends `SIGTERM`; the daemon's own `run()` drains on receipt of a stop
    /// signal from its in-process signal channel — the supervisor only needs
    /// to get the process to notice it should shut down.
    pub fn stop(&self, name: &DatabaseName) -> Result<()> {
        let status = self.status(name);
        let Some(pid) = status.pid else {
            return Err(HybridRagError::not_found(format!("no running watcher for {name}")).with_database(name.clone()));
        };

        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                return Err(HybridRagError::internal(format!("kill({pid}, SIGTERM) failed"))
                    .with_database(name.clone()));
            }
        }

        let _ = std::fs::remove_file(self.pid_path(name));
        let _ = std::fs::remove_file(self.heartbeat_path(name));
        let _ = std::fs::remove_file(super::signal_file_path(&self.state_dir, name.as_str()));
        let _ = std::fs::remove_file(super::state_file_path(&self.state_dir, name.as_str()));
        Ok(())
    }

    pub fn stop_all(&self, entries: &[DatabaseEntry]) -> Vec<(DatabaseName, Result<()>)> {
        entries.iter().map(|e| (e.name.clone(), self.stop(&e.name))).collect()
    }

    /// Renders a parameterized systemd unit. This never shells out to
    /// `systemctl`; enabling the unit is left to the operator, per `spec.md`
    /// §6's "indifferent to the exact unit format" note.
    pub fn render_persistent_unit(&self, binary_path: &Path) -> String {
        format!(
            r#"[Unit]
Description=HybridRAG watcher for %i
After=network.target

[Service]
Type=simple
ExecStart={bin} watcher run-foreground %i
Restart=on-failure
RestartSec=10
Environment=HYBRIDRAG_STATE_DIR={state_dir}

[Install]
WantedBy=multi-user.target
"#,
            bin = binary_path.display(),
            state_dir = self.state_dir.display(),
        )
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn heartbeat_age_secs(path: &Path) -> Option<u64> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    Some(modified.elapsed().ok()?.as_secs())
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_status_is_not_running_without_pid_file() {
        let dir = tempdir().unwrap();
        let supervisor = WatcherSupervisor::new(dir.path().to_path_buf(), PathBuf::from("watcher_daemon"));
        let name = DatabaseName::new("proj1").unwrap();
        let status = supervisor.status(&name);
        assert!(!status.running);
    }

    #[test]
    fn test_status_treats_stale_heartbeat_as_not_running() {
        let dir = tempdir().unwrap();
        let watchers_dir = dir.path().join("watchers");
        std::fs::create_dir_all(&watchers_dir).unwrap();
        std::fs::write(watchers_dir.join("proj1.pid"), std::process::id().to_string()).unwrap();
        let heartbeat_path = watchers_dir.join("proj1.heartbeat");
        std::fs::write(&heartbeat_path, "stale").unwrap();

        let stale_time = std::time::SystemTime::now() - Duration::from_secs(300);
        filetime::set_file_mtime(&heartbeat_path, filetime::FileTime::from_system_time(stale_time)).unwrap();

        let supervisor = WatcherSupervisor::new(dir.path().to_path_buf(), PathBuf::from("watcher_daemon"));
        let name = DatabaseName::new("proj1").unwrap();
        assert!(!supervisor.status(&name).running);
    }

    #[test]
    fn test_render_persistent_unit_contains_start_command() {
        let dir = tempdir().unwrap();
        let supervisor = WatcherSupervisor::new(dir.path().to_path_buf(), PathBuf::from("watcher_daemon"));
        let unit = supervisor.render_persistent_unit(Path::new("/usr/local/bin/hybridrag"));
        assert!(unit.contains("ExecStart=/usr/local/bin/hybridrag watcher run-foreground %i"));
        assert!(unit.contains("Restart=on-failure"));
    }
}
