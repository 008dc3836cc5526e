// Process-level configuration (`spec.md` §6 external interfaces): where the
// registry file and watcher PID/heartbeat/signal/state files live, and the
// pipeline's default queue/worker sizing. Layered env > flag > default,
// following `mcp::config::MCPConfig`'s per-concern struct shape, collapsed
// here to the handful of knobs this crate's CLI actually exposes.

use std::path::PathBuf;

use crate::pipeline::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_COUNT};

const DEFAULT_STATE_DIR_NAME: &str = ".hybridrag";

#[derive(Debug, Clone)]
pub struct HybridRagConfig {
    pub state_dir: PathBuf,
    pub queue_capacity: usize,
    pub worker_count: usize,
}

impl HybridRagConfig {
    /// Resolves the state directory from, in priority order: an explicit CLI
    /// flag, the `HYBRIDRAG_STATE_DIR` env var, or `~/.hybridrag`.
    pub fn resolve(state_dir_flag: Option<PathBuf>) -> Self {
        let state_dir = state_dir_flag
            .or_else(|| std::env::var_os("HYBRIDRAG_STATE_DIR").map(PathBuf::from))
            .unwrap_or_else(default_state_dir);

        Self {
            state_dir,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_count: DEFAULT_WORKER_COUNT,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("registry.yaml")
    }
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(DEFAULT_STATE_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_flag_wins_over_default() {
        let config = HybridRagConfig::resolve(Some(PathBuf::from("/tmp/explicit-state")));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/explicit-state"));
    }

    #[test]
    fn test_registry_path_is_under_state_dir() {
        let config = HybridRagConfig::resolve(Some(PathBuf::from("/tmp/explicit-state")));
        assert_eq!(config.registry_path(), PathBuf::from("/tmp/explicit-state/registry.yaml"));
    }
}
