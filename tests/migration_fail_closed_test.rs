// Migration fail-closed path (`spec.md` §4.9, §8): a migration must never
// proceed against a database whose watcher has not actually reached the
// paused state, since an in-flight watcher write racing a migration copy
// is exactly the corruption this interlock exists to prevent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hybridrag::{BackendConfig, BackendFactory, DatabaseEntryBuilder, MigrationCoordinator, MigrationOptions, Registry, WatcherSupervisor};
use tempfile::tempdir;

#[tokio::test]
async fn migration_aborts_and_releases_lease_when_watcher_never_pauses() {
    let dir = tempdir().unwrap();
    let entry = DatabaseEntryBuilder::new()
        .name("proj1")
        .unwrap()
        .path(dir.path().join("proj1"))
        .unwrap()
        .build()
        .unwrap();

    let registry = Arc::new(Registry::open(dir.path().join("registry.yaml")).unwrap());
    registry.register(entry.clone()).unwrap();

    let factory = Arc::new(BackendFactory::new());
    // No watcher daemon process runs against this registry at all, so no
    // PID/heartbeat/state file is ever written and the pause handshake can
    // never be satisfied.
    let supervisor = Arc::new(WatcherSupervisor::new(dir.path().to_path_buf(), PathBuf::from("watcher_daemon")));
    let coordinator = MigrationCoordinator::new(registry.clone(), factory, supervisor, dir.path().join("migrations"))
        .with_pause_timeout(Duration::from_millis(200));

    let target_config = BackendConfig::file_based_default();
    let err = coordinator
        .migrate(&entry.name, target_config, MigrationOptions { batch_size: 10, verify: false, resume: false })
        .await
        .unwrap_err();

    assert_eq!(err.kind, hybridrag::ErrorKind::DeadlineExceeded);

    // Fail-closed also means the exclusive migration lease is released on
    // abort, not leaked: a second job for the same database must be able to
    // claim it immediately afterward.
    registry.claim_migration_lease(&entry.name, "next-job").unwrap();
}
