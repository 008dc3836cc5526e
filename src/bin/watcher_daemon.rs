// Dedicated watcher process, spawned by `WatcherSupervisor::start` as a
// child of the CLI process so a crash in the ingestion loop cannot bring the
// CLI down with it (`spec.md` §4.7).
//
// Invocation: `hybridrag-watcher <database-name>`, with `HYBRIDRAG_STATE_DIR`
// inherited from the parent.

use std::sync::Arc;

use hybridrag::{
    BackendFactory, Classifier, HybridRagConfig, IngestionPipeline, ProcessedFilesLedger, Registry,
    WatcherDaemon,
};

#[tokio::main]
async fn main() {
    if let Err(e) = hybridrag::init_logging() {
        eprintln!("failed to initialize logging: {e}");
    }

    let name = match std::env::args().nth(1) {
        Some(name) => name,
        None => {
            eprintln!("usage: hybridrag-watcher <database-name>");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&name).await {
        eprintln!("watcher daemon failed: {e}");
        std::process::exit(e.kind.exit_code());
    }
}

async fn run(name: &str) -> hybridrag::Result<()> {
    let config = HybridRagConfig::resolve(None);
    let registry = Registry::open(config.registry_path())?;
    let name = hybridrag::DatabaseName::new(name)?;
    let entry = registry.resolve(&name)?;

    let ledger = Arc::new(ProcessedFilesLedger::open(entry.path.as_path()).await?);
    let classifier = Arc::new(Classifier::new());
    let backend_factory = Arc::new(BackendFactory::new());
    let pipeline = Arc::new(IngestionPipeline::spawn(
        entry.clone(),
        ledger.clone(),
        backend_factory.clone(),
        config.queue_capacity,
        config.worker_count,
    ));
    let daemon = Arc::new(WatcherDaemon::new(
        entry,
        ledger,
        classifier,
        backend_factory,
        pipeline,
        &config.state_dir,
    ));
    daemon.run().await
}
