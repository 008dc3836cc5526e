// HybridRAG CLI — process entry point, subcommand dispatch, exit-code
// translation (`spec.md` §6).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hybridrag::registry::{BackendConfig, BackendGeneration, BackendType, Registry, SharedRegistry};
use hybridrag::types::DatabaseName;
use hybridrag::{
    BackendFactory, Classifier, DatabaseEntryBuilder, HybridRagConfig, HybridRagError,
    IngestionItemBuilder, IngestionPipeline, MigrationCoordinator, MigrationOptions,
    ProcessedFilesLedger, SecretRef, ToolRegistry, WatcherDaemon, WatcherSupervisor,
};

macro_rules! qprintln {
    ($quiet:expr, $($arg:tt)*) => {
        if !$quiet {
            println!($($arg)*);
        }
    };
}

#[derive(Parser)]
#[command(name = "hybridrag", version, about = "Multi-tenant knowledge-graph ingestion and retrieval")]
struct Cli {
    /// Overrides the default `~/.hybridrag` state directory (registry file,
    /// watcher PID/heartbeat/signal/state files).
    #[arg(long, global = true, env = "HYBRIDRAG_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Registry operations.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
    /// Watcher daemon supervision.
    Watcher {
        #[command(subcommand)]
        action: WatcherAction,
    },
    /// One-shot or incremental ingestion of a path into a registered database.
    Ingest {
        #[arg(long)]
        database: String,
        #[arg(long)]
        path: PathBuf,
        /// Only ingest files not already in the processed-files ledger.
        #[arg(long)]
        incremental: bool,
        /// Re-ingest everything, ignoring the ledger.
        #[arg(long)]
        fresh: bool,
    },
    /// Backend health/status and provisioning.
    Backend {
        #[command(subcommand)]
        action: BackendAction,
    },
    /// Migrates a database's content to a different backend.
    Migrate {
        database: String,
        #[arg(long = "to")]
        to: String,
        #[arg(long)]
        resume: bool,
        #[arg(long, default_value_t = true)]
        verify: bool,
        #[arg(long = "batch-size")]
        batch_size: Option<usize>,
    },
    /// Runs a single query against a database.
    Query {
        #[arg(long)]
        database: String,
        #[arg(long)]
        text: String,
        #[arg(long, default_value = "local")]
        mode: String,
        #[arg(long = "top-k")]
        top_k: Option<usize>,
    },
    /// Drops into a REPL against a database.
    Interactive {
        #[arg(long)]
        database: String,
    },
}

#[derive(Subcommand)]
enum DbAction {
    Register {
        name: String,
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        source_folder: Option<PathBuf>,
        #[arg(long)]
        auto_watch: bool,
        #[arg(long, default_value_t = 30)]
        watch_interval: u64,
    },
    Unregister {
        name: String,
    },
    List,
    Show {
        name: String,
    },
    Update {
        name: String,
        #[arg(long)]
        auto_watch: Option<bool>,
        #[arg(long)]
        watch_interval: Option<u64>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Forces a registry cache refresh from disk.
    Sync,
}

#[derive(Subcommand)]
enum WatcherAction {
    Start {
        name: String,
        #[arg(long)]
        persistent: bool,
    },
    Stop {
        name: String,
    },
    Status {
        name: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Runs the watcher loop in the calling process. `watcher start` spawns
    /// the dedicated `hybridrag-watcher` binary instead; this exists so a
    /// persistent-service unit's `ExecStart=` can invoke the main binary.
    RunForeground {
        name: String,
    },
}

#[derive(Subcommand)]
enum BackendAction {
    Status {
        #[arg(long)]
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// Prints instructions for provisioning a local server backend container.
    SetupContainer,
    Init {
        #[arg(long)]
        backend: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = hybridrag::init_logging_with_level(cli.verbose, cli.quiet) {
        eprintln!("failed to initialize logging: {e}");
    }

    let config = HybridRagConfig::resolve(cli.state_dir.clone());
    let quiet = cli.quiet;

    let exit_code = match run(cli, &config).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            e.kind.exit_code()
        }
    };
    let _ = quiet;
    std::process::exit(exit_code);
}

async fn run(cli: Cli, config: &HybridRagConfig) -> hybridrag::Result<()> {
    let quiet = cli.quiet;
    let registry: SharedRegistry = Arc::new(Registry::open(config.registry_path())?);

    match cli.command {
        Command::Db { action } => run_db(action, &registry, quiet).await,
        Command::Watcher { action } => run_watcher(action, &registry, config, quiet).await,
        Command::Ingest { database, path, incremental, fresh } => {
            run_ingest(&registry, config, &database, &path, incremental, fresh, quiet).await
        }
        Command::Backend { action } => run_backend(action, &registry, quiet).await,
        Command::Migrate { database, to, resume, verify, batch_size } => {
            run_migrate(&registry, config, &database, &to, resume, verify, batch_size, quiet).await
        }
        Command::Query { database, text, mode, top_k } => {
            run_query(&registry, &database, &text, &mode, top_k, quiet).await
        }
        Command::Interactive { database } => run_interactive(&registry, &database).await,
    }
}

async fn run_db(action: DbAction, registry: &SharedRegistry, quiet: bool) -> hybridrag::Result<()> {
    match action {
        DbAction::Register { name, path, source_folder, auto_watch, watch_interval } => {
            let mut builder = DatabaseEntryBuilder::new()
                .name(name)
                .map_err(|e| HybridRagError::input_invalid(e.to_string()))?
                .path(path)
                .map_err(|e| HybridRagError::input_invalid(e.to_string()))?
                .auto_watch(auto_watch)
                .watch_interval_seconds(watch_interval)
                .map_err(|e| HybridRagError::input_invalid(e.to_string()))?;
            if let Some(source_folder) = source_folder {
                builder = builder
                    .source_folder(source_folder)
                    .map_err(|e| HybridRagError::input_invalid(e.to_string()))?;
            }
            let entry = builder.build().map_err(|e| HybridRagError::input_invalid(e.to_string()))?;
            registry.register(entry)?;
            qprintln!(quiet, "registered database");
            Ok(())
        }
        DbAction::Unregister { name } => {
            registry.unregister(&DatabaseName::new(name)?)?;
            qprintln!(quiet, "unregistered database");
            Ok(())
        }
        DbAction::List => {
            for entry in registry.list()? {
                println!("{}\t{}\t{}", entry.name, entry.backend_type, entry.path);
            }
            Ok(())
        }
        DbAction::Show { name } => {
            let entry = registry.resolve(&DatabaseName::new(name)?)?;
            println!("{}", serde_json::to_string_pretty(&entry).expect("DatabaseEntry is serializable"));
            Ok(())
        }
        DbAction::Update { name, auto_watch, watch_interval, description } => {
            let name = DatabaseName::new(name)?;
            registry.update(&name, move |entry| {
                if let Some(auto_watch) = auto_watch {
                    entry.auto_watch = auto_watch;
                }
                if let Some(watch_interval) = watch_interval {
                    hybridrag::validation::registry::validate_watch_interval(watch_interval)?;
                    entry.watch_interval_seconds = watch_interval;
                }
                if let Some(description) = description {
                    entry.description = description;
                }
                Ok(())
            })?;
            qprintln!(quiet, "updated database");
            Ok(())
        }
        DbAction::Sync => {
            registry.list()?;
            qprintln!(quiet, "registry cache refreshed");
            Ok(())
        }
    }
}

async fn run_watcher(
    action: WatcherAction,
    registry: &SharedRegistry,
    config: &HybridRagConfig,
    quiet: bool,
) -> hybridrag::Result<()> {
    let supervisor = WatcherSupervisor::discover(config.state_dir.clone())?;

    match action {
        WatcherAction::Start { name, persistent } => {
            let entry = registry.resolve(&DatabaseName::new(name)?)?;
            let status = supervisor.start(&entry).await?;
            qprintln!(quiet, "watcher running, pid={:?}", status.pid);
            if persistent {
                let current_exe = std::env::current_exe().map_err(|e| {
                    HybridRagError::internal("failed to resolve current executable").with_source(e.into())
                })?;
                println!("{}", supervisor.render_persistent_unit(&current_exe));
            }
            Ok(())
        }
        WatcherAction::Stop { name } => {
            supervisor.stop(&DatabaseName::new(name)?)?;
            qprintln!(quiet, "watcher stopped");
            Ok(())
        }
        WatcherAction::Status { name, all } => {
            if all || name.is_none() {
                for status in supervisor.status_all(&registry.list()?) {
                    println!("{}\trunning={}\tpid={:?}", status.name, status.running, status.pid);
                }
            } else {
                let name = DatabaseName::new(name.expect("checked above"))?;
                let status = supervisor.status(&name);
                println!("{}\trunning={}\tpid={:?}", status.name, status.running, status.pid);
            }
            Ok(())
        }
        WatcherAction::RunForeground { name } => {
            run_watcher_daemon(registry, config, &DatabaseName::new(name)?).await
        }
    }
}

/// Shared by `watcher run-foreground` and the dedicated `hybridrag-watcher`
/// binary: builds one database's ledger, classifier, pipeline, and daemon,
/// then runs the daemon's scan loop to completion.
pub async fn run_watcher_daemon(
    registry: &SharedRegistry,
    config: &HybridRagConfig,
    name: &DatabaseName,
) -> hybridrag::Result<()> {
    let entry = registry.resolve(name)?;
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
    let daemon = Arc::new(WatcherDaemon::new(entry, ledger, classifier, backend_factory, pipeline, &config.state_dir));
    daemon.run().await
}

#[allow(clippy::too_many_arguments)]
async fn run_ingest(
    registry: &SharedRegistry,
    config: &HybridRagConfig,
    database: &str,
    path: &PathBuf,
    incremental: bool,
    fresh: bool,
    quiet: bool,
) -> hybridrag::Result<()> {
    let name = DatabaseName::new(database)?;
    let entry = registry.resolve(&name)?;
    let ledger = Arc::new(ProcessedFilesLedger::open(entry.path.as_path()).await?);
    let classifier = Classifier::new();
    let backend_factory = Arc::new(BackendFactory::new());
    let pipeline = IngestionPipeline::spawn(
        entry.clone(),
        ledger.clone(),
        backend_factory,
        config.queue_capacity,
        config.worker_count,
    );

    let files: Vec<PathBuf> = if path.is_dir() {
        walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    } else {
        vec![path.clone()]
    };

    let bulk_cutoff_secs = (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp();
    let mut enqueued = 0u32;
    for file in files {
        let raw = match tokio::fs::read(&file).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %file.display(), error = %e, "skipping unreadable file during ingest");
                continue;
            }
        };
        let mtime_secs = tokio::fs::metadata(&file)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let ctx = hybridrag::classifier::PreprocessContext { entry: &entry, file_mtime_secs: mtime_secs, bulk_cutoff_secs };
        let chunks = classifier.classify_and_process(&file, &raw, &ctx)?;

        for chunk in chunks {
            if incremental && !fresh {
                let fingerprint = hybridrag::types::Fingerprint::of_content(chunk.text.as_bytes());
                if ledger.seen(&fingerprint).await? {
                    continue;
                }
            }
            let item = IngestionItemBuilder::new()
                .source_path(&file)
                .map_err(|e| HybridRagError::input_invalid(e.to_string()))?
                .extracted_text(chunk.text)
                .tier_hint(chunk.tier_hint)
                .build()
                .map_err(|e| HybridRagError::input_invalid(e.to_string()))?;
            if pipeline.enqueue(item, &ledger).await? {
                enqueued += 1;
            }
        }
    }

    pipeline.stop(std::time::Duration::from_secs(30)).await;
    qprintln!(quiet, "enqueued {enqueued} ingestion items");
    Ok(())
}

async fn run_backend(action: BackendAction, registry: &SharedRegistry, quiet: bool) -> hybridrag::Result<()> {
    match action {
        BackendAction::Status { name, json } => {
            let entry = registry.resolve(&DatabaseName::new(name)?)?;
            let factory = BackendFactory::new();
            let handles = factory.handles_for(&entry).await?;
            let health = handles.health.check().await?;
            let metrics = handles.metrics.collect().await?;
            if json {
                println!("{}", serde_json::json!({ "health": health, "metrics": metrics }));
            } else {
                println!("connected={} latency_ms={:?}", health.connected, health.latency_ms);
                println!("chunk_count={} total_size={}", metrics.chunk_count, metrics.total_size);
            }
            Ok(())
        }
        BackendAction::SetupContainer => {
            qprintln!(
                quiet,
                "run a local server backend with: docker run -d -p 5432:5432 -e POSTGRES_PASSWORD=hybridrag postgres:16"
            );
            Ok(())
        }
        BackendAction::Init { backend } => {
            let config = default_config_for(parse_backend_type(&backend)?);
            println!("{}", serde_yaml::to_string(&config).expect("BackendConfig is serializable"));
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_migrate(
    registry: &SharedRegistry,
    config: &HybridRagConfig,
    database: &str,
    to: &str,
    resume: bool,
    verify: bool,
    batch_size: Option<usize>,
    quiet: bool,
) -> hybridrag::Result<()> {
    let name = DatabaseName::new(database)?;
    let target_config = default_config_for(parse_backend_type(to)?);

    let backend_factory = Arc::new(BackendFactory::new());
    let supervisor = Arc::new(WatcherSupervisor::discover(config.state_dir.clone())?);
    let coordinator = MigrationCoordinator::new(
        registry.clone(),
        backend_factory,
        supervisor,
        config.state_dir.join("migrations"),
    );

    let options = MigrationOptions { batch_size: batch_size.unwrap_or(1_000), verify, resume };
    let job = coordinator.migrate(&name, target_config, options).await?;
    qprintln!(
        quiet,
        "migration {} ({:?}): {}/{} migrated",
        job.job_id,
        job.status,
        job.counts.migrated,
        job.counts.total
    );
    Ok(())
}

fn parse_backend_type(s: &str) -> hybridrag::Result<BackendType> {
    match s {
        "file-based" => Ok(BackendType::FileBased),
        "server-backed-v1" => Ok(BackendType::ServerBackedV1),
        "server-backed-v2" => Ok(BackendType::ServerBackedV2),
        other => Err(HybridRagError::input_invalid(format!("unknown backend type '{other}'"))),
    }
}

fn default_config_for(backend_type: BackendType) -> BackendConfig {
    match backend_type {
        BackendType::FileBased => BackendConfig::file_based_default(),
        BackendType::ServerBackedV1 | BackendType::ServerBackedV2 => BackendConfig::ServerBacked {
            host: "localhost".to_string(),
            port: 5432,
            user: "hybridrag".to_string(),
            password_ref: SecretRef::new("HYBRIDRAG_DB_PASSWORD"),
            database: "hybridrag".to_string(),
            workspace: "default".to_string(),
            ssl_mode: "prefer".to_string(),
            max_connections: 10,
            vector_index_kind: "hnsw".to_string(),
            hnsw_m: 16,
            hnsw_ef: 64,
            connection_string: None,
            generation: if backend_type == BackendType::ServerBackedV2 { BackendGeneration::V2 } else { BackendGeneration::V1 },
        },
    }
}

async fn run_query(
    registry: &SharedRegistry,
    database: &str,
    text: &str,
    mode: &str,
    top_k: Option<usize>,
    quiet: bool,
) -> hybridrag::Result<()> {
    let name = DatabaseName::new(database)?;
    let _ = registry.resolve(&name)?;
    let backend_factory = Arc::new(BackendFactory::new());
    let dispatcher = ToolRegistry::new(registry.clone(), backend_factory);

    let tool_name = tool_name_for_mode(mode)?;
    let response = dispatcher.dispatch(tool_name, &name, text, top_k, None).await?;
    if quiet {
        println!("{}", response.result);
    } else {
        println!("{}", serde_json::to_string_pretty(&response).expect("DispatchResponse is serializable"));
    }
    Ok(())
}

fn tool_name_for_mode(mode: &str) -> hybridrag::Result<&'static str> {
    match mode {
        "local" => Ok("local-query"),
        "global" => Ok("global-query"),
        "hybrid" => Ok("hybrid-query"),
        "generic" => Ok("generic-query"),
        "multihop" => Ok("multihop-query"),
        other => Err(HybridRagError::input_invalid(format!("unknown query mode '{other}'"))),
    }
}

async fn run_interactive(registry: &SharedRegistry, database: &str) -> hybridrag::Result<()> {
    let name = DatabaseName::new(database)?;
    let _ = registry.resolve(&name)?;
    let backend_factory = Arc::new(BackendFactory::new());
    let dispatcher = ToolRegistry::new(registry.clone(), backend_factory);

    println!("interactive session against '{name}'; empty line to quit");
    let stdin = std::io::stdin();
    loop {
        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 || line.trim().is_empty() {
            break;
        }
        match dispatcher.dispatch("local-query", &name, line.trim(), None, None).await {
            Ok(response) => println!("{}", response.result),
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(())
}
