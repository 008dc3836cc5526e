// HybridRAG — operational fabric around a knowledge-graph RAG engine.
// Root library module.

pub mod backend;
pub mod builders;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod migration;
pub mod observability;
pub mod pipeline;
pub mod pure;
pub mod registry;
pub mod types;
pub mod validation;
pub mod watcher;
pub mod wrappers;

pub use error::{ErrorKind, HybridRagError, Result};

pub use types::{
    DatabaseName, Fingerprint, IngestTier, NonZeroSize, SecretRef, Tier, TopK, ValidatedPath,
    ValidatedTimestamp, WatchInterval,
};

pub use builders::{DatabaseEntryBuilder, IngestionItemBuilder};

pub use registry::{BackendConfig, BackendType, DatabaseEntry, Registry, SharedRegistry};

pub use backend::{BackendFactory, BackendHandles};

pub use engine::{HealthProbe, HealthStatus, Metrics, MigrationRecord, StorageHandle, StorageMetrics};

pub use ledger::ProcessedFilesLedger;

pub use classifier::{Classifier, GenericPreprocessor, Preprocessor};

pub use pipeline::IngestionPipeline;

pub use watcher::WatcherDaemon;
pub use watcher::supervisor::WatcherSupervisor;

pub use dispatcher::{ToolRegistry, DispatchResponse, TaskHandle, TaskProgress, TaskStatus};

pub use migration::{MigrationCoordinator, MigrationJob, MigrationOptions, MigrationStatus};

pub use observability::{init_logging, init_logging_with_level};

pub use config::HybridRagConfig;
