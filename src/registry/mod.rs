// Multi-tenant database registry: a single YAML file holding one
// `DatabaseEntry` per registered database, an on-disk write lock, and a
// reader/writer cache that self-invalidates when the file changes under it.
//
// Grounded on the self-file mtime-watch and atomic write-temp/fsync/rename
// discipline used for checkpoint files across this crate (see
// `migration::checkpoint`), generalized here to the registry's own backing
// file and given an explicit `notify`-driven invalidation path instead of a
// poll.

use crate::error::{HybridRagError, Result};
use crate::types::{DatabaseName, SecretRef, ValidatedPath};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// One of the four preprocessing selectors from the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    Generic,
    ConversationExtraction,
    ApiPulled,
    Schema,
}

impl Default for SourceType {
    fn default() -> Self {
        SourceType::Generic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendType {
    FileBased,
    ServerBackedV1,
    ServerBackedV2,
}

impl Default for BackendType {
    fn default() -> Self {
        BackendType::FileBased
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendType::FileBased => "file-based",
            BackendType::ServerBackedV1 => "server-backed-v1",
            BackendType::ServerBackedV2 => "server-backed-v2",
        };
        write!(f, "{s}")
    }
}

/// Polymorphic backend configuration. `backend_type` on `DatabaseEntry` must
/// stay consistent with whichever variant is stored here; `BackendConfig`
/// itself enforces that by construction (there is no way to build a
/// `FileBased` value carrying connection fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend_type", rename_all = "kebab-case")]
pub enum BackendConfig {
    FileBased {
        file_size_warning_mb: f64,
        total_size_warning_mb: f64,
        performance_degradation_pct: f64,
    },
    ServerBacked {
        host: String,
        port: u32,
        user: String,
        password_ref: SecretRef,
        database: String,
        workspace: String,
        ssl_mode: String,
        max_connections: u32,
        vector_index_kind: String,
        hnsw_m: u32,
        hnsw_ef: u32,
        connection_string: Option<SecretRef>,
        generation: BackendGeneration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendGeneration {
    V1,
    V2,
}

impl BackendConfig {
    pub fn file_based_default() -> Self {
        BackendConfig::FileBased {
            file_size_warning_mb: 500.0,
            total_size_warning_mb: 5_000.0,
            performance_degradation_pct: 20.0,
        }
    }

    pub fn backend_type(&self) -> BackendType {
        match self {
            BackendConfig::FileBased { .. } => BackendType::FileBased,
            BackendConfig::ServerBacked {
                generation: BackendGeneration::V1,
                ..
            } => BackendType::ServerBackedV1,
            BackendConfig::ServerBacked {
                generation: BackendGeneration::V2,
                ..
            } => BackendType::ServerBackedV2,
        }
    }

    /// `spec.md` §3 "Validation:" paragraph.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            BackendConfig::FileBased { .. } => Ok(()),
            BackendConfig::ServerBacked {
                port,
                max_connections,
                vector_index_kind,
                connection_string,
                host,
                database,
                ..
            } => {
                crate::validation::backend::validate_port(*port)?;
                crate::validation::backend::validate_max_connections(*max_connections)?;
                crate::validation::backend::validate_vector_index_kind(vector_index_kind)?;
                if connection_string.is_none() && (host.is_empty() || database.is_empty()) {
                    anyhow::bail!(
                        "server-backed config requires either connection_string or explicit host/database"
                    );
                }
                Ok(())
            }
        }
    }

    /// Renders credential fields as `<masked>`, safe to print or log.
    pub fn masked_summary(&self) -> serde_json::Value {
        let raw = serde_json::to_value(self).expect("BackendConfig always serializes");
        crate::observability::mask_credentials(&raw)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub llm_model: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_dim: Option<u32>,
    #[serde(default)]
    pub provider_keys: BTreeMap<String, SecretRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub name: DatabaseName,
    pub path: ValidatedPath,
    pub source_folder: Option<ValidatedPath>,
    pub source_type: SourceType,
    pub file_extensions: Vec<String>,
    pub recursive: bool,
    pub preprocessing_pipeline: Vec<String>,
    pub auto_watch: bool,
    pub watch_interval_seconds: u64,
    pub backend_type: BackendType,
    pub backend_config: BackendConfig,
    pub model_config: ModelConfig,
    pub description: String,
}

impl DatabaseEntry {
    /// Registration is idempotent on `name`: two entries are "the same
    /// registration" if every field but transient runtime state matches.
    fn registration_equivalent(&self, other: &DatabaseEntry) -> bool {
        serde_json::to_value(self).ok() == serde_json::to_value(other).ok()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    databases: BTreeMap<String, DatabaseEntry>,
    #[serde(default)]
    migration_leases: BTreeMap<String, String>,
}

struct CachedState {
    file: RegistryFile,
    loaded_at: SystemTime,
    source_mtime: Option<SystemTime>,
}

/// The registry. Reads are lock-free after the first load; writes serialize
/// through an on-disk lock file with a 5-second acquisition timeout.
pub struct Registry {
    registry_path: PathBuf,
    lock_path: PathBuf,
    cache: RwLock<CachedState>,
    _watcher: Option<RecommendedWatcher>,
    fs_events: Option<Receiver<notify::Result<notify::Event>>>,
}

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl Registry {
    pub fn open(registry_path: impl Into<PathBuf>) -> Result<Self> {
        let registry_path = registry_path.into();
        let lock_path = registry_path.with_extension("lock");

        if let Some(parent) = registry_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                HybridRagError::internal("failed to create registry directory").with_source(e.into())
            })?;
        }

        let file = Self::load_from_disk(&registry_path)?;
        let source_mtime = fs::metadata(&registry_path).ok().and_then(|m| m.modified().ok());

        let (watcher, fs_events) = Self::watch_self(&registry_path);

        Ok(Self {
            registry_path,
            lock_path,
            cache: RwLock::new(CachedState {
                file,
                loaded_at: SystemTime::now(),
                source_mtime,
            }),
            _watcher: watcher,
            fs_events,
        })
    }

    fn watch_self(
        registry_path: &Path,
    ) -> (Option<RecommendedWatcher>, Option<Receiver<notify::Result<notify::Event>>>) {
        let (tx, rx) = channel();
        match RecommendedWatcher::new(tx, notify::Config::default()) {
            Ok(mut watcher) => {
                let watch_target = registry_path.parent().unwrap_or_else(|| Path::new("."));
                match watcher.watch(watch_target, RecursiveMode::NonRecursive) {
                    Ok(()) => (Some(watcher), Some(rx)),
                    Err(e) => {
                        warn!("registry self-watch unavailable: {e}");
                        (None, None)
                    }
                }
            }
            Err(e) => {
                warn!("registry self-watch unavailable: {e}");
                (None, None)
            }
        }
    }

    fn load_from_disk(path: &Path) -> Result<RegistryFile> {
        if !path.exists() {
            return Ok(RegistryFile::default());
        }
        let raw = fs::read_to_string(path).map_err(|e| {
            HybridRagError::internal(format!("failed to read registry file {}", path.display()))
                .with_source(e.into())
        })?;
        serde_yaml::from_str(&raw).or_else(|primary_err| {
            let backup = path.with_extension("yaml.lastgood");
            if backup.exists() {
                warn!(
                    "registry file corrupt ({primary_err}), falling back to {}",
                    backup.display()
                );
                let raw = fs::read_to_string(&backup).map_err(|e| {
                    HybridRagError::internal("failed to read registry backup").with_source(e.into())
                })?;
                serde_yaml::from_str(&raw).map_err(|e| {
                    HybridRagError::internal("registry backup also corrupt").with_source(e.into())
                })
            } else {
                Err(HybridRagError::internal(format!(
                    "registry file corrupt and no backup present: {primary_err}"
                )))
            }
        })
    }

    /// Drains any pending filesystem events and reloads if the backing file's
    /// mtime has moved since the cache was populated. Called at the top of
    /// every read/write so external edits (an operator hand-editing
    /// credentials) are picked up without a restart.
    fn refresh_if_stale(&self) -> Result<()> {
        if let Some(rx) = &self.fs_events {
            while rx.try_recv().is_ok() {}
        }

        let disk_mtime = fs::metadata(&self.registry_path).ok().and_then(|m| m.modified().ok());
        let needs_reload = {
            let cache = self.cache.read().expect("registry cache lock poisoned");
            disk_mtime != cache.source_mtime
        };

        if needs_reload {
            debug!("registry backing file changed externally, reloading cache");
            let file = Self::load_from_disk(&self.registry_path)?;
            let mut cache = self.cache.write().expect("registry cache lock poisoned");
            cache.file = file;
            cache.loaded_at = SystemTime::now();
            cache.source_mtime = disk_mtime;
        }
        Ok(())
    }

    fn acquire_lock(&self) -> Result<fs::File> {
        let deadline = std::time::Instant::now() + LOCK_TIMEOUT;
        loop {
            match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&self.lock_path)
            {
                Ok(f) => return Ok(f),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if std::time::Instant::now() >= deadline {
                        return Err(HybridRagError::busy("registry lock acquisition timed out"));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(HybridRagError::internal("failed to create registry lock")
                        .with_source(e.into()))
                }
            }
        }
    }

    fn release_lock(&self) {
        let _ = fs::remove_file(&self.lock_path);
    }

    fn persist(&self, file: &RegistryFile) -> Result<()> {
        let yaml = serde_yaml::to_string(file)
            .map_err(|e| HybridRagError::internal("failed to serialize registry").with_source(e.into()))?;

        let tmp_path = self.registry_path.with_extension("yaml.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path).map_err(|e| {
                HybridRagError::internal("failed to create registry temp file").with_source(e.into())
            })?;
            tmp.write_all(yaml.as_bytes()).map_err(|e| {
                HybridRagError::internal("failed to write registry temp file").with_source(e.into())
            })?;
            tmp.sync_all().map_err(|e| {
                HybridRagError::internal("failed to fsync registry temp file").with_source(e.into())
            })?;
        }

        if self.registry_path.exists() {
            let backup = self.registry_path.with_extension("yaml.lastgood");
            let _ = fs::copy(&self.registry_path, backup);
        }

        fs::rename(&tmp_path, &self.registry_path).map_err(|e| {
            HybridRagError::internal("failed to atomically replace registry file").with_source(e.into())
        })?;

        Ok(())
    }

    pub fn register(&self, entry: DatabaseEntry) -> Result<()> {
        self.refresh_if_stale()?;
        let _lock = self.acquire_lock()?;

        let mut cache = self.cache.write().expect("registry cache lock poisoned");
        if let Some(existing) = cache.file.databases.get(entry.name.as_str()) {
            if existing.registration_equivalent(&entry) {
                self.release_lock();
                return Ok(());
            }
            self.release_lock();
            return Err(HybridRagError::conflict(format!(
                "database '{}' is already registered with different settings",
                entry.name
            ))
            .with_database(entry.name));
        }

        cache.file.databases.insert(entry.name.as_str().to_string(), entry);
        let snapshot = RegistryFile {
            databases: cache.file.databases.clone(),
            migration_leases: cache.file.migration_leases.clone(),
        };
        drop(cache);

        let result = self.persist(&snapshot);
        self.release_lock();
        result?;

        let mut cache = self.cache.write().expect("registry cache lock poisoned");
        cache.source_mtime = fs::metadata(&self.registry_path).ok().and_then(|m| m.modified().ok());
        info!("registered database");
        Ok(())
    }

    pub fn unregister(&self, name: &DatabaseName) -> Result<()> {
        self.refresh_if_stale()?;
        let _lock = self.acquire_lock()?;

        let mut cache = self.cache.write().expect("registry cache lock poisoned");
        if cache.file.databases.remove(name.as_str()).is_none() {
            self.release_lock();
            return Err(HybridRagError::not_found(format!("database '{name}' is not registered"))
                .with_database(name.clone()));
        }
        let snapshot = RegistryFile {
            databases: cache.file.databases.clone(),
            migration_leases: cache.file.migration_leases.clone(),
        };
        drop(cache);

        let result = self.persist(&snapshot);
        self.release_lock();
        result
    }

    pub fn list(&self) -> Result<Vec<DatabaseEntry>> {
        self.refresh_if_stale()?;
        let cache = self.cache.read().expect("registry cache lock poisoned");
        Ok(cache.file.databases.values().cloned().collect())
    }

    pub fn resolve(&self, name: &DatabaseName) -> Result<DatabaseEntry> {
        self.refresh_if_stale()?;
        let cache = self.cache.read().expect("registry cache lock poisoned");
        cache
            .file
            .databases
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| {
                HybridRagError::not_found(format!("database '{name}' is not registered"))
                    .with_database(name.clone())
            })
    }

    pub fn update<F>(&self, name: &DatabaseName, mutate: F) -> Result<DatabaseEntry>
    where
        F: FnOnce(&mut DatabaseEntry) -> anyhow::Result<()>,
    {
        self.refresh_if_stale()?;
        let _lock = self.acquire_lock()?;

        let mut cache = self.cache.write().expect("registry cache lock poisoned");
        let Some(entry) = cache.file.databases.get_mut(name.as_str()) else {
            self.release_lock();
            return Err(HybridRagError::not_found(format!("database '{name}' is not registered"))
                .with_database(name.clone()));
        };

        if let Err(e) = mutate(entry) {
            self.release_lock();
            return Err(HybridRagError::input_invalid(e.to_string()).with_database(name.clone()));
        }
        let updated = entry.clone();

        let snapshot = RegistryFile {
            databases: cache.file.databases.clone(),
            migration_leases: cache.file.migration_leases.clone(),
        };
        drop(cache);

        let result = self.persist(&snapshot);
        self.release_lock();
        result?;
        Ok(updated)
    }

    /// Acquires an exclusive migration lease, failing with *conflict* if one
    /// is already held for this database (`spec.md` §4.9 phase 1).
    pub fn claim_migration_lease(&self, name: &DatabaseName, job_id: &str) -> Result<()> {
        self.refresh_if_stale()?;
        let _lock = self.acquire_lock()?;

        let mut cache = self.cache.write().expect("registry cache lock poisoned");
        if cache.file.migration_leases.contains_key(name.as_str()) {
            self.release_lock();
            return Err(HybridRagError::conflict(format!(
                "migration already in progress for database '{name}'"
            ))
            .with_database(name.clone()));
        }
        cache
            .file
            .migration_leases
            .insert(name.as_str().to_string(), job_id.to_string());
        let snapshot = RegistryFile {
            databases: cache.file.databases.clone(),
            migration_leases: cache.file.migration_leases.clone(),
        };
        drop(cache);

        let result = self.persist(&snapshot);
        self.release_lock();
        result
    }

    pub fn release_migration_lease(&self, name: &DatabaseName) -> Result<()> {
        self.refresh_if_stale()?;
        let _lock = self.acquire_lock()?;

        let mut cache = self.cache.write().expect("registry cache lock poisoned");
        cache.file.migration_leases.remove(name.as_str());
        let snapshot = RegistryFile {
            databases: cache.file.databases.clone(),
            migration_leases: cache.file.migration_leases.clone(),
        };
        drop(cache);

        let result = self.persist(&snapshot);
        self.release_lock();
        result
    }

    /// Atomically swaps `backend_type`/`backend_config` at migration promote
    /// time (`spec.md` §4.9 phase 7).
    pub fn promote_backend(
        &self,
        name: &DatabaseName,
        new_config: BackendConfig,
    ) -> Result<DatabaseEntry> {
        new_config
            .validate()
            .map_err(|e| HybridRagError::input_invalid(e.to_string()).with_database(name.clone()))?;
        self.update(name, move |entry| {
            entry.backend_type = new_config.backend_type();
            entry.backend_config = new_config;
            Ok(())
        })
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

pub type SharedRegistry = Arc<Registry>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entry(name: &str, dir: &Path) -> DatabaseEntry {
        crate::builders::DatabaseEntryBuilder::new()
            .name(name)
            .unwrap()
            .path(dir.join(name))
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_list_resolve_unregister_roundtrip() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(dir.path().join("registry.yaml")).unwrap();
        let entry = sample_entry("proj1", dir.path());

        registry.register(entry.clone()).unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);

        let resolved = registry.resolve(&entry.name).unwrap();
        assert_eq!(resolved.name, entry.name);

        registry.unregister(&entry.name).unwrap();
        assert!(registry.resolve(&entry.name).is_err());
    }

    #[test]
    fn test_register_is_idempotent_on_identical_fields() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(dir.path().join("registry.yaml")).unwrap();
        let entry = sample_entry("proj1", dir.path());

        registry.register(entry.clone()).unwrap();
        registry.register(entry).unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn test_register_conflict_on_divergent_fields() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(dir.path().join("registry.yaml")).unwrap();
        let mut entry = sample_entry("proj1", dir.path());
        registry.register(entry.clone()).unwrap();

        entry.description = "changed".to_string();
        let err = registry.register(entry).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn test_unregister_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(dir.path().join("registry.yaml")).unwrap();
        let name = DatabaseName::new("ghost").unwrap();
        let err = registry.unregister(&name).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_migration_lease_is_exclusive() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(dir.path().join("registry.yaml")).unwrap();
        let entry = sample_entry("proj1", dir.path());
        registry.register(entry.clone()).unwrap();

        registry.claim_migration_lease(&entry.name, "job-1").unwrap();
        let err = registry.claim_migration_lease(&entry.name, "job-2").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);

        registry.release_migration_lease(&entry.name).unwrap();
        registry.claim_migration_lease(&entry.name, "job-3").unwrap();
    }

    #[test]
    fn test_backend_config_masked_summary_hides_password() {
        let config = BackendConfig::ServerBacked {
            host: "db.internal".to_string(),
            port: 5432,
            user: "hybridrag".to_string(),
            password_ref: SecretRef::new("HYBRIDRAG_DB_PASSWORD"),
            database: "proj1".to_string(),
            workspace: "default".to_string(),
            ssl_mode: "require".to_string(),
            max_connections: 10,
            vector_index_kind: "hnsw".to_string(),
            hnsw_m: 16,
            hnsw_ef: 64,
            connection_string: None,
            generation: BackendGeneration::V1,
        };
        let summary = config.masked_summary();
        assert_eq!(summary["password_ref"], "<masked>");
        assert_eq!(summary["host"], "db.internal");
    }

    #[test]
    fn test_registry_survives_external_edit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.yaml");
        let registry = Registry::open(&path).unwrap();
        let entry = sample_entry("proj1", dir.path());
        registry.register(entry).unwrap();

        // Simulate an operator hand-editing the file directly.
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push_str("\n# operator comment\n");
        fs::write(&path, raw).unwrap();

        assert_eq!(registry.list().unwrap().len(), 1);
    }
}
