// Backend Config & Factory (`spec.md` §4.2).
//
// Given a `DatabaseEntry`, produces the engine handles bound to that
// database's chosen backend, caching them by database name so repeated tool
// calls reuse one connection pool rather than opening a fresh one per
// request. File-based health/metrics walk the working directory directly;
// server-backed health/metrics open a pooled connection, grounded on
// `supabase_repository::SupabaseRepositoryStore`'s `PgPool`-holding shape.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::engine::{HealthProbe, HealthStatus, InMemoryEngine, Metrics, StorageHandle, StorageMetrics};
use crate::error::{HybridRagError, Result};
use crate::registry::{BackendConfig, DatabaseEntry};
use crate::types::DatabaseName;

/// The three handles the factory hands back for one database (`spec.md` §4.2).
pub struct BackendHandles {
    pub storage: Arc<dyn StorageHandle>,
    pub health: Arc<dyn HealthProbe>,
    pub metrics: Arc<dyn Metrics>,
}

impl Clone for BackendHandles {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            health: self.health.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Caches `BackendHandles` per database name. Invalidated whenever a
/// registry `update` touches backend fields (called explicitly by callers
/// that mutate the registry, since the factory has no registry-change feed
/// of its own).
pub struct BackendFactory {
    cache: DashMap<DatabaseName, BackendHandles>,
}

impl BackendFactory {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    pub fn invalidate(&self, name: &DatabaseName) {
        self.cache.remove(name);
    }

    pub async fn handles_for(&self, entry: &DatabaseEntry) -> Result<BackendHandles> {
        if let Some(cached) = self.cache.get(&entry.name) {
            return Ok(cached.clone());
        }

        let handles = match &entry.backend_config {
            BackendConfig::FileBased { .. } => Self::build_file_based(entry).await?,
            BackendConfig::ServerBacked { .. } => Self::build_server_backed(entry).await?,
        };

        self.cache.insert(entry.name.clone(), handles.clone());
        Ok(handles)
    }

    async fn build_file_based(entry: &DatabaseEntry) -> Result<BackendHandles> {
        std::fs::create_dir_all(entry.path.as_path()).map_err(|e| {
            HybridRagError::backend_unavailable(format!(
                "cannot create working directory {}",
                entry.path
            ))
            .with_database(entry.name.clone())
            .with_source(e.into())
        })?;

        let engine = Arc::new(InMemoryEngine::new(entry.name.clone()));
        Ok(BackendHandles {
            storage: engine.clone(),
            health: FileBasedHealthProbe::new(entry.path.as_path().to_path_buf()).into_arc(),
            metrics: FileBasedMetrics::new(entry.path.as_path().to_path_buf()).into_arc(),
        })
    }

    async fn build_server_backed(entry: &DatabaseEntry) -> Result<BackendHandles> {
        let BackendConfig::ServerBacked {
            host,
            port,
            user,
            password_ref,
            database,
            connection_string,
            max_connections,
            ..
        } = &entry.backend_config
        else {
            unreachable!("build_server_backed called on a non-server-backed config");
        };

        let url = if let Some(conn) = connection_string {
            conn.reveal().ok_or_else(|| {
                HybridRagError::input_invalid("connection_string secret could not be resolved")
                    .with_database(entry.name.clone())
            })?
        } else {
            let password = password_ref.reveal().ok_or_else(|| {
                HybridRagError::input_invalid("password_ref secret could not be resolved")
                    .with_database(entry.name.clone())
            })?;
            format!("postgres://{user}:{password}@{host}:{port}/{database}")
        };

        let pool = PgPoolOptions::new()
            .max_connections(*max_connections)
            .connect(&url)
            .await
            .map_err(|e| {
                HybridRagError::backend_unavailable(format!("failed to connect to server backend for {}", entry.name))
                    .with_database(entry.name.clone())
                    .with_source(e.into())
            })?;

        info!(database = %entry.name, "opened server-backed connection pool");

        Ok(BackendHandles {
            storage: Arc::new(ServerBackedStorage {
                database: entry.name.clone(),
                pool: pool.clone(),
            }),
            health: Arc::new(ServerBackedHealthProbe { pool: pool.clone() }),
            metrics: Arc::new(ServerBackedMetrics {
                database: entry.name.clone(),
                pool,
            }),
        })
    }
}

impl Default for BackendFactory {
    fn default() -> Self {
        Self::new()
    }
}

struct FileBasedHealthProbe {
    path: std::path::PathBuf,
}

impl FileBasedHealthProbe {
    fn new(path: std::path::PathBuf) -> Self {
        Self { path }
    }

    fn into_arc(self) -> Arc<dyn HealthProbe> {
        Arc::new(self)
    }
}

#[async_trait]
impl HealthProbe for FileBasedHealthProbe {
    async fn check(&self) -> Result<HealthStatus> {
        let start = Instant::now();
        let readable = self.path.metadata().map(|m| !m.permissions().readonly()).unwrap_or(false)
            || self.path.exists();
        Ok(HealthStatus {
            connected: readable,
            latency_ms: Some(start.elapsed().as_millis() as u64),
            detail: if readable { None } else { Some("path unreadable".to_string()) },
        })
    }
}

struct FileBasedMetrics {
    path: std::path::PathBuf,
}

impl FileBasedMetrics {
    fn new(path: std::path::PathBuf) -> Self {
        Self { path }
    }

    fn into_arc(self) -> Arc<dyn Metrics> {
        Arc::new(self)
    }
}

#[async_trait]
impl Metrics for FileBasedMetrics {
    async fn collect(&self) -> Result<StorageMetrics> {
        let mut file_sizes = std::collections::HashMap::new();
        let mut total_size = 0u64;
        if let Ok(entries) = walk_files(&self.path) {
            for (name, size) in entries {
                total_size += size;
                file_sizes.insert(name, size);
            }
        }
        Ok(StorageMetrics {
            backend_type: "file-based".to_string(),
            connected: self.path.exists(),
            connection_latency_ms: None,
            file_sizes: Some(file_sizes),
            total_size,
            entity_count: 0,
            relation_count: 0,
            chunk_count: 0,
            doc_count: 0,
            warnings: Vec::new(),
        })
    }
}

fn walk_files(root: &Path) -> std::io::Result<Vec<(String, u64)>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            out.push((entry.file_name().to_string_lossy().to_string(), meta.len()));
        }
    }
    Ok(out)
}

struct ServerBackedStorage {
    database: DatabaseName,
    pool: PgPool,
}

#[async_trait]
impl StorageHandle for ServerBackedStorage {
    fn database(&self) -> &DatabaseName {
        &self.database
    }

    async fn insert(&self, text: &str, metadata: &serde_json::Value) -> Result<()> {
        sqlx::query("INSERT INTO hybridrag_chunks (workspace, content, metadata) VALUES ($1, $2, $3)")
            .bind(self.database.as_str())
            .bind(text)
            .bind(metadata)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                HybridRagError::engine_transient("server-backed insert failed")
                    .with_database(self.database.clone())
                    .with_source(e.into())
            })?;
        Ok(())
    }

    async fn query(&self, text: &str, top_k: usize, _tier: crate::types::Tier) -> Result<serde_json::Value> {
        let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
            "SELECT content, metadata FROM hybridrag_chunks WHERE workspace = $1 AND content ILIKE $2 LIMIT $3",
        )
        .bind(self.database.as_str())
        .bind(format!("%{text}%"))
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            HybridRagError::engine_transient("server-backed query failed")
                .with_database(self.database.clone())
                .with_source(e.into())
        })?;

        let hits: Vec<serde_json::Value> = rows
            .into_iter()
            .map(|(content, metadata)| serde_json::json!({ "text": content, "metadata": metadata }))
            .collect();
        Ok(serde_json::json!({ "hits": hits }))
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn store_count(&self, _store: &str) -> Result<u64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hybridrag_chunks WHERE workspace = $1")
            .bind(self.database.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                HybridRagError::engine_transient("server-backed count failed")
                    .with_database(self.database.clone())
                    .with_source(e.into())
            })?;
        Ok(count.0 as u64)
    }

    async fn export_batch(
        &self,
        _store: &str,
        after_key: Option<&str>,
        batch_size: usize,
    ) -> Result<Vec<crate::engine::MigrationRecord>> {
        let after_id: i64 = after_key.and_then(|k| k.parse().ok()).unwrap_or(0);
        let rows: Vec<(i64, String, serde_json::Value)> = sqlx::query_as(
            "SELECT id, content, metadata FROM hybridrag_chunks WHERE workspace = $1 AND id > $2 ORDER BY id LIMIT $3",
        )
        .bind(self.database.as_str())
        .bind(after_id)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            HybridRagError::engine_transient("server-backed export failed")
                .with_database(self.database.clone())
                .with_source(e.into())
        })?;

        Ok(rows
            .into_iter()
            .map(|(id, content, metadata)| crate::engine::MigrationRecord {
                key: id.to_string(),
                text: content,
                metadata,
            })
            .collect())
    }

    async fn import_batch(&self, _store: &str, records: &[crate::engine::MigrationRecord]) -> Result<()> {
        for record in records {
            self.insert(&record.text, &record.metadata).await?;
        }
        Ok(())
    }

    async fn fetch_record(&self, _store: &str, key: &str) -> Result<Option<crate::engine::MigrationRecord>> {
        let Ok(id) = key.parse::<i64>() else {
            return Ok(None);
        };
        let row: Option<(String, serde_json::Value)> = sqlx::query_as(
            "SELECT content, metadata FROM hybridrag_chunks WHERE workspace = $1 AND id = $2",
        )
        .bind(self.database.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            HybridRagError::engine_transient("server-backed fetch failed")
                .with_database(self.database.clone())
                .with_source(e.into())
        })?;

        Ok(row.map(|(content, metadata)| crate::engine::MigrationRecord {
            key: key.to_string(),
            text: content,
            metadata,
        }))
    }
}

struct ServerBackedHealthProbe {
    pool: PgPool,
}

#[async_trait]
impl HealthProbe for ServerBackedHealthProbe {
    async fn check(&self) -> Result<HealthStatus> {
        let start = Instant::now();
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                connected: true,
                latency_ms: Some(start.elapsed().as_millis() as u64),
                detail: None,
            }),
            Err(e) => {
                warn!("server-backed health probe failed: {e}");
                Ok(HealthStatus {
                    connected: false,
                    latency_ms: None,
                    detail: Some(e.to_string()),
                })
            }
        }
    }
}

struct ServerBackedMetrics {
    database: DatabaseName,
    pool: PgPool,
}

#[async_trait]
impl Metrics for ServerBackedMetrics {
    async fn collect(&self) -> Result<StorageMetrics> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hybridrag_chunks WHERE workspace = $1")
            .bind(self.database.as_str())
            .fetch_one(&self.pool)
            .await
            .unwrap_or((0,));

        Ok(StorageMetrics {
            backend_type: "server-backed".to_string(),
            connected: true,
            connection_latency_ms: None,
            file_sizes: None,
            total_size: 0,
            entity_count: 0,
            relation_count: 0,
            chunk_count: count.0 as u64,
            doc_count: count.0 as u64,
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_based_handles_cache_by_database_name() {
        let dir = tempdir().unwrap();
        let entry = crate::builders::DatabaseEntryBuilder::new()
            .name("proj1")
            .unwrap()
            .path(dir.path().join("proj1"))
            .unwrap()
            .build()
            .unwrap();

        let factory = BackendFactory::new();
        let first = factory.handles_for(&entry).await.unwrap();
        let second = factory.handles_for(&entry).await.unwrap();
        assert!(Arc::ptr_eq(&first.storage, &second.storage));

        factory.invalidate(&entry.name);
        let third = factory.handles_for(&entry).await.unwrap();
        assert!(!Arc::ptr_eq(&first.storage, &third.storage));
    }

    #[tokio::test]
    async fn test_file_based_health_probe_reports_connected() {
        let dir = tempdir().unwrap();
        let entry = crate::builders::DatabaseEntryBuilder::new()
            .name("proj1")
            .unwrap()
            .path(dir.path().join("proj1"))
            .unwrap()
            .build()
            .unwrap();

        let factory = BackendFactory::new();
        let handles = factory.handles_for(&entry).await.unwrap();
        let status = handles.health.check().await.unwrap();
        assert!(status.connected);
    }
}
