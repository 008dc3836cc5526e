// The knowledge-graph RAG engine is an external collaborator: this crate
// never constructs its indexes, embeddings, or storage files directly. This
// module defines the narrow boundary this crate depends on instead —
// `StorageHandle` — so the registry, pipeline, and dispatcher can be written
// and tested against a stable contract regardless of which concrete engine
// backend a `DatabaseEntry` selects.
//
// Trait shape (Preconditions/Postconditions/Invariants doc-comment style)
// follows the `Storage`/`Index` contract this module replaces.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::types::DatabaseName;

/// One row of `StorageMetrics` (`spec.md` §3).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StorageMetrics {
    pub backend_type: String,
    pub connected: bool,
    pub connection_latency_ms: Option<u64>,
    pub file_sizes: Option<HashMap<String, u64>>,
    pub total_size: u64,
    pub entity_count: u64,
    pub relation_count: u64,
    pub chunk_count: u64,
    pub doc_count: u64,
    pub warnings: Vec<String>,
}

/// One exported record, keyed for stable-order re-import (`spec.md` §4.9
/// "Copy"). `key` is backend-internal (a row id, an index) and is never
/// interpreted outside the handle that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub key: String,
    pub text: String,
    pub metadata: Value,
}

/// A handle to one database's engine-managed storage.
///
/// # Preconditions
/// - The handle is only constructed via `backend::BackendFactory`, which has
///   already validated the owning `DatabaseEntry`.
///
/// # Invariants
/// - A handle is bound to exactly one database for its entire lifetime; it
///   is never silently repointed at another backend.
#[async_trait]
pub trait StorageHandle: Send + Sync {
    fn database(&self) -> &DatabaseName;

    /// Insert one preprocessed, tiered ingestion payload.
    ///
    /// # Postconditions
    /// - On `Ok`, the content is durable per the backend's own sync policy;
    ///   callers still decide when to call `sync`.
    async fn insert(&self, text: &str, metadata: &Value) -> Result<()>;

    /// Run a query at the dispatcher's resolved tier and return the raw
    /// engine result payload (dispatcher attaches `metadata`/footer).
    async fn query(&self, text: &str, top_k: usize, tier: crate::types::Tier) -> Result<Value>;

    async fn sync(&self) -> Result<()>;

    /// The logical stores this handle exposes for migration. Most backends
    /// have exactly one.
    async fn store_names(&self) -> Result<Vec<String>> {
        Ok(vec!["chunks".to_string()])
    }

    async fn store_count(&self, store: &str) -> Result<u64>;

    /// Records strictly after `after_key` in stable key order, used by the
    /// Migration Coordinator's copy phase (`spec.md` §4.9).
    async fn export_batch(
        &self,
        store: &str,
        after_key: Option<&str>,
        batch_size: usize,
    ) -> Result<Vec<MigrationRecord>>;

    async fn import_batch(&self, store: &str, records: &[MigrationRecord]) -> Result<()>;

    /// Used by the post-migration spot-check to compare a single key across
    /// source and target.
    async fn fetch_record(&self, store: &str, key: &str) -> Result<Option<MigrationRecord>>;
}

/// # Preconditions
/// - Called only by `BackendFactory::health_probe`, never directly by CLI or
///   dispatcher code.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<HealthStatus>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthStatus {
    pub connected: bool,
    pub latency_ms: Option<u64>,
    pub detail: Option<String>,
}

#[async_trait]
pub trait Metrics: Send + Sync {
    async fn collect(&self) -> Result<StorageMetrics>;
}

/// An in-memory stand-in engine used by tests and by the `file-based` backend
/// before a real engine crate is wired in. It never touches a network and
/// never needs credentials, so it satisfies `StorageHandle` trivially while
/// still exercising every call site that depends on the trait.
pub struct InMemoryEngine {
    database: DatabaseName,
    documents: Arc<RwLock<Vec<(String, Value)>>>,
}

impl InMemoryEngine {
    pub fn new(database: DatabaseName) -> Self {
        Self {
            database,
            documents: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }
}

#[async_trait]
impl StorageHandle for InMemoryEngine {
    fn database(&self) -> &DatabaseName {
        &self.database
    }

    async fn insert(&self, text: &str, metadata: &Value) -> Result<()> {
        self.documents
            .write()
            .await
            .push((text.to_string(), metadata.clone()));
        Ok(())
    }

    async fn query(&self, text: &str, top_k: usize, _tier: crate::types::Tier) -> Result<Value> {
        let docs = self.documents.read().await;
        let hits: Vec<Value> = docs
            .iter()
            .filter(|(doc, _)| doc.contains(text))
            .take(top_k)
            .map(|(doc, meta)| serde_json::json!({ "text": doc, "metadata": meta }))
            .collect();
        Ok(serde_json::json!({ "hits": hits }))
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn store_count(&self, _store: &str) -> Result<u64> {
        Ok(self.documents.read().await.len() as u64)
    }

    async fn export_batch(
        &self,
        _store: &str,
        after_key: Option<&str>,
        batch_size: usize,
    ) -> Result<Vec<MigrationRecord>> {
        let start = match after_key {
            Some(k) => k.parse::<usize>().unwrap_or(0) + 1,
            None => 0,
        };
        let docs = self.documents.read().await;
        Ok(docs
            .iter()
            .enumerate()
            .skip(start)
            .take(batch_size)
            .map(|(i, (text, metadata))| MigrationRecord {
                key: i.to_string(),
                text: text.clone(),
                metadata: metadata.clone(),
            })
            .collect())
    }

    async fn import_batch(&self, _store: &str, records: &[MigrationRecord]) -> Result<()> {
        let mut docs = self.documents.write().await;
        for record in records {
            docs.push((record.text.clone(), record.metadata.clone()));
        }
        Ok(())
    }

    async fn fetch_record(&self, _store: &str, key: &str) -> Result<Option<MigrationRecord>> {
        let Ok(idx) = key.parse::<usize>() else {
            return Ok(None);
        };
        let docs = self.documents.read().await;
        Ok(docs.get(idx).map(|(text, metadata)| MigrationRecord {
            key: key.to_string(),
            text: text.clone(),
            metadata: metadata.clone(),
        }))
    }
}

#[async_trait]
impl HealthProbe for InMemoryEngine {
    async fn check(&self) -> Result<HealthStatus> {
        Ok(HealthStatus {
            connected: true,
            latency_ms: Some(0),
            detail: None,
        })
    }
}

#[async_trait]
impl Metrics for InMemoryEngine {
    async fn collect(&self) -> Result<StorageMetrics> {
        let docs = self.documents.read().await;
        Ok(StorageMetrics {
            backend_type: "file-based".to_string(),
            connected: true,
            connection_latency_ms: Some(0),
            file_sizes: None,
            total_size: docs.iter().map(|(d, _)| d.len() as u64).sum(),
            entity_count: 0,
            relation_count: 0,
            chunk_count: docs.len() as u64,
            doc_count: docs.len() as u64,
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_engine_insert_and_query() {
        let db = DatabaseName::new("proj1").unwrap();
        let engine = InMemoryEngine::new(db.clone());
        engine
            .insert("hello world", &serde_json::json!({"source": "a.md"}))
            .await
            .unwrap();
        assert_eq!(engine.len().await, 1);

        let result = engine.query("hello", 5, crate::types::Tier::T1).await.unwrap();
        assert_eq!(result["hits"].as_array().unwrap().len(), 1);
    }
}
