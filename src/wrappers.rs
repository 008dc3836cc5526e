// Wrapper Components: decorators that bolt tracing, validation, retry, and
// caching onto a `StorageHandle` without the handle implementation itself
// needing to know about any of it.
//
// Grounded on `TracedStorage`/`ValidatedStorage`/`RetryableStorage`/
// `CachedStorage`, generalized from the old `Storage` trait (insert/get/
// update/delete/list_all/sync/flush) to the narrower `StorageHandle`
// (insert/query/sync) this crate's engine boundary actually exposes.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{MigrationRecord, StorageHandle};
use crate::error::{ErrorKind, HybridRagError, Result};
use crate::observability::{log_operation, record_metric, with_trace_id, MetricType, Operation, OperationContext};
use crate::pure::calculate_backoff_duration;
use crate::types::{DatabaseName, Tier};

/// Adds structured tracing and operation counting around every call
/// (`spec.md` §5, ambient observability carried regardless of backend).
pub struct TracedBackend<S: StorageHandle> {
    inner: S,
    trace_id: Uuid,
    operation_count: AtomicU64,
}

impl<S: StorageHandle> TracedBackend<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            trace_id: Uuid::new_v4(),
            operation_count: AtomicU64::new(0),
        }
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn operation_count(&self) -> u64 {
        self.operation_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<S: StorageHandle> StorageHandle for TracedBackend<S> {
    fn database(&self) -> &DatabaseName {
        self.inner.database()
    }

    async fn insert(&self, text: &str, metadata: &serde_json::Value) -> Result<()> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        let database = self.inner.database().clone();
        let tier_hint = metadata
            .get("tier_hint")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let start = Instant::now();
        let result = self.inner.insert(text, metadata).await;
        let mut ctx = OperationContext::new("backend.insert");
        ctx.add_attribute("database", database.as_str().to_string());
        log_operation(
            &ctx,
            &Operation::PipelineEnqueue { database: database.as_str().to_string(), tier_hint },
            &result.as_ref().map(|_| ()).map_err(|e| anyhow::anyhow!(e.to_string())),
        );
        record_metric(MetricType::Histogram {
            name: "backend.insert.duration",
            value: start.elapsed().as_millis() as f64,
            unit: "ms",
        });
        result
    }

    async fn query(&self, text: &str, top_k: usize, tier: Tier) -> Result<serde_json::Value> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        let database = self.inner.database().clone();
        with_trace_id("backend.query", async {
            let start = Instant::now();
            let result = self.inner.query(text, top_k, tier).await;
            record_metric(MetricType::Histogram {
                name: "backend.query.duration",
                value: start.elapsed().as_millis() as f64,
                unit: "ms",
            });
            result.map_err(|e| anyhow::anyhow!(e.to_string()))
        })
        .await
        .map_err(|e| HybridRagError::internal(e.to_string()).with_database(database))
    }

    async fn sync(&self) -> Result<()> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        info!(trace_id = %self.trace_id, database = %self.inner.database(), "syncing backend");
        self.inner.sync().await
    }

    async fn store_count(&self, store: &str) -> Result<u64> {
        self.inner.store_count(store).await
    }

    async fn export_batch(
        &self,
        store: &str,
        after_key: Option<&str>,
        batch_size: usize,
    ) -> Result<Vec<MigrationRecord>> {
        self.inner.export_batch(store, after_key, batch_size).await
    }

    async fn import_batch(&self, store: &str, records: &[MigrationRecord]) -> Result<()> {
        self.inner.import_batch(store, records).await
    }

    async fn fetch_record(&self, store: &str, key: &str) -> Result<Option<MigrationRecord>> {
        self.inner.fetch_record(store, key).await
    }
}

/// Rejects empty text and oversized metadata before they ever reach the
/// engine (`spec.md` §5's "validate before wrapping" requirement).
pub struct ValidatedBackend<S: StorageHandle> {
    inner: S,
    max_text_bytes: usize,
}

const DEFAULT_MAX_TEXT_BYTES: usize = 8 * 1024 * 1024;

impl<S: StorageHandle> ValidatedBackend<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            max_text_bytes: DEFAULT_MAX_TEXT_BYTES,
        }
    }

    pub fn with_max_text_bytes(mut self, max: usize) -> Self {
        self.max_text_bytes = max;
        self
    }
}

#[async_trait]
impl<S: StorageHandle> StorageHandle for ValidatedBackend<S> {
    fn database(&self) -> &DatabaseName {
        self.inner.database()
    }

    async fn insert(&self, text: &str, metadata: &serde_json::Value) -> Result<()> {
        if text.is_empty() {
            return Err(HybridRagError::input_invalid("cannot insert empty text")
                .with_database(self.inner.database().clone()));
        }
        if text.len() > self.max_text_bytes {
            return Err(HybridRagError::input_invalid(format!(
                "text of {} bytes exceeds max_text_bytes={}",
                text.len(),
                self.max_text_bytes
            ))
            .with_database(self.inner.database().clone()));
        }
        if !metadata.is_object() {
            return Err(HybridRagError::input_invalid("metadata must be a JSON object")
                .with_database(self.inner.database().clone()));
        }
        self.inner.insert(text, metadata).await
    }

    async fn query(&self, text: &str, top_k: usize, tier: Tier) -> Result<serde_json::Value> {
        if text.trim().is_empty() {
            return Err(HybridRagError::input_invalid("query text cannot be empty")
                .with_database(self.inner.database().clone()));
        }
        self.inner.query(text, top_k, tier).await
    }

    async fn sync(&self) -> Result<()> {
        self.inner.sync().await
    }

    async fn store_count(&self, store: &str) -> Result<u64> {
        self.inner.store_count(store).await
    }

    async fn export_batch(
        &self,
        store: &str,
        after_key: Option<&str>,
        batch_size: usize,
    ) -> Result<Vec<MigrationRecord>> {
        self.inner.export_batch(store, after_key, batch_size).await
    }

    async fn import_batch(&self, store: &str, records: &[MigrationRecord]) -> Result<()> {
        self.inner.import_batch(store, records).await
    }

    async fn fetch_record(&self, store: &str, key: &str) -> Result<Option<MigrationRecord>> {
        self.inner.fetch_record(store, key).await
    }
}

/// Retries `EngineTransient` failures with the same backoff schedule the
/// ingestion pipeline uses (`pure::calculate_backoff_duration`), for the
/// narrow set of callers (interactive query, `db sync`) that do not go
/// through the queue's own retry loop.
pub struct RetryableBackend<S: StorageHandle> {
    inner: S,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl<S: StorageHandle> RetryableBackend<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }

    pub fn with_retry_config(mut self, max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    async fn retry<F, Fut, T>(&self, op_name: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.kind == ErrorKind::EngineTransient && attempt + 1 < self.max_attempts => {
                    let delay = calculate_backoff_duration(
                        attempt,
                        self.base_delay,
                        self.max_delay,
                        0.25,
                        fastrand::f64(),
                    );
                    warn!(op_name, attempt, delay_ms = delay.as_millis(), "retrying transient backend failure");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<S: StorageHandle> StorageHandle for RetryableBackend<S> {
    fn database(&self) -> &DatabaseName {
        self.inner.database()
    }

    async fn insert(&self, text: &str, metadata: &serde_json::Value) -> Result<()> {
        self.retry("insert", || self.inner.insert(text, metadata)).await
    }

    async fn query(&self, text: &str, top_k: usize, tier: Tier) -> Result<serde_json::Value> {
        self.retry("query", || self.inner.query(text, top_k, tier)).await
    }

    async fn sync(&self) -> Result<()> {
        self.retry("sync", || self.inner.sync()).await
    }

    async fn store_count(&self, store: &str) -> Result<u64> {
        self.retry("store_count", || self.inner.store_count(store)).await
    }

    async fn export_batch(
        &self,
        store: &str,
        after_key: Option<&str>,
        batch_size: usize,
    ) -> Result<Vec<MigrationRecord>> {
        self.retry("export_batch", || self.inner.export_batch(store, after_key, batch_size)).await
    }

    async fn import_batch(&self, store: &str, records: &[MigrationRecord]) -> Result<()> {
        self.retry("import_batch", || self.inner.import_batch(store, records)).await
    }

    async fn fetch_record(&self, store: &str, key: &str) -> Result<Option<MigrationRecord>> {
        self.retry("fetch_record", || self.inner.fetch_record(store, key)).await
    }
}

/// Caches T1/T2 query results by `(text, top_k, tier)` for `ttl` so a
/// chatty client hammering the same question does not re-hit the engine
/// (`spec.md` §5). Never caches T3/T4, whose results are expected to be
/// task-specific and are handed off as background work anyway.
pub struct CachedQueryBackend<S: StorageHandle> {
    inner: S,
    ttl: Duration,
    cache: RwLock<std::collections::HashMap<u64, (Instant, serde_json::Value)>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: StorageHandle> CachedQueryBackend<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(std::collections::HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    fn cache_key(text: &str, top_k: usize, tier: Tier) -> u64 {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        top_k.hash(&mut hasher);
        (tier as u8).hash(&mut hasher);
        hasher.finish()
    }
}

#[async_trait]
impl<S: StorageHandle> StorageHandle for CachedQueryBackend<S> {
    fn database(&self) -> &DatabaseName {
        self.inner.database()
    }

    async fn insert(&self, text: &str, metadata: &serde_json::Value) -> Result<()> {
        // A fresh insert can change query results; drop the whole cache
        // rather than try to reason about which cached answers it affects.
        self.cache.write().await.clear();
        self.inner.insert(text, metadata).await
    }

    async fn query(&self, text: &str, top_k: usize, tier: Tier) -> Result<serde_json::Value> {
        if matches!(tier, Tier::T3 | Tier::T4) {
            return self.inner.query(text, top_k, tier).await;
        }

        let key = Self::cache_key(text, top_k, tier);
        if let Some((cached_at, value)) = self.cache.read().await.get(&key) {
            if cached_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let result = self.inner.query(text, top_k, tier).await?;
        self.cache.write().await.insert(key, (Instant::now(), result.clone()));
        Ok(result)
    }

    async fn sync(&self) -> Result<()> {
        self.inner.sync().await
    }

    async fn store_count(&self, store: &str) -> Result<u64> {
        self.inner.store_count(store).await
    }

    async fn export_batch(
        &self,
        store: &str,
        after_key: Option<&str>,
        batch_size: usize,
    ) -> Result<Vec<MigrationRecord>> {
        self.inner.export_batch(store, after_key, batch_size).await
    }

    async fn import_batch(&self, store: &str, records: &[MigrationRecord]) -> Result<()> {
        self.inner.import_batch(store, records).await
    }

    async fn fetch_record(&self, store: &str, key: &str) -> Result<Option<MigrationRecord>> {
        self.inner.fetch_record(store, key).await
    }
}

/// The full decoration stack applied by `BackendFactory` callers that want
/// tracing, validation, retry, and caching all at once.
pub type FullyWrappedBackend<S> = TracedBackend<ValidatedBackend<RetryableBackend<CachedQueryBackend<S>>>>;

pub fn wrap_fully<S: StorageHandle>(inner: S, cache_ttl: Duration) -> FullyWrappedBackend<S> {
    let cached = CachedQueryBackend::new(inner, cache_ttl);
    let retryable = RetryableBackend::new(cached);
    let validated = ValidatedBackend::new(retryable);
    TracedBackend::new(validated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryEngine;

    fn db() -> DatabaseName {
        DatabaseName::new("proj1").unwrap()
    }

    #[tokio::test]
    async fn test_traced_backend_counts_operations() {
        let traced = TracedBackend::new(InMemoryEngine::new(db()));
        traced.insert("hello", &serde_json::json!({})).await.unwrap();
        traced.query("hello", 5, Tier::T1).await.unwrap();
        assert_eq!(traced.operation_count(), 2);
    }

    #[tokio::test]
    async fn test_validated_backend_rejects_empty_text() {
        let validated = ValidatedBackend::new(InMemoryEngine::new(db()));
        let err = validated.insert("", &serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InputInvalid);
    }

    #[tokio::test]
    async fn test_validated_backend_rejects_non_object_metadata() {
        let validated = ValidatedBackend::new(InMemoryEngine::new(db()));
        let err = validated
            .insert("hello", &serde_json::json!(["not", "an", "object"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InputInvalid);
    }

    #[tokio::test]
    async fn test_cached_query_backend_hits_on_repeat_query() {
        let cached = CachedQueryBackend::new(InMemoryEngine::new(db()), Duration::from_secs(60));
        cached.insert("hello world", &serde_json::json!({})).await.unwrap();

        cached.query("hello", 5, Tier::T1).await.unwrap();
        cached.query("hello", 5, Tier::T1).await.unwrap();
        let (hits, misses) = cached.cache_stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }

    #[tokio::test]
    async fn test_cached_query_backend_never_caches_t3() {
        let cached = CachedQueryBackend::new(InMemoryEngine::new(db()), Duration::from_secs(60));
        cached.insert("hello world", &serde_json::json!({})).await.unwrap();

        cached.query("hello", 5, Tier::T3).await.unwrap();
        cached.query("hello", 5, Tier::T3).await.unwrap();
        let (hits, misses) = cached.cache_stats();
        assert_eq!(hits, 0);
        assert_eq!(misses, 0);
    }
}
