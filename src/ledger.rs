// Processed-Files Ledger (`spec.md` §4.3): one SQLite database per
// registered database, tracking which content fingerprints have been
// ingested so a rescanned file is never processed twice.
//
// `claim` is the single-flight primitive, grounded on
// `supabase_repository::SupabaseRepositoryStore::fetch_job_for_worker`'s
// `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED) RETURNING ...`
// shape. SQLite has no `SKIP LOCKED` and only one writer at a time, so the
// same effect is achieved with a plain `WHERE claimed_at IS NULL` guard: the
// `UPDATE ... RETURNING` either affects the row (this caller wins) or
// affects zero rows (someone already claimed it, or it was never seen).

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{HybridRagError, Result};
use crate::pure::STALE_CLAIM_AGE;
use crate::types::Fingerprint;

#[derive(Debug, Clone, sqlx::FromRow)]
struct LedgerRow {
    fingerprint: String,
    path: String,
    size: i64,
    claimed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Claimed,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub fingerprint: Fingerprint,
    pub path: String,
    pub size: u64,
    pub status: ProcessingStatus,
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct LedgerStats {
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
}

/// A claim token. Holding one is proof this caller won the single-flight
/// race for its fingerprint; `complete`/`fail` consume it.
#[derive(Debug, Clone)]
pub struct ClaimToken {
    pub fingerprint: Fingerprint,
}

pub struct ProcessedFilesLedger {
    pool: SqlitePool,
}

impl ProcessedFilesLedger {
    pub async fn open(database_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(database_path).map_err(|e| {
            HybridRagError::internal("failed to create database working directory").with_source(e.into())
        })?;
        let db_file = database_path.join("processed_files.sqlite3");
        let url = format!("sqlite://{}?mode=rwc", db_file.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // single-writer embedded database
            .connect(&url)
            .await
            .map_err(|e| {
                HybridRagError::internal("failed to open processed-files ledger").with_source(e.into())
            })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_files (
                fingerprint TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                claimed_at TEXT,
                completed_at TEXT,
                failed_at TEXT,
                error TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| HybridRagError::internal("failed to create processed_files table").with_source(e.into()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_roots (
                root TEXT PRIMARY KEY,
                last_scan_ts TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| HybridRagError::internal("failed to create scan_roots table").with_source(e.into()))?;

        let ledger = Self { pool };
        ledger.reclaim_stale_claims().await?;
        Ok(ledger)
    }

    /// Reclaims claimed-but-incomplete entries older than 24 hours at
    /// startup (`spec.md` §4.3).
    async fn reclaim_stale_claims(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::from_std(STALE_CLAIM_AGE).expect("valid duration");
        let reclaimed = sqlx::query(
            r#"
            DELETE FROM processed_files
            WHERE completed_at IS NULL
              AND failed_at IS NULL
              AND claimed_at IS NOT NULL
              AND claimed_at < ?
            "#,
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| HybridRagError::internal("failed to reclaim stale ledger claims").with_source(e.into()))?;

        if reclaimed.rows_affected() > 0 {
            warn!(
                count = reclaimed.rows_affected(),
                "reclaimed stale ledger claims older than 24h"
            );
        }
        Ok(())
    }

    pub async fn seen(&self, fp: &Fingerprint) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM processed_files WHERE fingerprint = ?")
            .bind(fp.to_hex())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HybridRagError::internal("ledger seen? lookup failed").with_source(e.into()))?;
        Ok(row.is_some())
    }

    /// Single-flight claim: returns `Some(token)` exactly once per
    /// fingerprint across its whole unclaimed→completed lifecycle; every
    /// other caller for the same fingerprint gets `None`.
    pub async fn claim(&self, fp: Fingerprint, path: &str, size: u64) -> Result<Option<ClaimToken>> {
        let now = Utc::now().to_rfc3339();
        let inserted = sqlx::query(
            r#"
            INSERT INTO processed_files (fingerprint, path, size, claimed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                claimed_at = excluded.claimed_at
            WHERE processed_files.claimed_at IS NULL
              AND processed_files.completed_at IS NULL
              AND processed_files.failed_at IS NULL
            "#,
        )
        .bind(fp.to_hex())
        .bind(path)
        .bind(size as i64)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| HybridRagError::internal("ledger claim failed").with_source(e.into()))?;

        if inserted.rows_affected() == 0 {
            return Ok(None);
        }

        // Confirm this call's claimed_at actually won (guards the race where
        // two concurrent claims both no-op the WHERE and a third sees
        // rows_affected=1 from an unrelated statement; cheap and SQLite is
        // single-writer so this is a formality, not a TOCTOU).
        let won: Option<(String,)> =
            sqlx::query_as("SELECT claimed_at FROM processed_files WHERE fingerprint = ?")
                .bind(fp.to_hex())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| HybridRagError::internal("ledger claim verification failed").with_source(e.into()))?;

        match won {
            Some((claimed_at,)) if claimed_at == now => Ok(Some(ClaimToken { fingerprint: fp })),
            _ => Ok(None),
        }
    }

    pub async fn complete(&self, token: ClaimToken) -> Result<()> {
        sqlx::query("UPDATE processed_files SET completed_at = ? WHERE fingerprint = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(token.fingerprint.to_hex())
            .execute(&self.pool)
            .await
            .map_err(|e| HybridRagError::internal("ledger complete failed").with_source(e.into()))?;
        Ok(())
    }

    pub async fn fail(&self, token: ClaimToken, err: &str) -> Result<()> {
        sqlx::query("UPDATE processed_files SET failed_at = ?, error = ? WHERE fingerprint = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(err)
            .bind(token.fingerprint.to_hex())
            .execute(&self.pool)
            .await
            .map_err(|e| HybridRagError::internal("ledger fail failed").with_source(e.into()))?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<LedgerStats> {
        let row: (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE completed_at IS NULL AND failed_at IS NULL AND claimed_at IS NOT NULL),
                COUNT(*) FILTER (WHERE completed_at IS NOT NULL),
                COUNT(*) FILTER (WHERE failed_at IS NOT NULL)
            FROM processed_files
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| HybridRagError::internal("ledger stats query failed").with_source(e.into()))?;

        Ok(LedgerStats {
            claimed: row.0 as u64,
            completed: row.1 as u64,
            failed: row.2 as u64,
        })
    }

    pub async fn last_scan_timestamp(&self, root: &str) -> Result<Option<i64>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT last_scan_ts FROM scan_roots WHERE root = ?")
            .bind(root)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HybridRagError::internal("scan root lookup failed").with_source(e.into()))?;

        Ok(row.and_then(|(ts,)| DateTime::parse_from_rfc3339(&ts).ok().map(|dt| dt.timestamp())))
    }

    pub async fn record_scan_timestamp(&self, root: &str, timestamp_secs: i64) -> Result<()> {
        let ts = DateTime::from_timestamp(timestamp_secs, 0)
            .ok_or_else(|| HybridRagError::input_invalid("invalid scan timestamp"))?
            .to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO scan_roots (root, last_scan_ts) VALUES (?, ?)
            ON CONFLICT(root) DO UPDATE SET last_scan_ts = excluded.last_scan_ts
            "#,
        )
        .bind(root)
        .bind(ts)
        .execute(&self.pool)
        .await
        .map_err(|e| HybridRagError::internal("failed to record scan timestamp").with_source(e.into()))?;
        info!(root, "recorded scan timestamp");
        Ok(())
    }
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        let status = if row.completed_at.is_some() {
            ProcessingStatus::Completed
        } else if row.failed_at.is_some() {
            ProcessingStatus::Failed
        } else {
            ProcessingStatus::Claimed
        };
        LedgerEntry {
            fingerprint: Fingerprint::from_hex(&row.fingerprint).expect("stored fingerprint is valid hex"),
            path: row.path,
            size: row.size as u64,
            status,
            error: row.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_claim_is_single_flight() {
        let dir = tempdir().unwrap();
        let ledger = ProcessedFilesLedger::open(dir.path()).await.unwrap();
        let fp = Fingerprint::of_content(b"hello");

        let first = ledger.claim(fp, "a.md", 5).await.unwrap();
        assert!(first.is_some());

        let second = ledger.claim(fp, "a.md", 5).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_complete_then_seen() {
        let dir = tempdir().unwrap();
        let ledger = ProcessedFilesLedger::open(dir.path()).await.unwrap();
        let fp = Fingerprint::of_content(b"hello");

        let token = ledger.claim(fp, "a.md", 5).await.unwrap().unwrap();
        assert!(!ledger.seen(&fp).await.unwrap());
        ledger.complete(token).await.unwrap();
        assert!(ledger.seen(&fp).await.unwrap());

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.claimed, 0);
    }

    #[tokio::test]
    async fn test_failed_items_are_not_reclaimed_for_retry() {
        let dir = tempdir().unwrap();
        let ledger = ProcessedFilesLedger::open(dir.path()).await.unwrap();
        let fp = Fingerprint::of_content(b"hello");

        let token = ledger.claim(fp, "a.md", 5).await.unwrap().unwrap();
        ledger.fail(token, "parse error").await.unwrap();

        // A fresh scan sees the same content again; claim must still refuse.
        assert!(ledger.claim(fp, "a.md", 5).await.unwrap().is_none());

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_scan_timestamp_roundtrip() {
        let dir = tempdir().unwrap();
        let ledger = ProcessedFilesLedger::open(dir.path()).await.unwrap();
        assert_eq!(ledger.last_scan_timestamp("/docs").await.unwrap(), None);

        ledger.record_scan_timestamp("/docs", 1_700_000_000).await.unwrap();
        assert_eq!(
            ledger.last_scan_timestamp("/docs").await.unwrap(),
            Some(1_700_000_000)
        );
    }
}
