//! SQLite-backed persistence for limiter state, the usage ledger and the
//! persistent cache tier.
#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::as_conversions
)]

use callgate_core::{
    BlobStore, Charge, KeyValueStore, ModelUsage, StoreError, StoredBlob, UsageLedger,
    UsageRecord, UsageTotals,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    model TEXT NOT NULL,
    stage TEXT,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cost REAL NOT NULL,
    charged_input_tokens INTEGER NOT NULL,
    charged_output_tokens INTEGER NOT NULL,
    charged_cost REAL NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_request ON usage_ledger (request_id);
CREATE INDEX IF NOT EXISTS idx_usage_created ON usage_ledger (created_at);

CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    stage TEXT,
    data BLOB NOT NULL,
    compressed INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    hit_count INTEGER NOT NULL DEFAULT 0,
    last_accessed INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_lru ON cache_entries (last_accessed);
CREATE INDEX IF NOT EXISTS idx_cache_stage ON cache_entries (stage);
";

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn since_ms(since: Option<DateTime<Utc>>) -> i64 {
    since.map_or(i64::MIN, |t| t.timestamp_millis())
}

/// Durable store implementing every persistence port on one SQLite file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) a database file
    ///
    /// # Errors
    /// Returns `StoreError::Backend` if the file cannot be opened or migrated
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(backend)?;
        info!(path = %path.display(), "Opened gate state database");
        Self::init(conn)
    }

    /// Open a private in-memory database
    ///
    /// # Errors
    /// Returns `StoreError::Backend` if SQLite cannot initialise
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn
            .lock()
            .query_row("SELECT value FROM kv_state WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .map_err(backend)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _rows_affected: usize = self
            .conn
            .lock()
            .execute(
                "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, Utc::now().timestamp_millis()],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _rows_affected: usize = self
            .conn
            .lock()
            .execute("DELETE FROM kv_state WHERE key = ?1", [key])
            .map_err(backend)?;
        Ok(())
    }
}

impl UsageLedger for SqliteStore {
    fn append(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let _rows_affected: usize = self
            .conn
            .lock()
            .execute(
                "INSERT INTO usage_ledger (request_id, model, stage, status, attempt, input_tokens,
                 output_tokens, cost, charged_input_tokens, charged_output_tokens, charged_cost, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.request_id,
                    record.model,
                    record.stage.map(|s| s.as_str()),
                    record.status.as_str(),
                    record.attempt,
                    record.reported.input_tokens as i64,
                    record.reported.output_tokens as i64,
                    record.reported.cost,
                    record.charged.input_tokens as i64,
                    record.charged.output_tokens as i64,
                    record.charged.cost,
                    record.created_at.timestamp_millis(),
                ],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn charged_for(&self, request_id: &str) -> Result<Option<Charge>, StoreError> {
        let (rows, input, output, cost): (i64, i64, i64, f64) = self
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(charged_input_tokens), 0),
                 COALESCE(SUM(charged_output_tokens), 0), COALESCE(SUM(charged_cost), 0.0)
                 FROM usage_ledger WHERE request_id = ?1 AND status != 'cache_hit'",
                [request_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(backend)?;

        if rows == 0 {
            return Ok(None);
        }
        Ok(Some(Charge {
            input_tokens: input as u64,
            output_tokens: output as u64,
            cost,
        }))
    }

    fn summarize(&self, since: Option<DateTime<Utc>>) -> Result<UsageTotals, StoreError> {
        self.conn
            .lock()
            .query_row(
                "SELECT
                    COUNT(DISTINCT CASE WHEN status != 'cache_hit' THEN request_id END),
                    COALESCE(SUM(CASE WHEN status = 'cache_hit' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status != 'cache_hit' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status IN ('error', 'retried') THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(charged_input_tokens), 0),
                    COALESCE(SUM(charged_output_tokens), 0),
                    COALESCE(SUM(charged_cost), 0.0)
                 FROM usage_ledger WHERE created_at >= ?1",
                [since_ms(since)],
                |row| {
                    Ok(UsageTotals {
                        requests: row.get::<_, i64>(0)? as u64,
                        cache_hits: row.get::<_, i64>(1)? as u64,
                        attempts: row.get::<_, i64>(2)? as u64,
                        failed_attempts: row.get::<_, i64>(3)? as u64,
                        input_tokens: row.get::<_, i64>(4)? as u64,
                        output_tokens: row.get::<_, i64>(5)? as u64,
                        cost: row.get(6)?,
                    })
                },
            )
            .map_err(backend)
    }

    fn summarize_by_model(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ModelUsage>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT model, COUNT(DISTINCT request_id), COALESCE(SUM(charged_input_tokens), 0),
                 COALESCE(SUM(charged_output_tokens), 0), COALESCE(SUM(charged_cost), 0.0)
                 FROM usage_ledger WHERE created_at >= ?1 AND status != 'cache_hit'
                 GROUP BY model ORDER BY SUM(charged_cost) DESC, model",
            )
            .map_err(backend)?;

        let rows = stmt
            .query_map([since_ms(since)], |row| {
                Ok(ModelUsage {
                    model: row.get(0)?,
                    requests: row.get::<_, i64>(1)? as u64,
                    input_tokens: row.get::<_, i64>(2)? as u64,
                    output_tokens: row.get::<_, i64>(3)? as u64,
                    cost: row.get(4)?,
                })
            })
            .map_err(backend)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }
}

impl BlobStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<StoredBlob>, StoreError> {
        let result = self
            .conn
            .lock()
            .query_row(
                "SELECT key, stage, data, compressed, checksum, created_at, expires_at, hit_count, last_accessed
                 FROM cache_entries WHERE key = ?1",
                [key],
                |row| {
                    Ok(StoredBlob {
                        key: row.get(0)?,
                        stage: row.get(1)?,
                        data: row.get(2)?,
                        compressed: row.get(3)?,
                        checksum: row.get(4)?,
                        created_at_ms: row.get(5)?,
                        expires_at_ms: row.get(6)?,
                        hit_count: row.get::<_, i64>(7)? as u64,
                        last_accessed_ms: row.get(8)?,
                    })
                },
            )
            .optional();

        match result {
            Ok(blob) => Ok(blob),
            Err(
                err @ (rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::InvalidColumnType(..)),
            ) => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: err.to_string(),
            }),
            Err(err) => Err(backend(err)),
        }
    }

    fn put(&self, blob: &StoredBlob) -> Result<(), StoreError> {
        let _rows_affected: usize = self
            .conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO cache_entries
                 (key, stage, data, compressed, checksum, size, created_at, expires_at, hit_count, last_accessed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    blob.key,
                    blob.stage,
                    blob.data,
                    blob.compressed,
                    blob.checksum,
                    blob.size() as i64,
                    blob.created_at_ms,
                    blob.expires_at_ms,
                    blob.hit_count as i64,
                    blob.last_accessed_ms,
                ],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM cache_entries WHERE key = ?1", [key])
            .map_err(backend)?;
        Ok(removed > 0)
    }

    fn touch(&self, key: &str, accessed_at_ms: i64) -> Result<(), StoreError> {
        let _rows_affected: usize = self
            .conn
            .lock()
            .execute(
                "UPDATE cache_entries SET hit_count = hit_count + 1, last_accessed = ?2 WHERE key = ?1",
                params![key, accessed_at_ms],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn total_size(&self) -> Result<u64, StoreError> {
        let total: i64 = self
            .conn
            .lock()
            .query_row("SELECT COALESCE(SUM(size), 0) FROM cache_entries", [], |row| row.get(0))
            .map_err(backend)?;
        Ok(total as u64)
    }

    fn evict_lru(&self, target_bytes: u64) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;

        let mut total: i64 = tx
            .query_row("SELECT COALESCE(SUM(size), 0) FROM cache_entries", [], |row| row.get(0))
            .map_err(backend)?;
        let target = target_bytes as i64;
        if total <= target {
            return Ok(0);
        }

        let victims: Vec<(String, i64)> = {
            let mut stmt = tx
                .prepare("SELECT key, size FROM cache_entries ORDER BY last_accessed ASC, created_at ASC")
                .map_err(backend)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(backend)?;
            let mut victims = Vec::new();
            for row in rows {
                if total <= target {
                    break;
                }
                let (key, size): (String, i64) = row.map_err(backend)?;
                total -= size;
                victims.push((key, size));
            }
            victims
        };

        for (key, _) in &victims {
            let _rows_affected: usize = tx
                .execute("DELETE FROM cache_entries WHERE key = ?1", [key])
                .map_err(backend)?;
        }
        tx.commit().map_err(backend)?;

        debug!(evicted = victims.len(), remaining_bytes = total, "Evicted cache entries");
        Ok(victims.len())
    }

    fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM cache_entries WHERE expires_at < ?1", [now_ms])
            .map_err(backend)
    }

    fn remove_stage(&self, stage: &str) -> Result<usize, StoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM cache_entries WHERE stage = ?1", [stage])
            .map_err(backend)
    }

    fn clear(&self) -> Result<usize, StoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM cache_entries", [])
            .map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callgate_core::{Stage, UsageStatus};
    use chrono::TimeZone;

    fn record(request_id: &str, status: UsageStatus, charged: Charge, at: DateTime<Utc>) -> UsageRecord {
        UsageRecord {
            request_id: request_id.to_string(),
            model: "claude-3-5-sonnet".to_string(),
            stage: Some(Stage::Analysis),
            status,
            attempt: 1,
            reported: charged,
            charged,
            created_at: at,
        }
    }

    fn blob(key: &str, size: usize, last_accessed_ms: i64) -> StoredBlob {
        StoredBlob {
            key: key.to_string(),
            stage: Some("analysis".to_string()),
            data: vec![7u8; size],
            compressed: false,
            checksum: "00".to_string(),
            created_at_ms: 0,
            expires_at_ms: 10_000,
            hit_count: 0,
            last_accessed_ms,
        }
    }

    #[test]
    fn test_kv_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(KeyValueStore::get(&store, "limiter").unwrap(), None);

        store.set("limiter", r#"{"tokens":3}"#).unwrap();
        store.set("limiter", r#"{"tokens":4}"#).unwrap();
        assert_eq!(
            KeyValueStore::get(&store, "limiter").unwrap().as_deref(),
            Some(r#"{"tokens":4}"#)
        );

        store.delete("limiter").unwrap();
        assert_eq!(KeyValueStore::get(&store, "limiter").unwrap(), None);
    }

    #[test]
    fn test_ledger_summaries() {
        let store = SqliteStore::open_in_memory().unwrap();
        let day = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let charge = Charge { input_tokens: 1000, output_tokens: 500, cost: 0.0105 };

        store.append(&record("a", UsageStatus::Retried, Charge::default(), day)).unwrap();
        store.append(&record("a", UsageStatus::Success, charge, day)).unwrap();
        store.append(&record("b", UsageStatus::Success, charge, day)).unwrap();
        store.append(&record("c", UsageStatus::CacheHit, Charge::default(), day)).unwrap();
        store
            .append(&record("old", UsageStatus::Success, charge, day - chrono::Duration::days(40)))
            .unwrap();

        let since = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        let totals = store.summarize(since).unwrap();
        assert_eq!(totals.requests, 2);
        assert_eq!(totals.cache_hits, 1);
        assert_eq!(totals.attempts, 3);
        assert_eq!(totals.failed_attempts, 1);
        assert_eq!(totals.total_tokens(), 3000);
        assert!((totals.cost - 0.021).abs() < 1e-9);

        let all = store.summarize(None).unwrap();
        assert_eq!(all.requests, 3);

        let by_model = store.summarize_by_model(since).unwrap();
        assert_eq!(by_model.len(), 1);
        assert_eq!(by_model[0].requests, 2);
    }

    #[test]
    fn test_charged_for() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        assert_eq!(store.charged_for("x").unwrap(), None);

        let charge = Charge { input_tokens: 10, output_tokens: 5, cost: 0.5 };
        store.append(&record("x", UsageStatus::Error, charge, now)).unwrap();
        store.append(&record("x", UsageStatus::Success, Charge::default(), now)).unwrap();

        let charged = store.charged_for("x").unwrap().unwrap();
        assert_eq!(charged.total_tokens(), 15);
        assert!((charged.cost - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_blob_lifecycle() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(&blob("k1", 100, 1)).unwrap();

        let loaded = BlobStore::get(&store, "k1").unwrap().unwrap();
        assert_eq!(loaded.data.len(), 100);

        store.touch("k1", 50).unwrap();
        let touched = BlobStore::get(&store, "k1").unwrap().unwrap();
        assert_eq!(touched.hit_count, 1);
        assert_eq!(touched.last_accessed_ms, 50);

        assert_eq!(store.purge_expired(20_000).unwrap(), 1);
        assert!(BlobStore::get(&store, "k1").unwrap().is_none());
    }

    #[test]
    fn test_evict_lru_removes_oldest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(&blob("old", 100, 1)).unwrap();
        store.put(&blob("mid", 100, 2)).unwrap();
        store.put(&blob("new", 100, 3)).unwrap();
        assert_eq!(store.total_size().unwrap(), 300);

        assert_eq!(store.evict_lru(150).unwrap(), 2);
        assert!(BlobStore::get(&store, "old").unwrap().is_none());
        assert!(BlobStore::get(&store, "mid").unwrap().is_none());
        assert!(BlobStore::get(&store, "new").unwrap().is_some());
        assert_eq!(store.evict_lru(150).unwrap(), 0);
    }

    #[test]
    fn test_remove_stage_and_clear() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(&blob("a", 1, 1)).unwrap();
        let mut other = blob("b", 1, 1);
        other.stage = Some("card_authoring".to_string());
        store.put(&other).unwrap();

        assert_eq!(store.remove_stage("analysis").unwrap(), 1);
        assert_eq!(store.clear().unwrap(), 1);
        assert!(!store.remove("b").unwrap());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("callgate-sqlite-{}", std::process::id()));
        let path = dir.join("state.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("quota:daily_tokens", "1000").unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            KeyValueStore::get(&store, "quota:daily_tokens").unwrap().as_deref(),
            Some("1000")
        );
        drop(store);
        let _ = std::fs::remove_dir_all(dir);
    }
}
