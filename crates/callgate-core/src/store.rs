//! Persistence ports.
//!
//! The gate only needs three things from durable storage: a small key-value
//! area for limiter and breaker state, an append-only usage ledger that can
//! be summarized by period, and a blob area for the persistent cache tier.
//! All methods are blocking; async callers go through `spawn_blocking`.

use crate::error::StoreError;
use crate::types::{Charge, ModelUsage, UsageRecord, UsageTotals};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// String key-value storage for small state documents
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Insert or replace a value
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a value if present
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Append-only usage log
pub trait UsageLedger: Send + Sync + 'static {
    /// Append one record
    fn append(&self, record: &UsageRecord) -> Result<(), StoreError>;

    /// Sum of charged deltas already recorded for `request_id`
    fn charged_for(&self, request_id: &str) -> Result<Option<Charge>, StoreError>;

    /// Totals over records created at or after `since` (all records if `None`)
    fn summarize(&self, since: Option<DateTime<Utc>>) -> Result<UsageTotals, StoreError>;

    /// Per-model totals over records created at or after `since`
    fn summarize_by_model(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ModelUsage>, StoreError>;
}

/// A persisted cache record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlob {
    /// Hex cache key
    pub key: String,
    /// Stage name, for per-stage invalidation
    pub stage: Option<String>,
    /// Stored bytes (compressed when `compressed` is set)
    pub data: Vec<u8>,
    /// Whether `data` is DEFLATE-compressed
    pub compressed: bool,
    /// Hex SHA-256 of `data`
    pub checksum: String,
    /// Unix millis at creation
    pub created_at_ms: i64,
    /// Unix millis after which the record must not be served
    pub expires_at_ms: i64,
    /// Number of reads served
    pub hit_count: u64,
    /// Unix millis of the last read
    pub last_accessed_ms: i64,
}

impl StoredBlob {
    /// Size accounted against the persistent tier's cap
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Storage for the persistent cache tier
pub trait BlobStore: Send + Sync + 'static {
    /// Read a record
    ///
    /// # Errors
    /// `StoreError::Corrupt` when the stored row cannot be decoded
    fn get(&self, key: &str) -> Result<Option<StoredBlob>, StoreError>;

    /// Insert or replace a record
    fn put(&self, blob: &StoredBlob) -> Result<(), StoreError>;

    /// Remove a record, returning whether it existed
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Bump hit count and last access time
    fn touch(&self, key: &str, accessed_at_ms: i64) -> Result<(), StoreError>;

    /// Total stored bytes
    fn total_size(&self) -> Result<u64, StoreError>;

    /// Remove least recently accessed records until at most `target_bytes` remain
    fn evict_lru(&self, target_bytes: u64) -> Result<usize, StoreError>;

    /// Remove records whose expiry is before `now_ms`
    fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError>;

    /// Remove every record tagged with `stage`
    fn remove_stage(&self, stage: &str) -> Result<usize, StoreError>;

    /// Remove everything
    fn clear(&self) -> Result<usize, StoreError>;
}
