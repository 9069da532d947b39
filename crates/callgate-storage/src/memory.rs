//! In-process store for tests and runs that need no durability.

use callgate_core::{
    BlobStore, Charge, KeyValueStore, ModelUsage, StoreError, StoredBlob, UsageLedger,
    UsageRecord, UsageStatus, UsageTotals,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Process-local implementation of every persistence port
#[derive(Debug, Default)]
pub struct MemoryStore {
    kv: RwLock<HashMap<String, String>>,
    ledger: RwLock<Vec<UsageRecord>>,
    blobs: RwLock<HashMap<String, StoredBlob>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger rows
    #[must_use]
    pub fn ledger_len(&self) -> usize {
        self.ledger.read().len()
    }

    /// Copy of every ledger row, oldest first
    #[must_use]
    pub fn ledger_records(&self) -> Vec<UsageRecord> {
        self.ledger.read().clone()
    }

    /// Replace a stored blob's bytes without updating its checksum
    ///
    /// Returns whether the blob existed.
    pub fn corrupt_blob(&self, key: &str, data: Vec<u8>) -> bool {
        match self.blobs.write().get_mut(key) {
            Some(blob) => {
                blob.data = data;
                true
            }
            None => false,
        }
    }

    fn in_window(record: &UsageRecord, since: Option<DateTime<Utc>>) -> bool {
        since.map_or(true, |since| record.created_at >= since)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.kv.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.kv.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.kv.write().remove(key);
        Ok(())
    }
}

impl UsageLedger for MemoryStore {
    fn append(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.ledger.write().push(record.clone());
        Ok(())
    }

    fn charged_for(&self, request_id: &str) -> Result<Option<Charge>, StoreError> {
        let ledger = self.ledger.read();
        let mut rows = ledger
            .iter()
            .filter(|r| r.request_id == request_id && r.status != UsageStatus::CacheHit)
            .peekable();
        if rows.peek().is_none() {
            return Ok(None);
        }
        Ok(Some(rows.fold(Charge::default(), |acc, r| acc.plus(&r.charged))))
    }

    fn summarize(&self, since: Option<DateTime<Utc>>) -> Result<UsageTotals, StoreError> {
        let ledger = self.ledger.read();
        let mut totals = UsageTotals::default();
        let mut requests = HashSet::new();

        for record in ledger.iter().filter(|r| Self::in_window(r, since)) {
            match record.status {
                UsageStatus::CacheHit => totals.cache_hits += 1,
                status => {
                    totals.attempts += 1;
                    if matches!(status, UsageStatus::Error | UsageStatus::Retried) {
                        totals.failed_attempts += 1;
                    }
                    requests.insert(record.request_id.as_str());
                }
            }
            totals.input_tokens += record.charged.input_tokens;
            totals.output_tokens += record.charged.output_tokens;
            totals.cost += record.charged.cost;
        }

        totals.requests = requests.len() as u64;
        Ok(totals)
    }

    fn summarize_by_model(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ModelUsage>, StoreError> {
        let ledger = self.ledger.read();
        let mut by_model: BTreeMap<&str, (HashSet<&str>, Charge)> = BTreeMap::new();

        for record in ledger
            .iter()
            .filter(|r| Self::in_window(r, since) && r.status != UsageStatus::CacheHit)
        {
            let entry = by_model.entry(record.model.as_str()).or_default();
            entry.0.insert(record.request_id.as_str());
            entry.1 = entry.1.plus(&record.charged);
        }

        let mut usage: Vec<ModelUsage> = by_model
            .into_iter()
            .map(|(model, (ids, charge))| ModelUsage {
                model: model.to_string(),
                requests: ids.len() as u64,
                input_tokens: charge.input_tokens,
                output_tokens: charge.output_tokens,
                cost: charge.cost,
            })
            .collect();
        usage.sort_by(|a, b| b.cost.total_cmp(&a.cost).then_with(|| a.model.cmp(&b.model)));
        Ok(usage)
    }
}

impl BlobStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoredBlob>, StoreError> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn put(&self, blob: &StoredBlob) -> Result<(), StoreError> {
        self.blobs.write().insert(blob.key.clone(), blob.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.blobs.write().remove(key).is_some())
    }

    fn touch(&self, key: &str, accessed_at_ms: i64) -> Result<(), StoreError> {
        if let Some(blob) = self.blobs.write().get_mut(key) {
            blob.hit_count += 1;
            blob.last_accessed_ms = accessed_at_ms;
        }
        Ok(())
    }

    fn total_size(&self) -> Result<u64, StoreError> {
        Ok(self.blobs.read().values().map(StoredBlob::size).sum())
    }

    fn evict_lru(&self, target_bytes: u64) -> Result<usize, StoreError> {
        let mut blobs = self.blobs.write();
        let mut total: u64 = blobs.values().map(StoredBlob::size).sum();
        if total <= target_bytes {
            return Ok(0);
        }

        let mut order: Vec<(i64, i64, String, u64)> = blobs
            .values()
            .map(|b| (b.last_accessed_ms, b.created_at_ms, b.key.clone(), b.size()))
            .collect();
        order.sort();

        let mut evicted = 0;
        for (_, _, key, size) in order {
            if total <= target_bytes {
                break;
            }
            blobs.remove(&key);
            total -= size;
            evicted += 1;
        }
        Ok(evicted)
    }

    fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError> {
        let mut blobs = self.blobs.write();
        let before = blobs.len();
        blobs.retain(|_, b| b.expires_at_ms >= now_ms);
        Ok(before - blobs.len())
    }

    fn remove_stage(&self, stage: &str) -> Result<usize, StoreError> {
        let mut blobs = self.blobs.write();
        let before = blobs.len();
        blobs.retain(|_, b| b.stage.as_deref() != Some(stage));
        Ok(before - blobs.len())
    }

    fn clear(&self) -> Result<usize, StoreError> {
        let mut blobs = self.blobs.write();
        let removed = blobs.len();
        blobs.clear();
        Ok(removed)
    }
}
