//! Two-tier response cache with single-flight computation.
//!
//! Results of billed upstream calls are cached by content hash. A bounded
//! in-process LRU tier sits in front of an optional persistent tier backed by
//! a [`BlobStore`]. Persistent records carry a SHA-256 checksum and are
//! DEFLATE-compressed above a size threshold; a record that fails either
//! check is dropped and reported as a miss.
//!
//! [`ResponseCache::get_or_compute`] guarantees that concurrent callers for
//! one key share a single computation and its result, success or error.

use crate::persist;
use callgate_config::CacheConfig;
use callgate_core::{
    BlobStore, CacheKey, GateError, GateResult, Payload, SharedClock, Stage, StoreError,
    StoredBlob,
};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use moka::policy::EvictionPolicy;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Where a `get_or_compute` result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeSource {
    /// Served from the memory or persistent tier
    Cached,
    /// This caller ran the computation
    Computed,
    /// Another caller's in-flight computation was shared
    Shared,
}

/// A memory-tier entry
#[derive(Debug)]
struct MemoryEntry {
    payload: Payload,
    stage: Option<Stage>,
    expires_at_ms: i64,
    hits: AtomicU64,
}

type FlightResult = Option<GateResult<Payload>>;

#[derive(Debug)]
struct Flight {
    id: u64,
    result: watch::Receiver<FlightResult>,
}

/// Removes the flight entry when the computing caller finishes or is dropped
struct FlightGuard<'a> {
    flights: &'a Mutex<HashMap<CacheKey, Flight>>,
    key: CacheKey,
    id: u64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock();
        if flights.get(&self.key).is_some_and(|f| f.id == self.id) {
            flights.remove(&self.key);
        }
    }
}

enum Role {
    Leader(watch::Sender<FlightResult>, u64),
    Follower(watch::Receiver<FlightResult>),
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    computes: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    corrupt: AtomicU64,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Hits served from memory
    pub memory_hits: u64,
    /// Hits served from the persistent tier
    pub persistent_hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Computations started
    pub computes: u64,
    /// Callers that joined another caller's computation
    pub coalesced: u64,
    /// Entries removed by expiry or the size cap
    pub evictions: u64,
    /// Persistent records dropped for failing integrity checks
    pub corrupt: u64,
    /// Approximate number of memory-tier entries
    pub memory_entries: u64,
}

impl CacheStats {
    /// Total hits across both tiers
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.memory_hits + self.persistent_hits
    }

    /// Calculate hit rate
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64 * 100.0
        }
    }
}

/// Entries removed by an invalidation, per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Invalidated {
    /// Memory-tier entries removed
    pub memory: usize,
    /// Persistent records removed
    pub persistent: usize,
}

/// Which tier answered a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// In-process LRU tier
    Memory,
    /// Blob store tier
    Persistent,
}

/// Two-tier response cache
pub struct ResponseCache {
    config: CacheConfig,
    clock: SharedClock,
    memory: moka::sync::Cache<CacheKey, Arc<MemoryEntry>>,
    persistent: Option<Arc<dyn BlobStore>>,
    flights: Mutex<HashMap<CacheKey, Flight>>,
    next_flight: AtomicU64,
    counters: Counters,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("persistent", &self.persistent.is_some())
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    /// Create a memory-only cache
    #[must_use]
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        let memory = moka::sync::Cache::builder()
            .max_capacity(config.memory_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self {
            config,
            clock,
            memory,
            persistent: None,
            flights: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Back the cache with a persistent tier
    #[must_use]
    pub fn with_persistent(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.persistent = Some(store);
        self
    }

    /// Check if caching is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a cached payload
    pub async fn get(&self, key: &CacheKey) -> Option<Payload> {
        self.lookup(key, true).await.map(|(payload, _)| payload)
    }

    /// Look up a cached payload and report the tier that served it
    pub async fn get_with_tier(&self, key: &CacheKey) -> Option<(Payload, CacheTier)> {
        self.lookup(key, true).await
    }

    async fn lookup(&self, key: &CacheKey, count_miss: bool) -> Option<(Payload, CacheTier)> {
        if !self.config.enabled {
            return None;
        }
        let now_ms = self.clock.wall_ms();

        if let Some(payload) = self.lookup_memory(key, now_ms) {
            return Some((payload, CacheTier::Memory));
        }

        if let Some(payload) = self.lookup_persistent(key, now_ms).await {
            self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key.short(), tier = "persistent", "Cache hit");
            return Some((payload, CacheTier::Persistent));
        }

        if count_miss {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key.short(), "Cache miss");
        }
        None
    }

    fn lookup_memory(&self, key: &CacheKey, now_ms: i64) -> Option<Payload> {
        let entry = self.memory.get(key)?;
        if now_ms <= entry.expires_at_ms {
            let hits = entry.hits.fetch_add(1, Ordering::Relaxed) + 1;
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key.short(), hits, tier = "memory", "Cache hit");
            return Some(entry.payload.clone());
        }
        self.memory.invalidate(key);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key.short(), "Memory entry expired");
        None
    }

    async fn lookup_persistent(&self, key: &CacheKey, now_ms: i64) -> Option<Payload> {
        let store = self.persistent.as_ref()?;
        let fetched = {
            let store = Arc::clone(store);
            let key = key.as_str().to_string();
            persist::blocking_store(move || store.get(&key)).await
        };

        let blob = match fetched {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(StoreError::Corrupt { reason, .. }) => {
                self.drop_corrupt(key, &reason).await;
                return None;
            }
            Err(e) => {
                warn!(key = %key.short(), error = %e, "Persistent cache read failed");
                return None;
            }
        };

        if now_ms > blob.expires_at_ms {
            self.remove_persistent(key).await;
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key.short(), "Persistent entry expired");
            return None;
        }

        let payload = match decode_blob(&blob) {
            Ok(payload) => payload,
            Err(reason) => {
                self.drop_corrupt(key, &reason).await;
                return None;
            }
        };

        let stage = blob.stage.as_deref().and_then(|s| s.parse().ok());
        self.memory.insert(
            key.clone(),
            Arc::new(MemoryEntry {
                payload: payload.clone(),
                stage,
                expires_at_ms: blob.expires_at_ms,
                hits: AtomicU64::new(0),
            }),
        );

        let store = Arc::clone(store);
        let key_str = key.as_str().to_string();
        if let Err(e) = persist::blocking_store(move || store.touch(&key_str, now_ms)).await {
            debug!(key = %key.short(), error = %e, "Failed to record persistent cache access");
        }
        Some(payload)
    }

    async fn drop_corrupt(&self, key: &CacheKey, reason: &str) {
        self.counters.corrupt.fetch_add(1, Ordering::Relaxed);
        warn!(key = %key.short(), reason, "Dropping corrupt cache record");
        self.remove_persistent(key).await;
    }

    async fn remove_persistent(&self, key: &CacheKey) -> bool {
        let Some(store) = &self.persistent else {
            return false;
        };
        let store = Arc::clone(store);
        let key_str = key.as_str().to_string();
        match persist::blocking_store(move || store.remove(&key_str)).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key = %key.short(), error = %e, "Failed to remove persistent cache record");
                false
            }
        }
    }

    /// Store a payload; `ttl` defaults to the configured TTL
    ///
    /// Write failures in the persistent tier are logged, never returned.
    pub async fn put(&self, key: &CacheKey, stage: Option<Stage>, payload: Payload, ttl: Option<Duration>) {
        if !self.config.enabled {
            return;
        }
        let ttl = self.jittered_ttl(ttl.unwrap_or(self.config.default_ttl));
        let now_ms = self.clock.wall_ms();
        let expires_at_ms = now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

        self.memory.insert(
            key.clone(),
            Arc::new(MemoryEntry {
                payload: payload.clone(),
                stage,
                expires_at_ms,
                hits: AtomicU64::new(0),
            }),
        );

        if let Some(store) = &self.persistent {
            let blob = encode_blob(
                key,
                stage,
                &payload,
                self.config.compress_threshold_bytes,
                now_ms,
                expires_at_ms,
            );
            let compressed = blob.compressed;
            let size = blob.size();
            let store = Arc::clone(store);
            let cap = self.config.max_persistent_bytes;
            let written = persist::blocking_store(move || {
                store.put(&blob)?;
                if store.total_size()? > cap {
                    store.evict_lru(cap)
                } else {
                    Ok(0)
                }
            })
            .await;

            match written {
                Ok(evicted) => {
                    if evicted > 0 {
                        self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                        info!(evicted, cap_bytes = cap, "Persistent cache over size cap, evicted LRU records");
                    }
                }
                Err(e) => warn!(key = %key.short(), error = %e, "Persistent cache write failed"),
            }
            debug!(key = %key.short(), size, compressed, ttl_ms = ttl.as_millis(), "Response cached");
        } else {
            debug!(key = %key.short(), ttl_ms = ttl.as_millis(), "Response cached");
        }
    }

    /// Return the cached payload for `key`, or run `compute` exactly once
    /// across all concurrent callers for that key.
    ///
    /// Successful results are cached; errors are handed to every waiting
    /// caller and not cached. If the computing caller is dropped before it
    /// finishes, waiters receive `GateError::Cancelled`.
    ///
    /// # Errors
    /// The computation's error, `Cancelled` as above, or `Timeout` when a
    /// waiter exceeds the configured flight wait
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        stage: Option<Stage>,
        ttl: Option<Duration>,
        compute: F,
    ) -> GateResult<(Payload, ComputeSource)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GateResult<Payload>>,
    {
        if let Some((payload, _)) = self.lookup(key, true).await {
            return Ok((payload, ComputeSource::Cached));
        }
        self.compute_once(key, stage, ttl, compute).await
    }

    /// Single-flight computation for a caller that has already looked `key`
    /// up and missed. No miss is counted and neither tier is read again,
    /// apart from a memory check once this caller leads the flight.
    ///
    /// # Errors
    /// Same as [`ResponseCache::get_or_compute`]
    pub async fn compute_once<F, Fut>(
        &self,
        key: &CacheKey,
        stage: Option<Stage>,
        ttl: Option<Duration>,
        compute: F,
    ) -> GateResult<(Payload, ComputeSource)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GateResult<Payload>>,
    {
        if !self.config.enabled {
            self.counters.computes.fetch_add(1, Ordering::Relaxed);
            return compute().await.map(|p| (p, ComputeSource::Computed));
        }

        let role = {
            let mut flights = self.flights.lock();
            if let Some(flight) = flights.get(key) {
                Role::Follower(flight.result.clone())
            } else {
                let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                flights.insert(key.clone(), Flight { id, result: rx });
                Role::Leader(tx, id)
            }
        };

        match role {
            Role::Follower(rx) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key.short(), "Joining in-flight computation");
                let result = match self.config.flight_wait_timeout {
                    Some(limit) => tokio::time::timeout(limit, wait_for_flight(rx))
                        .await
                        .unwrap_or_else(|_| Err(GateError::timeout(limit))),
                    None => wait_for_flight(rx).await,
                };
                result.map(|p| (p, ComputeSource::Shared))
            }
            Role::Leader(tx, id) => {
                let _guard = FlightGuard {
                    flights: &self.flights,
                    key: key.clone(),
                    id,
                };

                // A flight that finished since our miss has already filled memory
                if let Some(payload) = self.lookup_memory(key, self.clock.wall_ms()) {
                    tx.send_replace(Some(Ok(payload.clone())));
                    return Ok((payload, ComputeSource::Cached));
                }

                self.counters.computes.fetch_add(1, Ordering::Relaxed);
                let result = compute().await;
                if let Ok(payload) = &result {
                    self.put(key, stage, payload.clone(), ttl).await;
                }
                tx.send_replace(Some(result.clone()));
                result.map(|p| (p, ComputeSource::Computed))
            }
        }
    }

    /// Remove one key from both tiers, returning whether anything was removed
    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        let in_memory = self.memory.remove(key).is_some();
        let in_store = self.remove_persistent(key).await;
        in_memory || in_store
    }

    /// Remove every entry produced by `stage`
    ///
    /// # Errors
    /// Returns `Storage` when the persistent tier fails
    pub async fn invalidate_stage(&self, stage: Stage) -> GateResult<Invalidated> {
        let memory = self.invalidate_memory_where(|entry| entry.stage == Some(stage));
        let persistent = match &self.persistent {
            Some(store) => {
                let store = Arc::clone(store);
                persist::blocking(move || store.remove_stage(stage.as_str())).await?
            }
            None => 0,
        };
        info!(%stage, memory, persistent, "Cache stage invalidated");
        Ok(Invalidated { memory, persistent })
    }

    /// Remove everything from both tiers
    ///
    /// # Errors
    /// Returns `Storage` when the persistent tier fails
    pub async fn clear(&self) -> GateResult<Invalidated> {
        let memory = self.invalidate_memory_where(|_| true);
        let persistent = match &self.persistent {
            Some(store) => {
                let store = Arc::clone(store);
                persist::blocking(move || store.clear()).await?
            }
            None => 0,
        };
        info!(memory, persistent, "Cache cleared");
        Ok(Invalidated { memory, persistent })
    }

    /// Remove expired entries from both tiers
    ///
    /// # Errors
    /// Returns `Storage` when the persistent tier fails
    pub async fn sweep_expired(&self) -> GateResult<usize> {
        let now_ms = self.clock.wall_ms();
        let memory = self.invalidate_memory_where(|entry| now_ms > entry.expires_at_ms);
        let persistent = match &self.persistent {
            Some(store) => {
                let store = Arc::clone(store);
                persist::blocking(move || store.purge_expired(now_ms)).await?
            }
            None => 0,
        };

        let removed = memory + persistent;
        if removed > 0 {
            self.counters.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            info!(memory, persistent, "Expired cache entries swept");
        }
        Ok(removed)
    }

    /// Evict least recently used persistent records above the size cap
    ///
    /// # Errors
    /// Returns `Storage` when the persistent tier fails
    pub async fn enforce_size_cap(&self) -> GateResult<usize> {
        let Some(store) = &self.persistent else {
            return Ok(0);
        };
        let store = Arc::clone(store);
        let cap = self.config.max_persistent_bytes;
        let evicted = persist::blocking(move || store.evict_lru(cap)).await?;
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            info!(evicted, cap_bytes = cap, "Persistent cache trimmed to size cap");
        }
        Ok(evicted)
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            persistent_hits: c.persistent_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            computes: c.computes.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            corrupt: c.corrupt.load(Ordering::Relaxed),
            memory_entries: self.memory.entry_count(),
        }
    }

    /// Computations currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    fn invalidate_memory_where(&self, predicate: impl Fn(&MemoryEntry) -> bool) -> usize {
        let doomed: Vec<CacheKey> = self
            .memory
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(key, _)| CacheKey::clone(&key))
            .collect();
        for key in &doomed {
            self.memory.invalidate(key);
        }
        doomed.len()
    }

    fn jittered_ttl(&self, base: Duration) -> Duration {
        let jitter = self.config.ttl_jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }
}

async fn wait_for_flight(mut rx: watch::Receiver<FlightResult>) -> GateResult<Payload> {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return last.unwrap_or_else(|| {
                Err(GateError::cancelled("computing caller dropped before finishing"))
            });
        }
    }
}

fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn encode_blob(
    key: &CacheKey,
    stage: Option<Stage>,
    payload: &Payload,
    threshold: usize,
    now_ms: i64,
    expires_at_ms: i64,
) -> StoredBlob {
    let compressed = if payload.len() > threshold {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        match encoder.write_all(payload) {
            Ok(()) => encoder.finish().ok(),
            Err(_) => None,
        }
    } else {
        None
    };

    let (data, compressed) = match compressed {
        Some(data) => (data, true),
        None => (payload.to_vec(), false),
    };

    StoredBlob {
        key: key.as_str().to_string(),
        stage: stage.map(|s| s.as_str().to_string()),
        checksum: checksum(&data),
        data,
        compressed,
        created_at_ms: now_ms,
        expires_at_ms,
        hit_count: 0,
        last_accessed_ms: now_ms,
    }
}

fn decode_blob(blob: &StoredBlob) -> Result<Payload, String> {
    if checksum(&blob.data) != blob.checksum {
        return Err("checksum mismatch".to_string());
    }
    if !blob.compressed {
        return Ok(Payload::from(blob.data.clone()));
    }
    let mut out = Vec::new();
    DeflateDecoder::new(blob.data.as_slice())
        .read_to_end(&mut out)
        .map_err(|e| format!("decompression failed: {e}"))?;
    Ok(Payload::from(out))
}
