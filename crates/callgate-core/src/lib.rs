//! # Callgate Core
//!
//! Shared vocabulary for the callgate workspace:
//! - Error taxonomy (`GateError`, `StoreError`)
//! - Cache keys, stages, usage and quota value types
//! - The `Generator` capability the gate calls out to
//! - Persistence ports implemented by `callgate-storage`
//! - The `Clock` port used for every time-dependent decision

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod error;
pub mod generator;
pub mod store;
pub mod types;

// Re-export main types
#[cfg(any(test, feature = "test-helpers"))]
pub use clock::MockClock;
pub use clock::{Clock, SharedClock, SystemClock};
pub use error::{GateError, GateResult, RateLimitType, StoreError};
pub use generator::{Generator, UpstreamError};
pub use store::{BlobStore, KeyValueStore, StoredBlob, UsageLedger};
pub use types::{
    CacheKey, Charge, ModelUsage, Payload, QuotaKind, RawResponse, Stage, UsagePeriod,
    UsageRecord, UsageStatus, UsageSummary, UsageTotals,
};
