//! # Callgate Storage
//!
//! Persistence adapters for the gate's three storage ports:
//! - [`SqliteStore`]: durable, single-file storage backed by SQLite
//! - [`MemoryStore`]: process-local storage for tests and ephemeral runs

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
