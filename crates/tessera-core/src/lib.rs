//! Tessera Core: single-file transactional record store
//!
//! A byte-key/byte-value store kept in one append-only file, with the full
//! working set replayed into RAM.
//!
//! # Architecture
//!
//! - **Read path**: served from the in-memory map, never blocked by writers
//! - **Write path**: chain lock, then one checksummed batch appended and
//!   synced, then RAM updated
//! - **Transactions**: staged in memory, committed as a single batch; replay
//!   ignores any batch without an intact Commit entry
//! - **Locking**: per-chain locks plus fcntl byte locks so several handles or
//!   processes can share the file
//!
//! Special records and schema caching live in `tessera-schema`; this crate
//! knows nothing about them.

pub mod config;
pub mod error;
pub mod format;
pub mod locks;
pub mod log;
pub mod platform;
pub mod store;
pub mod txn;

// Re-export key types for convenience
pub use config::Config;
pub use error::{StoreError, StoreResult};
pub use format::Operation;
pub use store::{PutMode, RecordIter, RecordStore, StoreStats};
pub use txn::{with_transaction, Transaction};
