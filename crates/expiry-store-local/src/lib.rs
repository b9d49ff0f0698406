//! Shared-filesystem backend for the expiry-date annotation store.
//!
//! - `lock`: sentinel-file `LockManager` with staleness and takeover
//! - `storage`: backup-preceded, rename-based document persistence
//! - `Store`: the session facade (`open`, `upsert`, `revert`, `commit`, `close`)
//! - `config`: command line and store configuration

pub mod config;
pub mod lock;
pub mod storage;
mod store;

pub use config::{Config, LockScope, StoreConfig};
pub use store::{CommitOutcome, SharedStore, Store, StoreState};
