//! Core types for the shared expiry-date annotation store.
//!
//! This crate holds everything that does not touch the filesystem:
//! - `Record` / `Document`: the persisted annotation model and its invariants
//! - `codec`: deterministic JSON encoding and validating decoding
//! - `merge`: three-way reconciliation of base/local/remote documents
//! - `LockManager`: the cooperative cross-process lock abstraction
//!
//! The filesystem backend and the `Store` facade live in `expiry-store-local`.

pub mod codec;
mod document;
mod error;
mod lock;
pub mod merge;
mod record;

pub use document::{Document, Summary, SCHEMA_VERSION};
pub use error::StoreError;
pub use lock::{HeldLock, LockManager, LockToken, Owner, ReleaseOutcome, UNKNOWN_HOST};
pub use merge::{merge, MergeOutcome};
pub use record::{ConflictNote, PriorState, Record, RecordId, RecordStatus};
