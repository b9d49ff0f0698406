mod file;

pub use expiry_store_core::{HeldLock, LockManager, LockToken, ReleaseOutcome};
pub use file::FileLock;
