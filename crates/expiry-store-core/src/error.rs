use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the annotation store.
///
/// Merge conflicts are not errors: they are recorded as `ConflictNote`s on the
/// winning record and reported through the commit outcome.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Lock timeout on {path} after {waited:?} (held by {holder})")]
    LockTimeout {
        path: String,
        holder: String,
        waited: Duration,
    },

    #[error("Lock lost on {path}: now held by {holder}")]
    LockLost { path: String, holder: String },

    #[error("Lock not held: {0}")]
    LockNotHeld(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt store{}: {reason}", record_suffix(.id))]
    CorruptStore { id: Option<String>, reason: String },

    #[error("Unrecoverable store {path}: primary is invalid and none of {tried} backups decoded")]
    UnrecoverableStore { path: String, tried: usize },

    #[error("Invalid record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

fn record_suffix(id: &Option<String>) -> String {
    match id {
        Some(id) => format!(" (record {id})"),
        None => String::new(),
    }
}

impl StoreError {
    pub(crate) fn corrupt(id: Option<&str>, reason: impl Into<String>) -> Self {
        StoreError::CorruptStore {
            id: id.map(str::to_string),
            reason: reason.into(),
        }
    }

    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. } | StoreError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        let timeout = StoreError::LockTimeout {
            path: "dates.json.lock".to_string(),
            holder: "host/ana/42/s1".to_string(),
            waited: Duration::from_secs(10),
        };
        assert!(timeout.is_retryable());
        assert!(StoreError::Io("disk busy".to_string()).is_retryable());

        assert!(!StoreError::corrupt(Some("img1#0"), "duplicate id").is_retryable());
        assert!(!StoreError::UnrecoverableStore {
            path: "dates.json".to_string(),
            tried: 3,
        }
        .is_retryable());
    }

    #[test]
    fn test_corrupt_store_names_the_record() {
        let err = StoreError::corrupt(Some("img1#0"), "duplicate id");
        assert_eq!(err.to_string(), "Corrupt store (record img1#0): duplicate id");
        let err = StoreError::corrupt(None, "document is empty");
        assert_eq!(err.to_string(), "Corrupt store: document is empty");
    }
}
