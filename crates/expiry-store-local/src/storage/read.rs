use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use expiry_store_core::StoreError;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

/// SHA-256 of the document bytes, hex encoded.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Read the document, retrying transient failures such as a file briefly
/// locked by a sync client. A missing file is reported as `None`.
pub async fn read_document(
    path: &Path,
    attempts: u32,
    delay: Duration,
) -> Result<Option<Vec<u8>>, StoreError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match fs::read(path).await {
            Ok(data) => {
                debug!("Read {} ({} bytes)", path.display(), data.len());
                return Ok(Some(data));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) if attempt < attempts => {
                warn!(
                    "Failed to read {} (attempt {}/{}): {}",
                    path.display(),
                    attempt,
                    attempts,
                    e
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to read {} after {} attempts: {}",
                    path.display(),
                    attempts,
                    e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_document_is_none() {
        let temp = TempDir::new().unwrap();
        let result = read_document(&temp.path().join("nope.json"), 3, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_unreadable_path_fails_after_retries() {
        let temp = TempDir::new().unwrap();
        // A directory cannot be read as a file
        let result = read_document(temp.path(), 2, Duration::from_millis(1)).await;
        assert!(matches!(result, Err(StoreError::Io(_))));
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(digest(b"abc"), digest(b"abc"));
        assert_ne!(digest(b"abc"), digest(b"abd"));
        assert_eq!(digest(b"").len(), 64);
    }
}
