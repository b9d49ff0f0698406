use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use expiry_store_core::{codec, Document, StoreError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// How many backup snapshots to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupRetention {
    /// Most recent snapshots kept. Always at least one.
    pub keep: usize,
    /// Snapshots older than this are dropped, except the newest.
    pub max_age: Option<Duration>,
}

impl Default for BackupRetention {
    fn default() -> Self {
        Self {
            keep: 20,
            max_age: None,
        }
    }
}

/// A snapshot in the backup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub taken_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Backup-preceded, rename-based persistence of the shared document.
///
/// Layout:
/// ```text
/// {dir}/
///   expiry_dates_all.json
///   .expiry_dates_all.json.{uuid}.tmp      (only while a write is in flight)
/// {backup_dir}/
///   expiry_dates_all.20250601T123000.123456Z.json
/// ```
///
/// The target is only ever replaced by a rename, so it is always either the
/// previous document or the new one. Callers must hold the document lock.
#[derive(Debug, Clone)]
pub struct DurableWriter {
    target: PathBuf,
    backup_dir: PathBuf,
    retention: BackupRetention,
    rename_attempts: u32,
    retry_delay: Duration,
}

/// A document encoded and synced to a temporary file, not yet visible.
#[derive(Debug)]
pub struct StagedWrite<'a> {
    writer: &'a DurableWriter,
    temp_path: PathBuf,
    document: Document,
}

impl DurableWriter {
    /// Create a new DurableWriter for `target`.
    pub fn new(
        target: impl AsRef<Path>,
        backup_dir: impl AsRef<Path>,
        retention: BackupRetention,
    ) -> Self {
        Self {
            target: target.as_ref().to_path_buf(),
            backup_dir: backup_dir.as_ref().to_path_buf(),
            retention,
            rename_attempts: 5,
            retry_delay: Duration::from_millis(50),
        }
    }

    pub fn with_rename_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.rename_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn target_dir(&self) -> PathBuf {
        self.target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn file_name(&self) -> String {
        self.target
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// `(stem, extension)` used to name backups.
    fn backup_name_parts(&self) -> (String, String) {
        let stem = self
            .target
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());
        let ext = self
            .target
            .extension()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "json".to_string());
        (stem, ext)
    }

    fn backup_path(&self, taken_at: DateTime<Utc>) -> PathBuf {
        let (stem, ext) = self.backup_name_parts();
        self.backup_dir
            .join(format!("{}.{}.{}", stem, format_stamp(taken_at), ext))
    }

    fn temp_prefix(&self) -> String {
        format!(".{}.", self.file_name())
    }

    async fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
        fs::create_dir_all(dir).await.map_err(|e| {
            StoreError::Io(format!("Failed to create dir {}: {}", dir.display(), e))
        })
    }

    /// Write `document` durably: backup, stage, rename. Returns the document
    /// as persisted, with `document_updated_at` set.
    #[instrument(skip(self, document), level = "debug", fields(records = document.len()))]
    pub async fn persist(&self, document: &Document) -> Result<Document, StoreError> {
        self.stage(document).await?.commit().await
    }

    /// Steps 1 and 2: snapshot the current target into the backup set, then
    /// encode the new document into a synced temporary file next to it.
    /// Nothing observable changes for readers of the target.
    pub async fn stage(&self, document: &Document) -> Result<StagedWrite<'_>, StoreError> {
        self.snapshot_current().await?;
        self.enforce_retention().await?;

        let mut document = document.clone();
        let now = Utc::now();
        document.document_updated_at = Some(match document.document_updated_at {
            Some(previous) if previous >= now => previous + chrono::Duration::microseconds(1),
            _ => now,
        });
        let bytes = codec::encode(&document)?;

        let dir = self.target_dir();
        Self::ensure_dir(&dir).await?;
        let temp_path = dir.join(format!(
            "{}{}.tmp",
            self.temp_prefix(),
            uuid::Uuid::new_v4().simple()
        ));

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StoreError::Io(format!("Failed to create {}: {}", temp_path.display(), e))
        })?;
        let written = async {
            file.write_all(&bytes).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io(format!(
                "Failed to write {}: {}",
                temp_path.display(),
                e
            )));
        }

        debug!("Staged {} ({} bytes)", temp_path.display(), bytes.len());
        Ok(StagedWrite {
            writer: self,
            temp_path,
            document,
        })
    }

    /// Copy the current target into the backup set, if it exists.
    async fn snapshot_current(&self) -> Result<Option<BackupInfo>, StoreError> {
        if !fs::try_exists(&self.target).await.unwrap_or(false) {
            return Ok(None);
        }
        Self::ensure_dir(&self.backup_dir).await?;

        let mut taken_at = Utc::now();
        let mut path = self.backup_path(taken_at);
        while fs::try_exists(&path).await.unwrap_or(false) {
            taken_at += chrono::Duration::microseconds(1);
            path = self.backup_path(taken_at);
        }

        // Copy then rename so a half-copied snapshot never carries a backup name
        let temp_path = path.with_extension("tmp");
        let size_bytes = fs::copy(&self.target, &temp_path).await.map_err(|e| {
            StoreError::Io(format!(
                "Failed to back up {} to {}: {}",
                self.target.display(),
                temp_path.display(),
                e
            ))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            StoreError::Io(format!("Failed to rename backup {}: {}", path.display(), e))
        })?;

        debug!("Backed up {} to {}", self.target.display(), path.display());
        Ok(Some(BackupInfo {
            path,
            taken_at,
            size_bytes,
        }))
    }

    /// Drop snapshots beyond the retention bound, oldest first.
    async fn enforce_retention(&self) -> Result<(), StoreError> {
        let backups = self.list_backups().await?;
        if backups.is_empty() {
            return Ok(());
        }

        let keep = self.retention.keep.max(1);
        let newest = backups.len() - 1;
        let now = Utc::now();
        let mut evicted = 0;

        for (i, backup) in backups.iter().enumerate() {
            if i == newest {
                break;
            }
            let over_count = backups.len() - i > keep;
            let too_old = self.retention.max_age.is_some_and(|max_age| {
                (now - backup.taken_at)
                    .to_std()
                    .map(|age| age > max_age)
                    .unwrap_or(false)
            });
            if over_count || too_old {
                match fs::remove_file(&backup.path).await {
                    Ok(()) => evicted += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(StoreError::Io(format!(
                            "Failed to evict backup {}: {}",
                            backup.path.display(),
                            e
                        )))
                    }
                }
            }
        }

        if evicted > 0 {
            debug!("Evicted {} backups from {}", evicted, self.backup_dir.display());
        }
        Ok(())
    }

    /// Snapshots of this document, oldest first.
    #[instrument(skip(self), level = "debug")]
    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>, StoreError> {
        let mut entries = match fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to read dir {}: {}",
                    self.backup_dir.display(),
                    e
                )))
            }
        };

        let (stem, ext) = self.backup_name_parts();
        let prefix = format!("{}.", stem);
        let suffix = format!(".{}", ext);
        let mut backups = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(format!("Failed to read dir entry: {}", e)))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(taken_at) = file_name
                .strip_prefix(&prefix)
                .and_then(|s| s.strip_suffix(&suffix))
                .and_then(parse_stamp)
            else {
                continue;
            };

            let metadata = entry
                .metadata()
                .await
                .map_err(|e| StoreError::Io(format!("Failed to get metadata: {}", e)))?;
            backups.push(BackupInfo {
                path: entry.path(),
                taken_at,
                size_bytes: metadata.len(),
            });
        }

        backups.sort_by(|a, b| a.taken_at.cmp(&b.taken_at).then_with(|| a.path.cmp(&b.path)));
        Ok(backups)
    }

    /// Raw bytes of one snapshot.
    pub async fn read_backup(&self, backup: &BackupInfo) -> Result<Vec<u8>, StoreError> {
        fs::read(&backup.path).await.map_err(|e| {
            StoreError::Io(format!("Failed to read backup {}: {}", backup.path.display(), e))
        })
    }

    /// Remove temporaries left behind by writers that died before renaming.
    /// Only safe while holding the document lock.
    pub async fn sweep_orphans(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        let prefix = self.temp_prefix();

        for (dir, wanted) in [
            (self.target_dir(), Some(prefix.as_str())),
            (self.backup_dir.clone(), None),
        ] {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StoreError::Io(format!(
                        "Failed to read dir {}: {}",
                        dir.display(),
                        e
                    )))
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::Io(format!("Failed to read dir entry: {}", e)))?
            {
                let name = entry.file_name().to_string_lossy().to_string();
                let matches = name.ends_with(".tmp")
                    && wanted.map_or(true, |prefix| name.starts_with(prefix));
                if matches && fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!("Removed {} orphaned temporary files", removed);
        }
        Ok(removed)
    }
}

impl StagedWrite<'_> {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Step 3: atomically replace the target, retrying transient failures.
    pub async fn commit(self) -> Result<Document, StoreError> {
        let writer = self.writer;
        let mut attempt = 1;
        loop {
            match fs::rename(&self.temp_path, &writer.target).await {
                Ok(()) => {
                    debug!(
                        "Persisted {} ({} records)",
                        writer.target.display(),
                        self.document.len()
                    );
                    return Ok(self.document);
                }
                Err(e) if attempt < writer.rename_attempts => {
                    warn!(
                        "Failed to replace {} (attempt {}/{}): {}",
                        writer.target.display(),
                        attempt,
                        writer.rename_attempts,
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(writer.retry_delay).await;
                }
                Err(e) => {
                    let _ = fs::remove_file(&self.temp_path).await;
                    return Err(StoreError::Io(format!(
                        "Failed to replace {} after {} attempts: {}",
                        writer.target.display(),
                        writer.rename_attempts,
                        e
                    )));
                }
            }
        }
    }
}

fn format_stamp(at: DateTime<Utc>) -> String {
    format!(
        "{}.{:06}Z",
        at.format("%Y%m%dT%H%M%S"),
        at.timestamp_subsec_micros()
    )
}

fn parse_stamp(s: &str) -> Option<DateTime<Utc>> {
    let (seconds, micros) = s.strip_suffix('Z')?.split_once('.')?;
    if micros.len() != 6 {
        return None;
    }
    let micros: i64 = micros.parse().ok()?;
    let base = NaiveDateTime::parse_from_str(seconds, "%Y%m%dT%H%M%S").ok()?;
    Some(base.and_utc() + chrono::Duration::microseconds(micros))
}

#[cfg(test)]
mod tests {
    use super::*;
    use expiry_store_core::{Record, RecordId};
    use tempfile::TempDir;

    fn setup(keep: usize) -> (DurableWriter, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let writer = DurableWriter::new(
            temp_dir.path().join("dates.json"),
            temp_dir.path().join("backups"),
            BackupRetention {
                keep,
                max_age: None,
            },
        );
        (writer, temp_dir)
    }

    fn doc_with(ids: &[&str]) -> Document {
        let mut doc = Document::empty();
        for id in ids {
            doc.upsert(Record::pending(RecordId::from(*id), serde_json::Value::Null).skipped());
        }
        doc
    }

    async fn read_target(writer: &DurableWriter) -> Document {
        codec::decode(&fs::read(writer.target()).await.unwrap()).unwrap()
    }

    #[test]
    fn test_stamp_round_trip() {
        let at = Utc::now();
        let truncated = parse_stamp(&format_stamp(at)).unwrap();
        assert_eq!(truncated.timestamp_micros(), at.timestamp_micros());
        assert!(parse_stamp("20250101T000000Z").is_none());
        assert!(parse_stamp("garbage").is_none());
    }

    #[tokio::test]
    async fn test_persist_and_backup() {
        let (writer, _temp) = setup(10);

        let first = writer.persist(&doc_with(&["a#0"])).await.unwrap();
        assert!(first.document_updated_at.is_some());
        assert!(writer.list_backups().await.unwrap().is_empty());
        assert_eq!(read_target(&writer).await, first);

        let second = writer.persist(&doc_with(&["a#0", "b#0"])).await.unwrap();
        assert_eq!(read_target(&writer).await, second);
        assert!(second.document_updated_at > first.document_updated_at);

        let backups = writer.list_backups().await.unwrap();
        assert_eq!(backups.len(), 1);
        let snapshot = codec::decode(&writer.read_backup(&backups[0]).await.unwrap()).unwrap();
        assert_eq!(snapshot, first);
    }

    #[tokio::test]
    async fn test_retention_keeps_newest() {
        let (writer, _temp) = setup(3);

        for i in 0..6 {
            let ids: Vec<String> = (0..=i).map(|n| format!("img#{}", n)).collect();
            let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            writer.persist(&doc_with(&refs)).await.unwrap();
        }

        let backups = writer.list_backups().await.unwrap();
        assert_eq!(backups.len(), 3);
        assert!(backups.windows(2).all(|w| w[0].taken_at < w[1].taken_at));

        // Newest backup is the fifth write (five records)
        let newest = codec::decode(&writer.read_backup(&backups[2]).await.unwrap()).unwrap();
        assert_eq!(newest.len(), 5);
    }

    #[tokio::test]
    async fn test_max_age_spares_newest() {
        let temp_dir = TempDir::new().unwrap();
        let writer = DurableWriter::new(
            temp_dir.path().join("dates.json"),
            temp_dir.path().join("backups"),
            BackupRetention {
                keep: 10,
                max_age: Some(Duration::from_millis(1)),
            },
        );

        for i in 0..4 {
            writer.persist(&doc_with(&[&format!("x#{}", i)])).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(writer.list_backups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_before_rename_keeps_previous_document() {
        let (writer, _temp) = setup(10);

        let first = writer.persist(&doc_with(&["a#0"])).await.unwrap();

        // Simulate a crash after staging: the rename never happens
        let staged = writer.stage(&doc_with(&["a#0", "b#0"])).await.unwrap();
        let temp_path = staged.temp_path().to_path_buf();
        drop(staged);

        assert!(temp_path.exists());
        assert_eq!(read_target(&writer).await, first);

        assert_eq!(writer.sweep_orphans().await.unwrap(), 1);
        assert!(!temp_path.exists());
        assert_eq!(read_target(&writer).await, first);
    }

    #[tokio::test]
    async fn test_unrelated_files_are_ignored() {
        let (writer, temp) = setup(10);
        writer.persist(&doc_with(&["a#0"])).await.unwrap();
        writer.persist(&doc_with(&["a#0"])).await.unwrap();

        std::fs::write(temp.path().join("backups").join("notes.txt"), b"hi").unwrap();
        std::fs::write(temp.path().join("other.json.tmp"), b"{}").unwrap();

        assert_eq!(writer.list_backups().await.unwrap().len(), 1);
        assert_eq!(writer.sweep_orphans().await.unwrap(), 0);
        assert!(temp.path().join("other.json.tmp").exists());
    }
}
