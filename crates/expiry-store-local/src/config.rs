use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use crate::storage::BackupRetention;

/// Configuration for the expiry-store command line tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "expiry-store")]
#[command(about = "Inspect and edit the shared expiry-date annotation document")]
pub struct Config {
    /// Path of the shared annotation document
    #[arg(long, env = "EXPIRY_STORE_DOCUMENT")]
    pub document: Option<PathBuf>,

    /// Directory holding backup snapshots (default: `backups` next to the document)
    #[arg(long, env = "EXPIRY_STORE_BACKUP_DIR")]
    pub backup_dir: Option<PathBuf>,

    /// Lock sentinel file (default: `<document>.lock` next to the document)
    #[arg(long, env = "EXPIRY_STORE_LOCK_PATH")]
    pub lock_path: Option<PathBuf>,

    /// How long to wait for the lock before giving up, in milliseconds
    #[arg(long, default_value = "10000", env = "EXPIRY_STORE_LOCK_TIMEOUT_MS")]
    pub lock_timeout_ms: u64,

    /// Delay between lock attempts, in milliseconds
    #[arg(long, default_value = "100", env = "EXPIRY_STORE_LOCK_RETRY_MS")]
    pub lock_retry_ms: u64,

    /// Age after which a lock is presumed abandoned, in seconds
    #[arg(long, default_value = "300", env = "EXPIRY_STORE_STALE_AFTER_SECS")]
    pub stale_after_secs: u64,

    /// Number of backup snapshots to keep
    #[arg(long, default_value = "20", env = "EXPIRY_STORE_BACKUP_KEEP")]
    pub backup_keep: usize,

    /// Drop backups older than this many hours (the newest is always kept)
    #[arg(long, env = "EXPIRY_STORE_BACKUP_MAX_AGE_HOURS")]
    pub backup_max_age_hours: Option<u64>,

    /// When the lock is held: only around loads and commits, or for the whole session
    #[arg(long, default_value = "commit", env = "EXPIRY_STORE_LOCK_SCOPE")]
    pub lock_scope: LockScope,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print totals by status
    Summary,
    /// Check that the document decodes and satisfies its invariants
    Verify,
    /// List backup snapshots, newest last
    Backups,
    /// Restore the document from a backup (newest valid one by default)
    Restore {
        /// Backup file to restore from
        #[arg(long)]
        backup: Option<PathBuf>,
    },
    /// Show who holds the lock
    LockStatus,
    /// Record the outcome for one region
    Mark {
        /// Image file name
        image: String,
        /// Region index within the image
        index: usize,
        /// Normalized expiry date (YYYY-MM-DD)
        #[arg(long, requires = "raw", conflicts_with_all = ["illegible", "skip"])]
        date: Option<NaiveDate>,
        /// Text as typed by the annotator
        #[arg(long)]
        raw: Option<String>,
        /// Mark the date as unreadable
        #[arg(long, conflicts_with = "skip")]
        illegible: bool,
        /// Skip the region for now
        #[arg(long)]
        skip: bool,
        /// Opaque geometry reference (JSON)
        #[arg(long)]
        geometry: Option<String>,
    },
    /// Undo the last transition of a record
    Revert {
        /// Record id (`{image}#{index}`)
        id: String,
    },
}

impl Config {
    /// Get the effective document path.
    pub fn effective_document_path(&self) -> PathBuf {
        self.document.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("expiry-store")
                .join("expiry_dates_all.json")
        })
    }

    /// Build the store configuration from the command line.
    pub fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::new(self.effective_document_path())
            .with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .with_retry_interval(Duration::from_millis(self.lock_retry_ms))
            .with_stale_after(Duration::from_secs(self.stale_after_secs))
            .with_backup_keep(self.backup_keep)
            .with_lock_scope(self.lock_scope);
        if let Some(dir) = &self.backup_dir {
            config = config.with_backup_dir(dir);
        }
        if let Some(path) = &self.lock_path {
            config = config.with_lock_path(path);
        }
        if let Some(hours) = self.backup_max_age_hours {
            config = config.with_backup_max_age(Duration::from_secs(hours * 3600));
        }
        config
    }
}

/// How long a store holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LockScope {
    /// Held while loading at open and during each commit. Sessions run
    /// concurrently and their edits are merged.
    Commit,
    /// Held from open until close, renewed on every commit.
    Session,
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockScope::Commit => write!(f, "commit"),
            LockScope::Session => write!(f, "session"),
        }
    }
}

/// Store policy. Paths default to siblings of the document.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub document_path: PathBuf,
    pub backup_dir: PathBuf,
    pub lock_path: PathBuf,
    pub lock_timeout: Duration,
    pub retry_interval: Duration,
    pub stale_after: Duration,
    pub lock_scope: LockScope,
    pub retention: BackupRetention,
    /// Attempts for the final rename and for transient read failures.
    pub io_retries: u32,
    pub io_retry_delay: Duration,
    /// Commit after this many mutations when `commit_if_due` is called; 0 disables.
    pub autosave_every: usize,
}

impl StoreConfig {
    pub fn new(document_path: impl AsRef<Path>) -> Self {
        let document_path = document_path.as_ref().to_path_buf();
        let dir = document_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = document_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "annotations.json".to_string());

        Self {
            backup_dir: dir.join("backups"),
            lock_path: dir.join(format!("{}.lock", file_name)),
            document_path,
            lock_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(100),
            stale_after: Duration::from_secs(300),
            lock_scope: LockScope::Commit,
            retention: BackupRetention::default(),
            io_retries: 5,
            io_retry_delay: Duration::from_millis(50),
            autosave_every: 5,
        }
    }

    pub fn with_backup_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.backup_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_lock_path(mut self, path: impl AsRef<Path>) -> Self {
        self.lock_path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, threshold: Duration) -> Self {
        self.stale_after = threshold;
        self
    }

    pub fn with_lock_scope(mut self, scope: LockScope) -> Self {
        self.lock_scope = scope;
        self
    }

    pub fn with_backup_keep(mut self, keep: usize) -> Self {
        self.retention.keep = keep.max(1);
        self
    }

    pub fn with_backup_max_age(mut self, max_age: Duration) -> Self {
        self.retention.max_age = Some(max_age);
        self
    }

    pub fn with_io_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.io_retries = retries;
        self.io_retry_delay = delay;
        self
    }

    pub fn with_autosave_every(mut self, mutations: usize) -> Self {
        self.autosave_every = mutations;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_derive_from_document() {
        let config = StoreConfig::new("/shared/repo/out/expiry_dates_all.json");
        assert_eq!(config.backup_dir, PathBuf::from("/shared/repo/out/backups"));
        assert_eq!(
            config.lock_path,
            PathBuf::from("/shared/repo/out/expiry_dates_all.json.lock")
        );
        assert_eq!(config.lock_scope, LockScope::Commit);
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::parse_from([
            "expiry-store",
            "--document",
            "/tmp/x/dates.json",
            "--stale-after-secs",
            "30",
            "--backup-keep",
            "3",
            "--lock-scope",
            "session",
            "--lock-path",
            "/var/lock/dates.lock",
            "summary",
        ]);
        let store = config.store_config();
        assert_eq!(store.document_path, PathBuf::from("/tmp/x/dates.json"));
        assert_eq!(store.stale_after, Duration::from_secs(30));
        assert_eq!(store.retention.keep, 3);
        assert_eq!(store.lock_scope, LockScope::Session);
        assert_eq!(store.lock_path, PathBuf::from("/var/lock/dates.lock"));
        assert_eq!(store.backup_dir, PathBuf::from("/tmp/x/backups"));
        assert!(matches!(config.command, Command::Summary));
    }

    #[test]
    fn test_mark_requires_raw_with_date() {
        let result = Config::try_parse_from([
            "expiry-store",
            "mark",
            "img1.jpg",
            "0",
            "--date",
            "2025-02-01",
        ]);
        assert!(result.is_err());
    }
}
