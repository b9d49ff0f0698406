use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use expiry_store_core::{
    codec, merge, ConflictNote, Document, HeldLock, LockManager, MergeOutcome, Owner, PriorState,
    Record, RecordId, RecordStatus, ReleaseOutcome, StoreError, Summary,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::config::{LockScope, StoreConfig};
use crate::lock::FileLock;
use crate::storage::{digest, read_document, BackupInfo, DurableWriter};

/// Records remembered for `revert_last`, most recent last.
const UNDO_HISTORY: usize = 64;

/// Lifecycle of a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreState::Closed => "closed",
            StoreState::Opening => "opening",
            StoreState::Open => "open",
            StoreState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Result of a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    /// Whether the primary document was rewritten.
    pub written: bool,
    /// Records in the document after the commit.
    pub records: usize,
    /// Records changed concurrently by two sessions, with the losing value.
    pub conflicts: Vec<(RecordId, ConflictNote)>,
}

/// Timestamps handed out by one session never go backwards, even if the
/// wall clock does.
#[derive(Debug, Default)]
struct SessionClock {
    last: Option<DateTime<Utc>>,
}

impl SessionClock {
    /// A timestamp strictly after both the previous tick and `floor`.
    fn tick(&mut self, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let mut now = Utc::now();
        for bound in [self.last, floor].into_iter().flatten() {
            if now <= bound {
                now = bound + chrono::Duration::microseconds(1);
            }
        }
        self.last = Some(now);
        now
    }
}

/// What `open` found on disk.
struct Loaded {
    document: Document,
    digest: Option<String>,
    recovered_from: Option<PathBuf>,
}

/// The on-disk document as seen at commit time.
struct Remote {
    document: Document,
    digest: Option<String>,
    /// False when the primary was missing or corrupt and must be rewritten.
    clean: bool,
}

/// One annotation session's view of the shared document.
///
/// Mutations only touch the in-memory working copy. `commit` merges it with
/// whatever other sessions wrote since the last load or commit and persists
/// the result under the lock.
pub struct Store {
    config: StoreConfig,
    owner: Owner,
    lock_manager: Arc<dyn LockManager>,
    writer: DurableWriter,
    state: StoreState,
    held: Option<HeldLock>,
    base: Document,
    local: Document,
    base_digest: Option<String>,
    recovered_from: Option<PathBuf>,
    clock: SessionClock,
    touched: Vec<RecordId>,
    pending_changes: usize,
}

impl Store {
    /// Open the document as a new session of the current process.
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_as(config, Owner::current()).await
    }

    /// Open the document under an explicit session identity.
    pub async fn open_as(config: StoreConfig, owner: Owner) -> Result<Self, StoreError> {
        let lock_manager = Arc::new(FileLock::new(
            &config.lock_path,
            owner.clone(),
            config.stale_after,
        ));
        Self::open_with(config, owner, lock_manager).await
    }

    #[instrument(skip(config, owner, lock_manager), level = "debug", fields(owner = %owner))]
    pub async fn open_with(
        config: StoreConfig,
        owner: Owner,
        lock_manager: Arc<dyn LockManager>,
    ) -> Result<Self, StoreError> {
        let writer = writer_for(&config);
        let mut store = Self {
            config,
            owner,
            lock_manager,
            writer,
            state: StoreState::Opening,
            held: None,
            base: Document::empty(),
            local: Document::empty(),
            base_digest: None,
            recovered_from: None,
            clock: SessionClock::default(),
            touched: Vec::new(),
            pending_changes: 0,
        };

        let held = store
            .lock_manager
            .acquire(store.config.lock_timeout, store.config.retry_interval)
            .await?;
        let loaded = load(&store.writer, &store.config).await;

        match (store.config.lock_scope, loaded) {
            (LockScope::Session, Ok(loaded)) => {
                store.held = Some(held);
                store.finish_open(loaded);
            }
            (LockScope::Commit, Ok(loaded)) => {
                release_quietly(store.lock_manager.as_ref(), held).await;
                store.finish_open(loaded);
            }
            (_, Err(e)) => {
                release_quietly(store.lock_manager.as_ref(), held).await;
                store.state = StoreState::Closed;
                return Err(e);
            }
        }

        info!(
            "Opened {} ({} records, lock scope {}) as {}",
            store.config.document_path.display(),
            store.local.len(),
            store.config.lock_scope,
            store.owner
        );
        Ok(store)
    }

    fn finish_open(&mut self, loaded: Loaded) {
        self.base = loaded.document.clone();
        self.local = loaded.document;
        self.base_digest = loaded.digest;
        self.recovered_from = loaded.recovered_from;
        self.state = StoreState::Open;
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.state == StoreState::Open {
            Ok(())
        } else {
            Err(StoreError::InvalidState(format!(
                "store for {} is {}",
                self.config.document_path.display(),
                self.state
            )))
        }
    }

    /// Insert or update a record in the working copy.
    ///
    /// The store stamps `annotator`, `updated_at` and the single-step
    /// `previous` state; conflict notes already on the record are kept.
    /// Returns `false` when the record already carries this annotation.
    pub fn upsert(&mut self, mut record: Record) -> Result<bool, StoreError> {
        self.ensure_open()?;
        record
            .check_invariants()
            .map_err(|reason| StoreError::InvalidRecord {
                id: record.id.to_string(),
                reason,
            })?;

        let existing = self.local.get(&record.id);
        if existing.is_some_and(|e| e.same_annotation(&record)) {
            return Ok(false);
        }

        let updated_at = self.clock.tick(existing.map(|e| e.updated_at));
        record.previous = match existing {
            Some(e) => Some(e.prior_state()),
            None if record.status != RecordStatus::Pending => Some(PriorState {
                status: RecordStatus::Pending,
                date_value: None,
                raw_input: None,
                updated_at,
            }),
            None => None,
        };
        if let Some(e) = existing {
            record.conflicts = e.conflicts.clone();
        }
        record.annotator = self.owner.id();
        record.updated_at = updated_at;

        debug!("Upsert {} as {}", record.id, record.status.as_str());
        self.touched.retain(|id| id != &record.id);
        if self.touched.len() >= UNDO_HISTORY {
            self.touched.remove(0);
        }
        self.touched.push(record.id.clone());
        self.local.upsert(record);
        self.pending_changes += 1;
        Ok(true)
    }

    /// Undo the last transition of `id`. Returns `false` if there is nothing
    /// to undo.
    pub fn revert(&mut self, id: &RecordId) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let record = self
            .local
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("record {}", id)))?;

        let at = self.clock.tick(Some(record.updated_at));
        if !record.revert(at) {
            return Ok(false);
        }
        record.annotator = self.owner.id();

        debug!("Reverted {} to {}", id, record.status.as_str());
        self.pending_changes += 1;
        Ok(true)
    }

    /// Undo this session's most recent transition that can still be undone.
    pub fn revert_last(&mut self) -> Result<Option<RecordId>, StoreError> {
        self.ensure_open()?;
        let me = self.owner.id();
        while let Some(id) = self.touched.pop() {
            let revertible = self
                .local
                .get(&id)
                .is_some_and(|r| r.annotator == me && r.previous.is_some());
            if revertible && self.revert(&id)? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Merge the working copy with the on-disk document and persist it.
    pub async fn commit(&mut self) -> Result<CommitOutcome, StoreError> {
        self.ensure_open()?;
        self.commit_scoped().await
    }

    /// Commit once the configured number of mutations has accumulated.
    pub async fn commit_if_due(&mut self) -> Result<Option<CommitOutcome>, StoreError> {
        self.ensure_open()?;
        let every = self.config.autosave_every;
        if every == 0 || self.pending_changes < every {
            return Ok(None);
        }
        self.commit_scoped().await.map(Some)
    }

    async fn commit_scoped(&mut self) -> Result<CommitOutcome, StoreError> {
        match self.config.lock_scope {
            LockScope::Session => {
                let Some(held) = self.held.as_mut() else {
                    return Err(StoreError::LockNotHeld(
                        self.config.lock_path.display().to_string(),
                    ));
                };
                self.lock_manager.renew(held).await?;
                self.commit_locked().await
            }
            LockScope::Commit => {
                let held = self
                    .lock_manager
                    .acquire(self.config.lock_timeout, self.config.retry_interval)
                    .await?;
                let result = self.commit_locked().await;
                release_quietly(self.lock_manager.as_ref(), held).await;
                result
            }
        }
    }

    #[instrument(skip(self), level = "debug", fields(pending = self.pending_changes))]
    async fn commit_locked(&mut self) -> Result<CommitOutcome, StoreError> {
        let remote = self.read_remote().await?;
        let MergeOutcome {
            document: merged,
            conflicts,
        } = merge(&self.base, &self.local, &remote.document);

        for (id, note) in &conflicts {
            warn!(
                "Conflict on {}: kept the newer value, {} by {} at {} superseded by {}",
                id,
                note.status.as_str(),
                note.annotator,
                note.updated_at,
                note.superseded_by
            );
        }

        if remote.clean && merged.same_content(&remote.document) {
            debug!(
                "Nothing to write to {}",
                self.config.document_path.display()
            );
            self.base = remote.document;
            self.local = merged;
            self.base_digest = remote.digest;
            self.pending_changes = 0;
            return Ok(CommitOutcome {
                written: false,
                records: self.local.len(),
                conflicts,
            });
        }

        let written = self.writer.persist(&merged).await?;
        self.base_digest = Some(digest(&codec::encode(&written)?));
        self.base = written.clone();
        self.local = written;
        self.pending_changes = 0;

        info!(
            "Committed {} records to {} ({} conflicts)",
            self.local.len(),
            self.config.document_path.display(),
            conflicts.len()
        );
        Ok(CommitOutcome {
            written: true,
            records: self.local.len(),
            conflicts,
        })
    }

    /// Re-read the primary. Callers must hold the lock.
    async fn read_remote(&self) -> Result<Remote, StoreError> {
        let path = &self.config.document_path;
        let mut bytes = self.read_primary().await?;

        if bytes.is_none() && self.base_digest.is_some() {
            // Tolerate a file briefly missing, e.g. while a sync client replaces it
            for _ in 0..self.config.io_retries {
                tokio::time::sleep(self.config.io_retry_delay).await;
                bytes = self.read_primary().await?;
                if bytes.is_some() {
                    break;
                }
            }
        }

        let Some(bytes) = bytes else {
            if self.base_digest.is_some() {
                warn!("{} disappeared, rewriting it", path.display());
            }
            return Ok(Remote {
                document: Document::empty(),
                digest: None,
                clean: self.base_digest.is_none(),
            });
        };

        let remote_digest = digest(&bytes);
        if self.base_digest.as_deref() == Some(remote_digest.as_str()) {
            return Ok(Remote {
                document: self.base.clone(),
                digest: Some(remote_digest),
                clean: true,
            });
        }

        match codec::decode(&bytes) {
            Ok(document) => Ok(Remote {
                document,
                digest: Some(remote_digest),
                clean: true,
            }),
            Err(e) => {
                warn!("{} is corrupt: {}", path.display(), e);
                let (recovered, _) = recover_from_backups(&self.writer).await?;
                let document = match recovered {
                    Some((document, backup)) => {
                        info!("Merging against backup {}", backup.path.display());
                        freshest(&self.base, &document)
                    }
                    None => self.base.clone(),
                };
                Ok(Remote {
                    document,
                    digest: None,
                    clean: false,
                })
            }
        }
    }

    async fn read_primary(&self) -> Result<Option<Vec<u8>>, StoreError> {
        read_document(
            &self.config.document_path,
            self.config.io_retries,
            self.config.io_retry_delay,
        )
        .await
    }

    /// Commit pending changes and release the lock.
    ///
    /// Fails if the store is not open, or if a session-scoped lock was taken
    /// over by another session.
    #[instrument(skip(self), level = "debug")]
    pub async fn close(&mut self) -> Result<Option<CommitOutcome>, StoreError> {
        self.ensure_open()?;
        self.state = StoreState::Closing;

        let outcome = if self.pending_changes > 0 {
            match self.commit_scoped().await {
                Ok(outcome) => Some(outcome),
                Err(e @ StoreError::LockLost { .. }) => {
                    self.held = None;
                    self.state = StoreState::Closed;
                    return Err(e);
                }
                Err(e) => {
                    self.state = StoreState::Open;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let released = match (self.config.lock_scope, self.held.take()) {
            (LockScope::Commit, _) => Ok(()),
            (LockScope::Session, None) => Err(StoreError::LockNotHeld(
                self.config.lock_path.display().to_string(),
            )),
            (LockScope::Session, Some(held)) => match self.lock_manager.release(held).await {
                Ok(ReleaseOutcome::Released) => Ok(()),
                Ok(ReleaseOutcome::NotOwner { holder }) => Err(StoreError::LockLost {
                    path: self.config.lock_path.display().to_string(),
                    holder,
                }),
                Ok(ReleaseOutcome::NotFound) => Err(StoreError::LockNotHeld(
                    self.config.lock_path.display().to_string(),
                )),
                Err(e) => Err(e),
            },
        };
        self.state = StoreState::Closed;
        released?;

        info!(
            "Closed {} as {}",
            self.config.document_path.display(),
            self.owner
        );
        Ok(outcome)
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.local.get(id)
    }

    /// The working copy, including uncommitted changes.
    pub fn document(&self) -> &Document {
        &self.local
    }

    pub fn is_annotated(&self, id: &RecordId) -> bool {
        self.local.is_annotated(id)
    }

    /// Where to resume: the first region of `order` without a final annotation.
    pub fn next_unannotated<'a, I>(&self, order: I) -> Option<&'a RecordId>
    where
        I: IntoIterator<Item = &'a RecordId>,
    {
        self.local.next_unannotated(order)
    }

    pub fn summary(&self) -> Summary {
        self.local.summary()
    }

    /// Mutations since the last commit.
    pub fn pending_changes(&self) -> usize {
        self.pending_changes
    }

    /// Backup the document was restored from at open, if the primary was corrupt.
    pub fn recovered_from(&self) -> Option<&Path> {
        self.recovered_from.as_deref()
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Totals of the current document, in a session that is closed again
    /// before returning. Also reports the backup used if the primary was
    /// corrupt.
    pub async fn read_summary(
        config: StoreConfig,
    ) -> Result<(Summary, Option<PathBuf>), StoreError> {
        let mut store = Self::open(config).await?;
        let summary = store.summary();
        let recovered_from = store.recovered_from.clone();
        store.close().await?;
        Ok((summary, recovered_from))
    }

    /// Replace the primary with a backup, under the lock. Without an explicit
    /// file the newest backup that decodes is used.
    #[instrument(skip(config), level = "debug")]
    pub async fn restore(
        config: &StoreConfig,
        owner: Owner,
        backup: Option<&Path>,
    ) -> Result<(PathBuf, Document), StoreError> {
        let lock = FileLock::new(&config.lock_path, owner, config.stale_after);
        let writer = writer_for(config);
        let held = lock
            .acquire(config.lock_timeout, config.retry_interval)
            .await?;

        let result = async {
            let (source, document) = match backup {
                Some(path) => {
                    let bytes = tokio::fs::read(path).await.map_err(|e| {
                        StoreError::Io(format!("Failed to read backup {}: {}", path.display(), e))
                    })?;
                    (path.to_path_buf(), codec::decode(&bytes)?)
                }
                None => match recover_from_backups(&writer).await? {
                    (Some((document, info)), _) => (info.path, document),
                    (None, tried) => {
                        return Err(StoreError::UnrecoverableStore {
                            path: config.document_path.display().to_string(),
                            tried,
                        })
                    }
                },
            };
            let written = writer.persist(&document).await?;
            info!(
                "Restored {} from {}",
                config.document_path.display(),
                source.display()
            );
            Ok::<_, StoreError>((source, written))
        }
        .await;

        release_quietly(&lock, held).await;
        result
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(held) = &self.held {
            warn!(
                "Store for {} dropped without close, lock {} left to expire",
                self.config.document_path.display(),
                held.path.display()
            );
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("document", &self.config.document_path)
            .field("owner", &self.owner.id())
            .field("lock", &self.lock_manager.lock_type())
            .field("state", &self.state)
            .field("records", &self.local.len())
            .field("pending_changes", &self.pending_changes)
            .finish()
    }
}

/// A store shared by the tasks of one process. Every operation goes through
/// one mutex so no two tasks commit at the same time.
#[derive(Debug, Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<Store>>,
}

impl SharedStore {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Exclusive access for sequences of operations.
    pub async fn lock(&self) -> MutexGuard<'_, Store> {
        self.inner.lock().await
    }

    pub async fn upsert(&self, record: Record) -> Result<bool, StoreError> {
        self.inner.lock().await.upsert(record)
    }

    pub async fn revert_last(&self) -> Result<Option<RecordId>, StoreError> {
        self.inner.lock().await.revert_last()
    }

    pub async fn commit(&self) -> Result<CommitOutcome, StoreError> {
        self.inner.lock().await.commit().await
    }

    pub async fn commit_if_due(&self) -> Result<Option<CommitOutcome>, StoreError> {
        self.inner.lock().await.commit_if_due().await
    }

    pub async fn close(&self) -> Result<Option<CommitOutcome>, StoreError> {
        self.inner.lock().await.close().await
    }
}

fn writer_for(config: &StoreConfig) -> DurableWriter {
    DurableWriter::new(&config.document_path, &config.backup_dir, config.retention)
        .with_rename_retries(config.io_retries, config.io_retry_delay)
}

async fn release_quietly(lock_manager: &dyn LockManager, held: HeldLock) {
    let path = held.path.clone();
    match lock_manager.release(held).await {
        Ok(ReleaseOutcome::Released) => {}
        Ok(ReleaseOutcome::NotOwner { holder }) => {
            warn!("Lock {} was taken over by {}", path.display(), holder)
        }
        Ok(ReleaseOutcome::NotFound) => warn!("Lock {} vanished while held", path.display()),
        Err(e) => warn!("Failed to release lock {}: {}", path.display(), e),
    }
}

/// Load the primary, falling back to backups if it is corrupt. Callers must
/// hold the lock.
async fn load(writer: &DurableWriter, config: &StoreConfig) -> Result<Loaded, StoreError> {
    writer.sweep_orphans().await?;

    let path = &config.document_path;
    let Some(bytes) = read_document(path, config.io_retries, config.io_retry_delay).await? else {
        debug!("{} does not exist yet, starting empty", path.display());
        return Ok(Loaded {
            document: Document::empty(),
            digest: None,
            recovered_from: None,
        });
    };

    let error = match codec::decode(&bytes) {
        Ok(document) => {
            return Ok(Loaded {
                document,
                digest: Some(digest(&bytes)),
                recovered_from: None,
            })
        }
        Err(e) => e,
    };

    warn!("{} is corrupt ({}), trying backups", path.display(), error);
    match recover_from_backups(writer).await? {
        (Some((document, backup)), _) => {
            // The corrupt primary goes into the backup set before it is replaced
            let written = writer.persist(&document).await?;
            warn!(
                "Recovered {} from backup {}",
                path.display(),
                backup.path.display()
            );
            Ok(Loaded {
                digest: Some(digest(&codec::encode(&written)?)),
                document: written,
                recovered_from: Some(backup.path),
            })
        }
        (None, tried) => Err(StoreError::UnrecoverableStore {
            path: path.display().to_string(),
            tried,
        }),
    }
}

/// Stand-in for a corrupt primary: per record, whichever of `base` and the
/// recovered backup is newer. A backup predates the last write, so it must
/// not roll back records `base` already holds in a later state.
fn freshest(base: &Document, recovered: &Document) -> Document {
    let mut document = base.clone();
    for (id, record) in &recovered.records {
        let newer = document
            .get(id)
            .map_or(true, |known| record.updated_at > known.updated_at);
        if newer {
            document.upsert(record.clone());
        }
    }
    document.schema_version = base.schema_version.max(recovered.schema_version);
    document
}

/// Newest backup that decodes cleanly, and how many backups were tried.
async fn recover_from_backups(
    writer: &DurableWriter,
) -> Result<(Option<(Document, BackupInfo)>, usize), StoreError> {
    let backups = writer.list_backups().await?;
    let mut tried = 0;
    for backup in backups.into_iter().rev() {
        tried += 1;
        let decoded = match writer.read_backup(&backup).await {
            Ok(bytes) => codec::decode(&bytes),
            Err(e) => Err(e),
        };
        match decoded {
            Ok(document) => return Ok((Some((document, backup)), tried)),
            Err(e) => warn!("Skipping backup {}: {}", backup.path.display(), e),
        }
    }
    Ok((None, tried))
}
