use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use expiry_store_core::{
    HeldLock, LockManager, LockToken, Owner, ReleaseOutcome, StoreError, UNKNOWN_HOST,
};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Sentinel-file lock manager for a document on a shared filesystem.
///
/// The lock is held by whoever managed to create `path` exclusively. The file
/// contains a JSON `LockToken` naming the owner and when it was acquired. OS
/// level locks are not used because they do not travel across network shares
/// and synced checkouts.
///
/// A token is presumed abandoned when it is older than `stale_after`, or when
/// it names a dead process on this host. Abandoned tokens are overwritten.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    owner: Owner,
    stale_after: Duration,
}

/// What is currently in the sentinel file.
#[derive(Debug, Clone)]
enum Existing {
    Token(LockToken),
    /// Unparsable content, e.g. a creator that crashed mid-write.
    Unreadable { age: Duration },
}

impl Existing {
    /// Same token, or both unreadable.
    fn same_as(&self, other: &Existing) -> bool {
        match (self, other) {
            (Existing::Token(a), Existing::Token(b)) => a == b,
            (Existing::Unreadable { .. }, Existing::Unreadable { .. }) => true,
            _ => false,
        }
    }

    fn holder(&self) -> String {
        match self {
            Existing::Token(token) => token.owner.clone(),
            Existing::Unreadable { .. } => "<unreadable token>".to_string(),
        }
    }
}

impl FileLock {
    /// Create a new FileLock for the sentinel at `path`.
    pub fn new(path: impl AsRef<Path>, owner: Owner, stale_after: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            owner,
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Whether an existing token may be reclaimed.
    ///
    /// A dead holder process only counts when this host has a real name;
    /// under the fallback name two machines are indistinguishable.
    pub async fn is_stale(&self, token: &LockToken) -> bool {
        if token.is_older_than(Utc::now(), self.stale_after) {
            return true;
        }
        self.owner.host != UNKNOWN_HOST
            && token.host == self.owner.host
            && token.pid != self.owner.pid
            && !pid_is_alive(token.pid).await
    }

    /// Ensure the sentinel's directory exists.
    async fn ensure_parent_dir(&self) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await.map_err(|e| {
                StoreError::Io(format!("Failed to create lock dir {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    fn serialize(token: &LockToken) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec_pretty(token)
            .map_err(|e| StoreError::Serialization(format!("Failed to serialize lock: {}", e)))
    }

    /// Create the sentinel if it does not exist. Returns `false` if it does.
    async fn try_create(&self, token: &LockToken) -> Result<bool, StoreError> {
        let content = Self::serialize(token)?;
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to create lock {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        file.write_all(&content)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to write lock file: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::Io(format!("Failed to sync lock file: {}", e)))?;
        Ok(true)
    }

    /// Read the sentinel, if present.
    async fn read_existing(&self) -> Result<Option<Existing>, StoreError> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to read lock {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        match serde_json::from_slice::<LockToken>(&content) {
            Ok(token) => Ok(Some(Existing::Token(token))),
            Err(e) => {
                let age = fs::metadata(&self.path)
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|modified| modified.elapsed().ok())
                    .unwrap_or(Duration::ZERO);
                debug!("Lock file {} is unreadable: {}", self.path.display(), e);
                Ok(Some(Existing::Unreadable { age }))
            }
        }
    }

    /// Replace the sentinel's content atomically.
    async fn write_token(&self, token: &LockToken) -> Result<(), StoreError> {
        let content = Self::serialize(token)?;
        let temp_path = self
            .path
            .with_extension(format!("lock.{}.tmp", self.owner.session));

        fs::write(&temp_path, &content)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to write lock file: {}", e)))?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to rename lock file: {}", e)))?;
        Ok(())
    }

    /// Overwrite an abandoned token, then check that our write is the one that
    /// stuck. Gives up if the sentinel changed since it was judged stale.
    /// Two reclaimers interleaving between the re-read and the rename can
    /// still both succeed; the lock is advisory and only abandoned tokens
    /// are ever contended this way.
    async fn reclaim(&self, seen: &Existing, token: &LockToken) -> Result<bool, StoreError> {
        match self.read_existing().await? {
            Some(current) if current.same_as(seen) => {}
            _ => return Ok(false),
        }
        self.write_token(token).await?;
        match self.read_existing().await? {
            Some(Existing::Token(current)) => Ok(current.owner == token.owner),
            _ => Ok(false),
        }
    }

    fn held(&self, token: LockToken) -> HeldLock {
        HeldLock {
            path: self.path.clone(),
            token,
        }
    }
}

#[async_trait]
impl LockManager for FileLock {
    fn lock_type(&self) -> &'static str {
        "sentinel"
    }

    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<HeldLock, StoreError> {
        self.ensure_parent_dir().await?;
        let started = Instant::now();
        let deadline = started + timeout;
        let mut holder = String::from("<none>");

        loop {
            let token = LockToken::new(&self.owner);
            if self.try_create(&token).await? {
                debug!("Acquired lock {} for {}", self.path.display(), token.owner);
                return Ok(self.held(token));
            }

            match self.read_existing().await? {
                // Released between our create and read, retry right away
                None => continue,
                Some(Existing::Token(existing)) if existing.owner == token.owner => {
                    // We already hold it, refresh the timestamp
                    self.write_token(&token).await?;
                    debug!("Lock {} already held by {}, renewed", self.path.display(), token.owner);
                    return Ok(self.held(token));
                }
                Some(existing) => {
                    let stale = match &existing {
                        Existing::Token(t) => self.is_stale(t).await,
                        Existing::Unreadable { age } => *age > self.stale_after,
                    };
                    if stale {
                        warn!(
                            "Reclaiming stale lock {} from {} for {}",
                            self.path.display(),
                            existing.holder(),
                            token.owner
                        );
                        if self.reclaim(&existing, &token).await? {
                            return Ok(self.held(token));
                        }
                    }
                    holder = existing.holder();
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    "Gave up on lock {} held by {} after {:?}",
                    self.path.display(),
                    holder,
                    now - started
                );
                return Err(StoreError::LockTimeout {
                    path: self.path.display().to_string(),
                    holder,
                    waited: now - started,
                });
            }
            tokio::time::sleep(retry_interval.min(deadline - now)).await;
        }
    }

    #[instrument(skip(self, lock), level = "debug")]
    async fn renew(&self, lock: &mut HeldLock) -> Result<(), StoreError> {
        match self.read_existing().await? {
            Some(Existing::Token(current)) if current.owner == lock.token.owner => {
                let mut token = lock.token.clone();
                token.acquired_at = Utc::now();
                self.write_token(&token).await?;
                debug!("Renewed lock {} for {}", self.path.display(), token.owner);
                lock.token = token;
                Ok(())
            }
            other => {
                let holder = other.map(|e| e.holder()).unwrap_or_else(|| "<none>".to_string());
                warn!(
                    "Lock {} lost by {}: now held by {}",
                    self.path.display(),
                    lock.token.owner,
                    holder
                );
                Err(StoreError::LockLost {
                    path: self.path.display().to_string(),
                    holder,
                })
            }
        }
    }

    #[instrument(skip(self, lock), level = "debug")]
    async fn release(&self, lock: HeldLock) -> Result<ReleaseOutcome, StoreError> {
        match self.read_existing().await? {
            Some(Existing::Token(current)) if current.owner == lock.token.owner => {
                if let Err(e) = fs::remove_file(&self.path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(StoreError::Io(format!("Failed to delete lock: {}", e)));
                    }
                }
                debug!("Released lock {} by {}", self.path.display(), lock.token.owner);
                Ok(ReleaseOutcome::Released)
            }
            Some(existing) => {
                debug!(
                    "Cannot release lock {}: held by {} not {}",
                    self.path.display(),
                    existing.holder(),
                    lock.token.owner
                );
                Ok(ReleaseOutcome::NotOwner {
                    holder: existing.holder(),
                })
            }
            None => {
                debug!(
                    "Lock {} not found for release by {}",
                    self.path.display(),
                    lock.token.owner
                );
                Ok(ReleaseOutcome::NotFound)
            }
        }
    }

    async fn inspect(&self) -> Result<Option<LockToken>, StoreError> {
        match self.read_existing().await? {
            Some(Existing::Token(token)) => Ok(Some(token)),
            Some(Existing::Unreadable { age }) => {
                warn!(
                    "Lock file {} is unreadable (age {:?})",
                    self.path.display(),
                    age
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(target_os = "linux")]
async fn pid_is_alive(pid: u32) -> bool {
    fs::try_exists(format!("/proc/{}", pid))
        .await
        .unwrap_or(true)
}

#[cfg(not(target_os = "linux"))]
async fn pid_is_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(stale_after: Duration) -> (FileLock, FileLock, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dates.json.lock");
        let a = FileLock::new(&path, Owner::with_session("session-a"), stale_after);
        let b = FileLock::new(&path, Owner::with_session("session-b"), stale_after);
        (a, b, temp_dir)
    }

    const SHORT: Duration = Duration::from_millis(50);
    const RETRY: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_acquire_release() {
        let (a, b, _temp) = setup(Duration::from_secs(60));

        let lock = a.acquire(SHORT, RETRY).await.unwrap();
        assert_eq!(lock.token.owner, a.owner().id());
        assert!(a.path().exists());

        let token = a.inspect().await.unwrap().unwrap();
        assert_eq!(token.owner, a.owner().id());

        assert_eq!(a.release(lock).await.unwrap(), ReleaseOutcome::Released);
        assert!(!a.path().exists());

        // Now session b can acquire
        let lock_b = b.acquire(SHORT, RETRY).await.unwrap();
        assert_eq!(lock_b.token.owner, b.owner().id());
    }

    #[tokio::test]
    async fn test_timeout_before_stale_threshold_then_reclaim() {
        let (a, b, _temp) = setup(Duration::from_millis(300));

        a.acquire(SHORT, RETRY).await.unwrap();

        match b.acquire(SHORT, RETRY).await {
            Err(StoreError::LockTimeout { holder, .. }) => assert_eq!(holder, a.owner().id()),
            other => panic!("expected LockTimeout, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(400)).await;

        let lock_b = b.acquire(SHORT, RETRY).await.unwrap();
        assert_eq!(lock_b.token.owner, b.owner().id());
        assert_eq!(b.inspect().await.unwrap().unwrap().owner, b.owner().id());
    }

    #[tokio::test]
    async fn test_release_after_takeover_leaves_new_holder() {
        let (a, b, _temp) = setup(Duration::from_millis(100));

        let lock_a = a.acquire(SHORT, RETRY).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        b.acquire(SHORT, RETRY).await.unwrap();

        match a.release(lock_a).await.unwrap() {
            ReleaseOutcome::NotOwner { holder } => assert_eq!(holder, b.owner().id()),
            other => panic!("expected NotOwner, got {:?}", other),
        }
        assert!(a.path().exists());
    }

    #[tokio::test]
    async fn test_renew_keeps_lock_fresh() {
        let (a, b, _temp) = setup(Duration::from_millis(300));

        let mut lock = a.acquire(SHORT, RETRY).await.unwrap();
        let first = lock.token.acquired_at;
        tokio::time::sleep(Duration::from_millis(200)).await;
        a.renew(&mut lock).await.unwrap();
        assert!(lock.token.acquired_at > first);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // 400ms since acquire but only 200ms since renewal
        assert!(matches!(
            b.acquire(SHORT, RETRY).await,
            Err(StoreError::LockTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_renew_after_takeover_is_lost() {
        let (a, b, _temp) = setup(Duration::from_millis(100));

        let mut lock = a.acquire(SHORT, RETRY).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        b.acquire(SHORT, RETRY).await.unwrap();

        match a.renew(&mut lock).await {
            Err(StoreError::LockLost { holder, .. }) => assert_eq!(holder, b.owner().id()),
            other => panic!("expected LockLost, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reacquire_by_same_owner() {
        let (a, _b, _temp) = setup(Duration::from_secs(60));

        a.acquire(SHORT, RETRY).await.unwrap();
        let again = a.acquire(SHORT, RETRY).await.unwrap();
        assert_eq!(again.token.owner, a.owner().id());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dead_process_on_same_host_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dates.json.lock");
        let owner = Owner {
            host: "annotator-box".to_string(),
            ..Owner::with_session("session-b")
        };
        let b = FileLock::new(&path, owner, Duration::from_secs(3600));

        let mut token = LockToken::new(b.owner());
        token.pid = u32::MAX - 1;
        token.owner = format!("{}/ghost/{}/crashed", token.host, token.pid);
        std::fs::write(&path, serde_json::to_vec(&token).unwrap()).unwrap();

        assert!(b.is_stale(&token).await);
        let lock = b.acquire(SHORT, RETRY).await.unwrap();
        assert_eq!(lock.token.owner, b.owner().id());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dead_process_under_fallback_host_is_not_reclaimed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dates.json.lock");
        let owner = |session: &str| Owner {
            host: UNKNOWN_HOST.to_string(),
            ..Owner::with_session(session)
        };
        let b = FileLock::new(&path, owner("session-b"), Duration::from_secs(3600));

        let mut token = LockToken::new(&owner("elsewhere"));
        token.pid = u32::MAX - 1;
        std::fs::write(&path, serde_json::to_vec(&token).unwrap()).unwrap();

        assert!(!b.is_stale(&token).await);
        assert!(matches!(
            b.acquire(SHORT, RETRY).await,
            Err(StoreError::LockTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_reclaim_gives_up_when_token_changed() {
        let (a, b, _temp) = setup(Duration::from_millis(50));

        let mut stale = LockToken::new(a.owner());
        stale.acquired_at = Utc::now() - chrono::Duration::seconds(60);
        let seen = Existing::Token(stale.clone());

        // Someone else took over after the token was judged stale
        a.write_token(&LockToken::new(a.owner())).await.unwrap();
        let ours = LockToken::new(b.owner());
        assert!(!b.reclaim(&seen, &ours).await.unwrap());
        assert_eq!(b.inspect().await.unwrap().unwrap().owner, a.owner().id());

        // Still the stale token: the takeover goes through
        a.write_token(&stale).await.unwrap();
        assert!(b.reclaim(&seen, &ours).await.unwrap());
        assert_eq!(b.inspect().await.unwrap().unwrap().owner, b.owner().id());
    }

    #[tokio::test]
    async fn test_unreadable_token_reclaimed_only_when_old() {
        let (a, _b, _temp) = setup(Duration::from_secs(60));

        std::fs::write(a.path(), b"{\"owner\": \"half-writ").unwrap();
        assert!(matches!(
            a.acquire(SHORT, RETRY).await,
            Err(StoreError::LockTimeout { .. })
        ));

        let file = std::fs::File::options().write(true).open(a.path()).unwrap();
        file.set_modified(std::time::SystemTime::now() - Duration::from_secs(600))
            .unwrap();
        drop(file);

        let lock = a.acquire(SHORT, RETRY).await.unwrap();
        assert_eq!(lock.token.owner, a.owner().id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_locking() {
        use tokio::sync::Barrier;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("shared.json.lock");

        const NUM_TASKS: usize = 10;
        let barrier = Arc::new(Barrier::new(NUM_TASKS));
        let in_critical = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for i in 0..NUM_TASKS {
            let lock_mgr = FileLock::new(
                &path,
                Owner::with_session(format!("task-{}", i)),
                Duration::from_secs(60),
            );
            let barrier = Arc::clone(&barrier);
            let in_critical = Arc::clone(&in_critical);
            let counter = Arc::clone(&counter);

            handles.push(tokio::spawn(async move {
                barrier.wait().await;

                let lock = lock_mgr
                    .acquire(Duration::from_secs(10), Duration::from_millis(5))
                    .await
                    .expect("acquire failed");

                // Critical section: nobody else may be inside
                assert!(!in_critical.swap(true, Ordering::SeqCst), "two holders at once");
                tokio::time::sleep(Duration::from_millis(2)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                in_critical.store(false, Ordering::SeqCst);

                let outcome = lock_mgr.release(lock).await.expect("release failed");
                assert_eq!(outcome, ReleaseOutcome::Released);
            }));
        }

        for handle in handles {
            handle.await.expect("task panicked");
        }

        assert_eq!(counter.load(Ordering::SeqCst), NUM_TASKS);
    }
}
