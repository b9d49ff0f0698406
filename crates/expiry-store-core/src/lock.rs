use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Identity of one annotation session: host, user, process and a random
/// session token, so two sessions in one process are still distinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub host: String,
    pub user: String,
    pub pid: u32,
    pub session: String,
}

impl Owner {
    /// Identity of a new session in the current process.
    pub fn current() -> Self {
        Self {
            host: local_host(),
            user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            session: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
        }
    }

    /// Same host/user/process with an explicit session token.
    pub fn with_session(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            ..Self::current()
        }
    }

    /// Opaque identity string stored in lock tokens and records.
    pub fn id(&self) -> String {
        format!("{}/{}/{}/{}", self.host, self.user, self.pid, self.session)
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Host name used when the real one cannot be determined.
pub const UNKNOWN_HOST: &str = "localhost";

/// Best-effort host name without extra dependencies.
pub(crate) fn local_host() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}

/// Contents of the sentinel file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub owner: String,
    pub host: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockToken {
    pub fn new(owner: &Owner) -> Self {
        Self {
            owner: owner.id(),
            host: owner.host.clone(),
            pid: owner.pid,
            acquired_at: Utc::now(),
        }
    }

    /// Age of the token at `now`; zero if the holder's clock runs ahead.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_older_than(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) > threshold
    }
}

/// Proof of lock ownership returned by `LockManager::acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub path: PathBuf,
    pub token: LockToken,
}

/// Outcome of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Someone reclaimed the lock after it went stale; it was left alone.
    NotOwner { holder: String },
    NotFound,
}

/// Cooperative cross-process mutual exclusion.
///
/// Ownership is advisory: every writer of the shared document must go through
/// the same manager. A token older than the configured stale threshold is
/// presumed abandoned and may be reclaimed.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Returns the lock identifier (e.g., "sentinel").
    fn lock_type(&self) -> &'static str;

    /// Block until the lock is obtained, retrying every `retry_interval`,
    /// or fail with `LockTimeout` once `timeout` has elapsed.
    async fn acquire(
        &self,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<HeldLock, StoreError>;

    /// Refresh `acquired_at` so a long-held lock is not considered stale.
    /// Fails with `LockLost` if someone else now holds it.
    async fn renew(&self, lock: &mut HeldLock) -> Result<(), StoreError>;

    /// Release the lock if it is still ours.
    async fn release(&self, lock: HeldLock) -> Result<ReleaseOutcome, StoreError>;

    /// Current token, if the lock is held by anyone.
    async fn inspect(&self) -> Result<Option<LockToken>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_in_one_process_are_distinct() {
        let a = Owner::current();
        let b = Owner::current();
        assert_eq!(a.pid, b.pid);
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with(&a.host));
    }

    #[test]
    fn test_token_age() {
        let owner = Owner::with_session("s1");
        let mut token = LockToken::new(&owner);
        token.acquired_at = Utc::now() - chrono::Duration::seconds(120);

        assert!(token.is_older_than(Utc::now(), Duration::from_secs(60)));
        assert!(!token.is_older_than(Utc::now(), Duration::from_secs(600)));
        assert_eq!(token.owner, owner.id());
    }

    #[test]
    fn test_future_token_has_zero_age() {
        let mut token = LockToken::new(&Owner::with_session("s1"));
        token.acquired_at = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(token.age(Utc::now()), Duration::ZERO);
    }
}
