//! Locks and the per-session lock manager.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::item::ItemState;
use crate::object_manager::ObjectManager;
use crate::transport::LockRequest;

/// A lock on a node
#[derive(Debug, Clone, PartialEq)]
pub struct Lock {
    pub path: String,
    pub token: Option<String>,
    pub owner: Option<String>,
    pub deep: bool,
    pub session_scoped: bool,
    /// `None` for infinite locks
    pub expires: Option<DateTime<Utc>>,
    pub owned_by_session: bool,
    live: bool,
}

impl Lock {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            token: None,
            owner: None,
            deep: false,
            session_scoped: true,
            expires: None,
            owned_by_session: false,
            live: true,
        }
    }

    /// Set the expiry from a timeout in seconds; `None` means infinite, as
    /// does a timeout too large to represent as a point in time.
    pub fn with_timeout(mut self, seconds: Option<u64>) -> Self {
        self.expires = seconds
            .and_then(|s| i64::try_from(s).ok())
            .and_then(Duration::try_seconds)
            .and_then(|d| Utc::now().checked_add_signed(d));
        self
    }

    pub fn is_live(&self) -> bool {
        self.live && self.expires.map_or(true, |at| at > Utc::now())
    }

    /// Seconds until expiry; `None` when the lock never expires.
    pub fn seconds_remaining(&self) -> Option<i64> {
        self.expires.map(|at| (at - Utc::now()).num_seconds().max(0))
    }

    pub(crate) fn kill(&mut self) {
        self.live = false;
    }
}

/// Tracks the locks this session created
#[derive(Debug, Default)]
pub struct LockManager {
    locks: BTreeMap<String, Lock>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(
        &mut self,
        objects: &mut ObjectManager,
        path: &str,
        request: LockRequest,
    ) -> Result<Lock> {
        let node = objects.node(path).await?;
        if node.state() != ItemState::Clean {
            return Err(Error::InvalidItemState(format!(
                "cannot lock {} with unsaved changes",
                path
            )));
        }
        if !request.session_scoped {
            return Err(Error::unsupported("open-scoped locks"));
        }

        let mut lock = objects.transport_mut().lock_node(path, &request).await?;
        lock.owned_by_session = true;
        tracing::debug!("Locked {} (deep: {})", path, lock.deep);
        self.locks.insert(path.to_string(), lock.clone());
        Ok(lock)
    }

    pub(crate) async fn unlock(&mut self, objects: &mut ObjectManager, path: &str) -> Result<()> {
        let state = objects.node(path).await?.state();
        let token = match self.locks.get(path) {
            Some(lock) if lock.is_live() => lock.token.clone().unwrap_or_default(),
            _ => {
                return Err(Error::LockConflict(format!(
                    "unable to find a lock created by this session on {}",
                    path
                )));
            }
        };
        if state != ItemState::Clean {
            return Err(Error::InvalidItemState(format!(
                "cannot unlock {} with unsaved changes",
                path
            )));
        }

        objects.transport_mut().unlock(path, &token).await?;
        if let Some(lock) = self.locks.get_mut(path) {
            lock.kill();
        }
        Ok(())
    }

    pub(crate) async fn is_locked(&mut self, objects: &mut ObjectManager, path: &str) -> Result<bool> {
        objects.node(path).await?;
        objects.transport_mut().is_locked(path).await
    }

    /// True if the node itself carries a lock (not one inherited from a
    /// deep-locked ancestor).
    pub(crate) async fn holds_lock(&mut self, objects: &mut ObjectManager, path: &str) -> Result<bool> {
        let node = objects.node(path).await?;
        if !node.has_mixin("mix:lockable") {
            return Ok(false);
        }
        Ok(node.has_property("jcr:lockIsDeep") && node.has_property("jcr:lockOwner"))
    }

    pub fn get_lock(&self, path: &str) -> Option<&Lock> {
        self.locks.get(path)
    }

    /// Tokens of every live lock held by this session.
    pub fn lock_tokens(&self) -> Vec<String> {
        self.locks
            .values()
            .filter(|l| l.is_live())
            .filter_map(|l| l.token.clone())
            .collect()
    }

    /// Release every session-scoped lock; failures are logged and ignored.
    pub(crate) async fn logout(&mut self, objects: &mut ObjectManager) {
        let locks = std::mem::take(&mut self.locks);
        for (path, mut lock) in locks {
            if !lock.is_live() || !lock.session_scoped || !lock.owned_by_session {
                continue;
            }
            let token = lock.token.clone().unwrap_or_default();
            if let Err(e) = objects.transport_mut().unlock(&path, &token).await {
                tracing::warn!("Failed to release lock on {} at logout: {}", path, e);
            }
            lock.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_expiry() {
        let infinite = Lock::new("/a").with_timeout(None);
        assert!(infinite.is_live());
        assert_eq!(infinite.seconds_remaining(), None);

        let timed = Lock::new("/a").with_timeout(Some(60));
        assert!(timed.is_live());
        assert!(timed.seconds_remaining().unwrap() <= 60);

        let mut dead = Lock::new("/a");
        dead.kill();
        assert!(!dead.is_live());
    }

    #[test]
    fn test_huge_timeouts_never_expire() {
        for seconds in [u64::MAX, i64::MAX as u64, 1 << 50] {
            let lock = Lock::new("/a").with_timeout(Some(seconds));
            assert!(lock.is_live());
            assert_eq!(lock.seconds_remaining(), None);
        }

        let year = Lock::new("/a").with_timeout(Some(365 * 24 * 3600));
        assert!(year.seconds_remaining().unwrap() > 364 * 24 * 3600);
    }
}
