//! Session-scoped binary streams.
//!
//! Binary property values are not transferred with the node data. Instead a
//! property hands out [`BinaryStream`] handles that fetch their bytes on first
//! read through the [`SessionRegistry`], which maps a session key to the
//! backend able to serve that session's binaries. All handles created for one
//! property share one cache, so a multi-value property costs one backend call.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Backend able to fetch the raw values of a binary property
#[async_trait]
pub trait BinarySource: Send + Sync {
    /// Fetch every value of the binary property at `path`
    async fn fetch(&self, path: &str) -> Result<Vec<Bytes>>;
}

/// Key identifying a live session in a [`SessionRegistry`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn generate() -> Self {
        SessionKey(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry of live sessions' binary sources.
///
/// Cloning shares the underlying map. Sessions register at login and
/// unregister at logout (or when dropped).
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<SessionKey, Arc<dyn BinarySource>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: SessionKey, source: Arc<dyn BinarySource>) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(key, source);
        }
    }

    pub fn unregister(&self, key: &SessionKey) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(key);
        }
    }

    pub fn lookup(&self, key: &SessionKey) -> Option<Arc<dyn BinarySource>> {
        self.inner.read().ok().and_then(|map| map.get(key).cloned())
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.lookup(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry").field("sessions", &self.len()).finish()
    }
}

enum Origin {
    Registry {
        registry: SessionRegistry,
        session: SessionKey,
        path: String,
    },
    Loaded,
}

struct StreamGroup {
    origin: Origin,
    data: Mutex<Option<Vec<Bytes>>>,
    released: AtomicBool,
}

impl StreamGroup {
    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        if let Ok(mut data) = self.data.try_lock() {
            *data = None;
        }
    }
}

/// Read handle for one value of a binary property
#[derive(Clone)]
pub struct BinaryStream {
    group: Arc<StreamGroup>,
    index: usize,
}

impl BinaryStream {
    /// Handles that fetch lazily through the registry on first read.
    pub(crate) fn deferred(
        registry: &SessionRegistry,
        session: &SessionKey,
        path: &str,
        count: usize,
    ) -> (Vec<BinaryStream>, StreamGuard) {
        let group = Arc::new(StreamGroup {
            origin: Origin::Registry {
                registry: registry.clone(),
                session: session.clone(),
                path: path.to_string(),
            },
            data: Mutex::new(None),
            released: AtomicBool::new(false),
        });
        Self::split(group, count)
    }

    /// Handles over bytes already held in memory.
    pub(crate) fn loaded(values: Vec<Bytes>) -> (Vec<BinaryStream>, StreamGuard) {
        let count = values.len();
        let group = Arc::new(StreamGroup {
            origin: Origin::Loaded,
            data: Mutex::new(Some(values)),
            released: AtomicBool::new(false),
        });
        Self::split(group, count)
    }

    fn split(group: Arc<StreamGroup>, count: usize) -> (Vec<BinaryStream>, StreamGuard) {
        let guard = StreamGuard(Arc::downgrade(&group));
        let streams = (0..count)
            .map(|index| BinaryStream { group: group.clone(), index })
            .collect();
        (streams, guard)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// True once the owning property has been dropped.
    pub fn is_released(&self) -> bool {
        self.group.released.load(Ordering::SeqCst)
    }

    /// Read the whole value, fetching the property's values on first use.
    pub async fn read(&self) -> Result<Bytes> {
        if self.is_released() {
            return Err(Error::InvalidItemState("binary stream has been released".to_string()));
        }

        let mut data = self.group.data.lock().await;
        if data.is_none() {
            match &self.group.origin {
                Origin::Registry { registry, session, path } => {
                    let source = registry.lookup(session).ok_or(Error::SessionClosed)?;
                    tracing::debug!("Fetching binary values of {}", path);
                    *data = Some(source.fetch(path).await?);
                }
                Origin::Loaded => {
                    return Err(Error::InvalidItemState("binary stream has been released".to_string()));
                }
            }
        }

        data.as_ref()
            .and_then(|values| values.get(self.index).cloned())
            .ok_or_else(|| Error::ItemNotFound(format!("binary value #{}", self.index)))
    }

    /// Read the whole value as UTF-8 text.
    pub async fn read_to_string(&self) -> Result<String> {
        let bytes = self.read().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::ValueFormat(format!("binary value is not UTF-8: {}", e)))
    }
}

impl fmt::Debug for BinaryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryStream")
            .field("index", &self.index)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Held by the owning property; releases its stream group when dropped.
pub(crate) struct StreamGuard(Weak<StreamGroup>);

impl StreamGuard {
    /// False once every stream of the group has been dropped.
    pub(crate) fn is_held(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(group) = self.0.upgrade() {
            group.release();
        }
    }
}

impl fmt::Debug for StreamGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamGuard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BinarySource for CountingSource {
        async fn fetch(&self, path: &str) -> Result<Vec<Bytes>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Bytes::from(format!("{}#0", path)), Bytes::from(format!("{}#1", path))])
        }
    }

    #[tokio::test]
    async fn test_group_shares_one_fetch() {
        let registry = SessionRegistry::new();
        let key = SessionKey::generate();
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0) });
        registry.register(key.clone(), source.clone());

        let (streams, _guard) = BinaryStream::deferred(&registry, &key, "/a/data", 2);
        assert_eq!(streams[1].read().await.unwrap(), Bytes::from("/a/data#1"));
        assert_eq!(streams[0].read_to_string().await.unwrap(), "/a/data#0");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_guard_releases_streams() {
        let (streams, guard) = BinaryStream::loaded(vec![Bytes::from_static(b"abc")]);
        assert_eq!(streams[0].read().await.unwrap(), Bytes::from_static(b"abc"));

        drop(guard);
        assert!(streams[0].is_released());
        assert!(matches!(streams[0].read().await, Err(Error::InvalidItemState(_))));
    }

    #[tokio::test]
    async fn test_unregistered_session_fails() {
        let registry = SessionRegistry::new();
        let key = SessionKey::generate();
        let (streams, _guard) = BinaryStream::deferred(&registry, &key, "/a/data", 1);
        assert!(matches!(streams[0].read().await, Err(Error::SessionClosed)));
    }

    #[test]
    fn test_registry_register_unregister() {
        let registry = SessionRegistry::new();
        let key = SessionKey::generate();
        registry.register(key.clone(), Arc::new(CountingSource { calls: AtomicUsize::new(0) }));
        assert!(registry.contains(&key));
        assert_eq!(registry.len(), 1);

        let shared = registry.clone();
        shared.unregister(&key);
        assert!(registry.is_empty());
    }
}
