//! Coordination-store access. The store itself (a hierarchical key-value
//! service with single-shot watches) sits behind the [`CoordinatorStore`]
//! trait; the [`Coordinator`] wrapper adds what sessions need on top:
//! watches keyed by the owning session so they can all be cancelled when it
//! stops, and bounded-backoff retries on transient store errors.

mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use crate::session::SessionId;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("node already exists: {0}")]
    AlreadyExists(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Fired at most once when a watched node is created, changed or deleted.
/// A cancelled watch resolves the receiver with an error instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Created,
    Changed,
    Deleted,
}

pub type WatchReceiver = oneshot::Receiver<WatchEvent>;

/// Handle a store gives out so an armed watch can be dropped again.
pub type WatchId = u64;

/// The coordination-store client. Implementations own connection handling;
/// a networked store is expected to keep a single long-lived connection and
/// reconnect transparently.
#[async_trait]
pub trait CoordinatorStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<String, StoreError>;

    /// Reads a node and arms a single-shot watch on it in one step, so no
    /// update between read and arm can be missed.
    async fn get_with_watch(&self, path: &str)
        -> Result<(String, WatchId, WatchReceiver), StoreError>;

    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Creates a persistent, world-readable node.
    async fn create(&self, path: &str, value: &str) -> Result<(), StoreError>;

    /// Drops an armed watch without delivering an event.
    async fn cancel_watch(&self, path: &str, watch: WatchId);
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Session-aware facade over a [`CoordinatorStore`].
pub struct Coordinator {
    store: Arc<dyn CoordinatorStore>,
    watches: DashMap<SessionId, Vec<(String, WatchId)>>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn CoordinatorStore>) -> Self {
        Self {
            store,
            watches: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CoordinatorStore> {
        &self.store
    }

    /// Reads `path` and arms a watch registered under `session`.
    pub async fn get_and_watch(
        &self,
        path: &str,
        session: SessionId,
    ) -> Result<(String, WatchReceiver), StoreError> {
        let (value, watch_id, receiver) =
            retry(path, || self.store.get_with_watch(path)).await?;
        self.watches
            .entry(session)
            .or_default()
            .push((path.to_string(), watch_id));
        Ok((value, receiver))
    }

    pub async fn get(&self, path: &str) -> Result<String, StoreError> {
        retry(path, || self.store.get(path)).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        retry(path, || self.store.exists(path)).await
    }

    pub async fn create(&self, path: &str, value: &str) -> Result<(), StoreError> {
        retry(path, || self.store.create(path, value)).await
    }

    /// Releases every watch still registered for `session` without firing
    /// its channel.
    pub async fn cancel_watches(&self, session: SessionId) {
        if let Some((_, registrations)) = self.watches.remove(&session) {
            for (path, watch_id) in registrations {
                self.store.cancel_watch(&path, watch_id).await;
            }
        }
    }

    #[cfg(test)]
    fn pending_watches(&self, session: SessionId) -> usize {
        self.watches.get(&session).map(|w| w.len()).unwrap_or(0)
    }
}

/// Retries transient (`Unavailable`) store errors with growing delays.
/// `NotFound` and `AlreadyExists` are answers, not failures.
async fn retry<T, F, Fut>(path: &str, mut operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Err(StoreError::Unavailable(reason)) if attempt < RETRY_ATTEMPTS => {
                attempt += 1;
                warn!(path, attempt, %reason, "coordinator unavailable, retrying");
                tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionIdPool;

    #[tokio::test]
    async fn watches_are_tracked_and_cancelled_per_session() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(store.clone());
        let pool = SessionIdPool::new(16);
        let session = pool.allocate().unwrap();

        store.set("/switcher/alice", "btc");
        let (value, receiver) = coordinator
            .get_and_watch("/switcher/alice", session)
            .await
            .unwrap();
        assert_eq!(value, "btc");
        assert_eq!(coordinator.pending_watches(session), 1);

        coordinator.cancel_watches(session).await;
        assert_eq!(coordinator.pending_watches(session), 0);
        // cancelled: the channel errs instead of delivering an event
        assert!(receiver.await.is_err());
    }

    #[tokio::test]
    async fn get_and_watch_missing_node_fails() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(store);
        let pool = SessionIdPool::new(16);
        let session = pool.allocate().unwrap();
        assert!(matches!(
            coordinator.get_and_watch("/switcher/ghost", session).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(coordinator.pending_watches(session), 0);
    }
}
