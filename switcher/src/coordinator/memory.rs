use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;

use super::{CoordinatorStore, StoreError, WatchEvent, WatchId, WatchReceiver};

/// In-memory [`CoordinatorStore`] with ZooKeeper-style single-shot watches.
/// Backs the embedded deployment (fed by the in-process seeder) and the test
/// suite. The mutating helpers fire armed watches exactly once.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: DashMap<String, String>,
    watches: DashMap<String, Vec<WatchEntry>>,
    next_watch_id: AtomicU64,
}

#[derive(Debug)]
struct WatchEntry {
    id: WatchId,
    tx: oneshot::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or overwrites a node, firing its watches.
    pub fn set(&self, path: &str, value: &str) {
        let event = if self
            .nodes
            .insert(path.to_string(), value.to_string())
            .is_some()
        {
            WatchEvent::Changed
        } else {
            WatchEvent::Created
        };
        self.fire(path, event);
    }

    /// Removes a node, firing its watches.
    pub fn delete(&self, path: &str) {
        if self.nodes.remove(path).is_some() {
            self.fire(path, WatchEvent::Deleted);
        }
    }

    fn fire(&self, path: &str, event: WatchEvent) {
        if let Some((_, entries)) = self.watches.remove(path) {
            for entry in entries {
                let _ = entry.tx.send(event);
            }
        }
    }

    fn arm_watch(&self, path: &str) -> (WatchId, WatchReceiver) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        self.watches
            .entry(path.to_string())
            .or_default()
            .push(WatchEntry { id, tx });
        (id, rx)
    }
}

#[async_trait]
impl CoordinatorStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<String, StoreError> {
        self.nodes
            .get(path)
            .map(|value| value.clone())
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn get_with_watch(
        &self,
        path: &str,
    ) -> Result<(String, WatchId, WatchReceiver), StoreError> {
        if !self.nodes.contains_key(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        // Arm before the read so a concurrent update fires the watch rather
        // than slipping between the two steps.
        let (id, rx) = self.arm_watch(path);
        match self.nodes.get(path) {
            Some(value) => Ok((value.clone(), id, rx)),
            None => Err(StoreError::NotFound(path.to_string())),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.nodes.contains_key(path))
    }

    async fn create(&self, path: &str, value: &str) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.nodes.entry(path.to_string()) {
            Entry::Occupied(_) => return Err(StoreError::AlreadyExists(path.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(value.to_string());
            }
        }
        self.fire(path, WatchEvent::Created);
        Ok(())
    }

    async fn cancel_watch(&self, path: &str, watch: WatchId) {
        if let Some(mut entries) = self.watches.get_mut(path) {
            entries.retain(|entry| entry.id != watch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_exists_then_duplicate() {
        let store = MemoryStore::new();
        assert!(!store.exists("/switcher/alice").await.unwrap());
        store.create("/switcher/alice", "btc").await.unwrap();
        assert!(store.exists("/switcher/alice").await.unwrap());
        assert_eq!(store.get("/switcher/alice").await.unwrap(), "btc");
        assert!(matches!(
            store.create("/switcher/alice", "bch").await,
            Err(StoreError::AlreadyExists(_))
        ));
        // value unchanged by the failed create
        assert_eq!(store.get("/switcher/alice").await.unwrap(), "btc");
    }

    #[tokio::test]
    async fn watch_fires_once_on_change() {
        let store = MemoryStore::new();
        store.set("/switcher/alice", "btc");
        let (value, _, rx) = store.get_with_watch("/switcher/alice").await.unwrap();
        assert_eq!(value, "btc");

        store.set("/switcher/alice", "bch");
        assert_eq!(rx.await.unwrap(), WatchEvent::Changed);

        // a second change does not fire the consumed watch; a fresh one does
        let (_, _, rx) = store.get_with_watch("/switcher/alice").await.unwrap();
        store.delete("/switcher/alice");
        assert_eq!(rx.await.unwrap(), WatchEvent::Deleted);
    }

    #[tokio::test]
    async fn pending_node_consumption_fires_waiting_watch() {
        let store = MemoryStore::new();
        store.set("/autoreg/alice", "{}");
        let (_, _, rx) = store.get_with_watch("/autoreg/alice").await.unwrap();
        store.delete("/autoreg/alice");
        assert_eq!(rx.await.unwrap(), WatchEvent::Deleted);
    }

    #[tokio::test]
    async fn cancelled_watch_does_not_fire() {
        let store = MemoryStore::new();
        store.set("/switcher/alice", "btc");
        let (_, id, rx) = store.get_with_watch("/switcher/alice").await.unwrap();
        store.cancel_watch("/switcher/alice", id).await;
        store.set("/switcher/alice", "bch");
        assert!(rx.await.is_err());
    }
}
