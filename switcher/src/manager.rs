use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::config::{Config, StratumServerInfo};
use crate::coordinator::Coordinator;
use crate::session::{Session, SessionId, SessionIdPool};

/// Central coordinator of the switching proxy: owns the configuration, the
/// coordinator handle, the session id pool and the registry of live
/// sessions per sub-account. The registry exists so operational tooling can
/// find the sessions of an account (e.g. to force a reconnect); the core
/// only guarantees registration while a session is proxying.
pub struct Manager {
    config: Arc<Config>,
    coordinator: Arc<Coordinator>,
    ids: SessionIdPool,
    sessions: DashMap<String, HashMap<u32, Arc<Session>>>,
    /// Remaining auto-registration slots. Brief overshoot under contention
    /// is tolerated; the counter may dip below zero.
    auto_reg_slots: AtomicI64,
}

impl Manager {
    pub fn new(config: Arc<Config>, coordinator: Arc<Coordinator>) -> Self {
        let slots = i64::from(config.coordinator.auto_register_max_pending);
        let ids = SessionIdPool::new(config.server.max_session_id);
        Self {
            config,
            coordinator,
            ids,
            sessions: DashMap::new(),
            auto_reg_slots: AtomicI64::new(slots),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn ids(&self) -> &SessionIdPool {
        &self.ids
    }

    pub fn server_info(&self, coin: &str) -> Option<StratumServerInfo> {
        self.config.coins.get(coin).cloned()
    }

    /// Registers a session under its sub-account.
    pub fn register(&self, session: &Arc<Session>) {
        let subaccount = session.subaccount_name();
        self.sessions
            .entry(subaccount)
            .or_default()
            .insert(session.id().value(), session.clone());
        metrics::counter!("switcher_sessions_registered_total").increment(1);
    }

    pub fn unregister(&self, session: &Session) {
        let subaccount = session.subaccount_name();
        let mut emptied = false;
        if let Some(mut entry) = self.sessions.get_mut(&subaccount) {
            entry.remove(&session.id().value());
            emptied = entry.is_empty();
        }
        if emptied {
            self.sessions.remove_if(&subaccount, |_, live| live.is_empty());
        }
    }

    /// Live sessions of a sub-account.
    pub fn sessions_of(&self, subaccount: &str) -> Vec<Arc<Session>> {
        self.sessions
            .get(subaccount)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Final release when a session stops: registry entry, coordinator
    /// watches, session id.
    pub async fn release(&self, session: &Session) {
        self.unregister(session);
        self.coordinator.cancel_watches(session.id()).await;
        self.ids.release(session.id());
        metrics::counter!("switcher_sessions_closed_total").increment(1);
        debug!(session = %session.id(), "session released");
    }

    /// Claims an auto-registration slot, or `None` when too many requests
    /// are already pending.
    pub fn try_acquire_auto_reg(&self) -> Option<AutoRegPermit<'_>> {
        if self.auto_reg_slots.load(Ordering::Relaxed) < 1 {
            return None;
        }
        self.auto_reg_slots.fetch_sub(1, Ordering::Relaxed);
        Some(AutoRegPermit {
            slots: &self.auto_reg_slots,
        })
    }
}

/// RAII guard bounding concurrently pending auto-registrations.
pub struct AutoRegPermit<'a> {
    slots: &'a AtomicI64,
}

impl Drop for AutoRegPermit<'_> {
    fn drop(&mut self) {
        self.slots.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryStore;

    fn manager_with_slots(slots: u32) -> Manager {
        let mut config = Config::default();
        config.coordinator.auto_register_max_pending = slots;
        Manager::new(
            Arc::new(config),
            Arc::new(Coordinator::new(Arc::new(MemoryStore::new()))),
        )
    }

    #[test]
    fn auto_reg_permits_are_bounded_and_returned() {
        let manager = manager_with_slots(2);
        let first = manager.try_acquire_auto_reg().unwrap();
        let second = manager.try_acquire_auto_reg().unwrap();
        assert!(manager.try_acquire_auto_reg().is_none());
        drop(first);
        let third = manager.try_acquire_auto_reg().unwrap();
        drop(second);
        drop(third);
        assert!(manager.try_acquire_auto_reg().is_some());
    }
}
