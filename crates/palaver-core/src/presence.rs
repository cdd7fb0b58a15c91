//! Presence registry.
//!
//! Maps online user ids to the outbound event channel of their live socket
//! task. A user holds at most one connection per registry: registering a
//! second socket atomically replaces the first, and the superseded handle is
//! returned so the caller can tear the old session down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;

use palaver_models::ServerEvent;

/// Outbound queue depth per connection. A client that cannot drain this many
/// events is effectively dead and further sends to it report failure.
pub const EVENT_QUEUE_DEPTH: usize = 256;

pub type ConnId = u64;

/// One live connection: its registry-issued id and the channel draining into
/// the socket writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: ConnId,
    pub tx: mpsc::Sender<ServerEvent>,
}

pub struct PresenceRegistry {
    label: &'static str,
    next_conn_id: AtomicU64,
    connections: RwLock<HashMap<i64, ConnectionHandle>>,
}

impl PresenceRegistry {
    pub fn new(label: &'static str) -> Self {
        PresenceRegistry {
            label,
            next_conn_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Registers a connection for `user_id`, replacing any existing one in
    /// the same atomic step. Returns the new connection id and, if the user
    /// was already online, the superseded handle for teardown.
    pub fn register(
        &self,
        user_id: i64,
        tx: mpsc::Sender<ServerEvent>,
    ) -> (ConnId, Option<ConnectionHandle>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle { conn_id, tx };
        let old = {
            let mut connections = self.connections.write().unwrap();
            connections.insert(user_id, handle)
        };
        if old.is_some() {
            tracing::debug!(registry = self.label, user_id, conn_id, "connection superseded");
        }
        (conn_id, old)
    }

    /// Removes the user's connection, but only if it is still the one
    /// identified by `conn_id`. A superseded socket unwinding after its
    /// replacement registered must not evict the live connection.
    pub fn remove(&self, user_id: i64, conn_id: ConnId) -> bool {
        let mut connections = self.connections.write().unwrap();
        match connections.get(&user_id) {
            Some(handle) if handle.conn_id == conn_id => {
                connections.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Queues an event for `user_id`. Returns false if the user is offline
    /// or their outbound queue is full.
    pub fn send(&self, user_id: i64, event: ServerEvent) -> bool {
        let connections = self.connections.read().unwrap();
        match connections.get(&user_id) {
            Some(handle) => handle.tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Queues an event for every online user. Slow consumers are skipped.
    pub fn broadcast(&self, event: &ServerEvent) {
        let connections = self.connections.read().unwrap();
        for handle in connections.values() {
            let _ = handle.tx.try_send(event.clone());
        }
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.connections.read().unwrap().contains_key(&user_id)
    }

    /// Ids of everyone currently online, sorted for stable output.
    pub fn snapshot(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.connections.read().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<ServerEvent>, mpsc::Receiver<ServerEvent>) {
        mpsc::channel(EVENT_QUEUE_DEPTH)
    }

    #[tokio::test]
    async fn register_and_send() {
        let registry = PresenceRegistry::new("test");
        let (tx, mut rx) = channel();
        registry.register(7, tx);

        assert!(registry.send(7, ServerEvent::Calling { callee_id: 9 }));
        match rx.recv().await.unwrap() {
            ServerEvent::Calling { callee_id } => assert_eq!(callee_id, 9),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_offline_user_fails() {
        let registry = PresenceRegistry::new("test");
        assert!(!registry.send(1, ServerEvent::Calling { callee_id: 2 }));
    }

    #[tokio::test]
    async fn second_register_supersedes_first() {
        let registry = PresenceRegistry::new("test");
        let (tx_old, _rx_old) = channel();
        let (tx_new, mut rx_new) = channel();

        let (old_id, none) = registry.register(7, tx_old);
        assert!(none.is_none());

        let (new_id, superseded) = registry.register(7, tx_new);
        assert_ne!(old_id, new_id);
        assert_eq!(superseded.unwrap().conn_id, old_id);
        assert_eq!(registry.len(), 1);

        assert!(registry.send(7, ServerEvent::Calling { callee_id: 1 }));
        assert!(matches!(
            rx_new.recv().await.unwrap(),
            ServerEvent::Calling { callee_id: 1 }
        ));
    }

    #[tokio::test]
    async fn stale_remove_leaves_live_connection() {
        let registry = PresenceRegistry::new("test");
        let (tx_old, _rx_old) = channel();
        let (tx_new, _rx_new) = channel();

        let (old_id, _) = registry.register(7, tx_old);
        let (_, superseded) = registry.register(7, tx_new);
        assert!(superseded.is_some());

        // The superseded socket's cleanup runs after the replacement won.
        assert!(!registry.remove(7, old_id));
        assert!(registry.is_online(7));
    }

    #[tokio::test]
    async fn remove_with_current_id_takes_effect() {
        let registry = PresenceRegistry::new("test");
        let (tx, _rx) = channel();
        let (conn_id, _) = registry.register(7, tx);

        assert!(registry.remove(7, conn_id));
        assert!(!registry.is_online(7));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_sorted() {
        let registry = PresenceRegistry::new("test");
        for id in [42, 3, 17] {
            let (tx, rx) = channel();
            registry.register(id, tx);
            std::mem::forget(rx);
        }
        assert_eq!(registry.snapshot(), vec![3, 17, 42]);
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone() {
        let registry = PresenceRegistry::new("test");
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        registry.register(1, tx1);
        registry.register(2, tx2);

        registry.broadcast(&ServerEvent::Calling { callee_id: 5 });

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn full_queue_reports_failure() {
        let registry = PresenceRegistry::new("test");
        let (tx, _rx) = mpsc::channel(1);
        registry.register(7, tx);

        assert!(registry.send(7, ServerEvent::Calling { callee_id: 1 }));
        assert!(!registry.send(7, ServerEvent::Calling { callee_id: 2 }));
    }
}
