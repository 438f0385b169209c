//! Peer registry: the set of live connections a device sends to, keyed by connection identity.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::connection::Connection;

/// Mutated from the accept loop, monitor tasks, and the periodic loop.
/// The lock is only held for map operations, never across I/O.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<Uuid, Arc<Connection>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if this exact connection was already registered.
    pub async fn insert(&self, conn: Arc<Connection>) -> bool {
        self.peers.lock().await.insert(conn.id(), conn).is_none()
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.peers.lock().await.remove(id)
    }

    pub async fn contains(&self, id: &Uuid) -> bool {
        self.peers.lock().await.contains_key(id)
    }

    /// Copy of the current members, for iterating without the lock.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.peers.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Remove and return every member.
    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        self.peers.lock().await.drain().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn conn(listener: &TcpListener) -> Arc<Connection> {
        let port = listener.local_addr().unwrap().port();
        let (dialed, accepted) = tokio::join!(
            Connection::connect("127.0.0.1", port, Vec::new()),
            listener.accept()
        );
        drop(accepted);
        Arc::new(dialed.unwrap())
    }

    #[tokio::test]
    async fn insert_is_unique_by_identity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = PeerRegistry::new();
        let a = conn(&listener).await;
        let b = conn(&listener).await;
        assert!(registry.insert(a.clone()).await);
        assert!(!registry.insert(a.clone()).await);
        assert!(registry.insert(b.clone()).await);
        assert_eq!(registry.len().await, 2);

        assert!(registry.remove(&a.id()).await.is_some());
        assert!(registry.remove(&a.id()).await.is_none());
        assert!(!registry.contains(&a.id()).await);
        assert!(registry.contains(&b.id()).await);
    }

    #[tokio::test]
    async fn snapshot_survives_concurrent_removal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Arc::new(PeerRegistry::new());
        for _ in 0..4 {
            registry.insert(conn(&listener).await).await;
        }
        let snapshot = registry.snapshot().await;
        let remover = {
            let registry = registry.clone();
            let ids: Vec<Uuid> = snapshot.iter().map(|c| c.id()).collect();
            tokio::spawn(async move {
                for id in ids {
                    registry.remove(&id).await;
                }
            })
        };
        for c in &snapshot {
            let _ = c.local_port();
        }
        remover.await.unwrap();
        assert_eq!(snapshot.len(), 4);
        assert!(registry.is_empty().await);
        assert!(registry.drain().await.is_empty());
    }
}
