use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use parley_types::events::ServerEvent;

/// One live connection's server-side handle.
struct ConnHandle {
    tx: mpsc::UnboundedSender<ServerEvent>,
    #[allow(dead_code)]
    connected_at: DateTime<Utc>,
}

/// Maps a verified identity to its live connections. A single identity may
/// own several concurrent connections (multi-device); presence transitions
/// key off the first registration and the last removal.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<Uuid, HashMap<Uuid, ConnHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for an already-verified identity. Returns the
    /// connection id, the outbound event receiver, and whether this is the
    /// identity's first open connection.
    pub async fn register(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>, bool) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut conns = self.conns.write().await;
        let user_conns = conns.entry(user_id).or_default();
        let first = user_conns.is_empty();
        user_conns.insert(
            conn_id,
            ConnHandle {
                tx,
                connected_at: Utc::now(),
            },
        );
        (conn_id, rx, first)
    }

    /// Remove a connection. Returns true if it was the identity's last one.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut conns = self.conns.write().await;
        let Some(user_conns) = conns.get_mut(&user_id) else {
            return false;
        };
        user_conns.remove(&conn_id);
        if user_conns.is_empty() {
            conns.remove(&user_id);
            true
        } else {
            false
        }
    }

    pub async fn connections_for(&self, user_id: Uuid) -> Vec<Uuid> {
        self.conns
            .read()
            .await
            .get(&user_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Clone of the outbound sender, used when a connection joins a chat
    /// group so the group can deliver without registry lookups.
    pub async fn sender_for(
        &self,
        user_id: Uuid,
        conn_id: Uuid,
    ) -> Option<mpsc::UnboundedSender<ServerEvent>> {
        self.conns
            .read()
            .await
            .get(&user_id)
            .and_then(|m| m.get(&conn_id))
            .map(|h| h.tx.clone())
    }

    /// Deliver an event to every connection of one identity.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) {
        let conns = self.conns.read().await;
        if let Some(user_conns) = conns.get(&user_id) {
            for handle in user_conns.values() {
                let _ = handle.tx.send(event.clone());
            }
        }
    }

    /// Deliver an event to one specific connection.
    pub async fn send_to_conn(&self, user_id: Uuid, conn_id: Uuid, event: ServerEvent) {
        let conns = self.conns.read().await;
        if let Some(handle) = conns.get(&user_id).and_then(|m| m.get(&conn_id)) {
            let _ = handle.tx.send(event);
        }
    }
}
