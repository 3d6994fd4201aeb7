use std::collections::HashMap;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use parley_types::events::ServerEvent;

struct Member {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Per-chat broadcast groups: the set of connections currently subscribed
/// to a chat's events. Membership here is in-memory only and dies with the
/// connection; persistent participant state lives in the store. Access is
/// verified at join time, not per delivered event, so removal from a chat
/// takes effect on the next join or reconnect.
#[derive(Default)]
pub struct ChannelMap {
    groups: RwLock<HashMap<Uuid, HashMap<Uuid, Member>>>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(
        &self,
        chat_id: Uuid,
        conn_id: Uuid,
        user_id: Uuid,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let mut groups = self.groups.write().await;
        groups
            .entry(chat_id)
            .or_default()
            .insert(conn_id, Member { user_id, tx });
    }

    /// Always permitted; never touches persistent participant state.
    pub async fn leave(&self, chat_id: Uuid, conn_id: Uuid) -> bool {
        let mut groups = self.groups.write().await;
        let Some(group) = groups.get_mut(&chat_id) else {
            return false;
        };
        let removed = group.remove(&conn_id).is_some();
        if group.is_empty() {
            groups.remove(&chat_id);
        }
        removed
    }

    /// Disconnect cleanup: drop the connection from every group.
    pub async fn remove_conn(&self, conn_id: Uuid) {
        let mut groups = self.groups.write().await;
        groups.retain(|_, group| {
            group.remove(&conn_id);
            !group.is_empty()
        });
    }

    pub async fn contains(&self, chat_id: Uuid, conn_id: Uuid) -> bool {
        self.groups
            .read()
            .await
            .get(&chat_id)
            .is_some_and(|g| g.contains_key(&conn_id))
    }

    pub async fn broadcast(&self, chat_id: Uuid, event: ServerEvent) {
        self.fan_out(chat_id, event, |_| true).await;
    }

    /// Used by the message pipeline: the sending connection gets a
    /// dedicated ack instead of a second broadcast copy, while the
    /// sender's other devices receive the normal one.
    pub async fn broadcast_except_conn(&self, chat_id: Uuid, except: Uuid, event: ServerEvent) {
        self.fan_out(chat_id, event, |(conn_id, _)| *conn_id != except)
            .await;
    }

    /// Used by typing and read-receipt events, which exclude every
    /// connection of the originating identity.
    pub async fn broadcast_except_user(&self, chat_id: Uuid, except: Uuid, event: ServerEvent) {
        self.fan_out(chat_id, event, |(_, member)| member.user_id != except)
            .await;
    }

    async fn fan_out<F>(&self, chat_id: Uuid, event: ServerEvent, keep: F)
    where
        F: Fn((&Uuid, &Member)) -> bool,
    {
        let groups = self.groups.read().await;
        if let Some(group) = groups.get(&chat_id) {
            for (conn_id, member) in group.iter() {
                if keep((conn_id, member)) {
                    let _ = member.tx.send(event.clone());
                }
            }
        }
    }
}
