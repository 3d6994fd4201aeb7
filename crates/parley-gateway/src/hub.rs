use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::ServerEvent;
use parley_types::models::{PresenceState, PresenceStatus};

use crate::channels::ChannelMap;
use crate::error::GatewayError;
use crate::presence::{OFFLINE_GRACE, PresenceTracker};
use crate::registry::ConnectionRegistry;
use crate::typing::{TYPING_TTL, TypingCoordinator};

/// Manages all connected clients and coordinates the in-process registries.
/// Single-node by design: broadcasts do not cross process boundaries.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

pub(crate) struct HubInner {
    pub(crate) db: Arc<Database>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) channels: ChannelMap,
    pub(crate) typing: TypingCoordinator,
    pub(crate) presence: PresenceTracker,
    /// Per-chat send locks: held across persist→broadcast so that store
    /// insertion order equals delivery order within a chat.
    send_locks: tokio::sync::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl Hub {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                db,
                registry: ConnectionRegistry::new(),
                channels: ChannelMap::new(),
                typing: TypingCoordinator::new(),
                presence: PresenceTracker::new(),
                send_locks: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &HubInner {
        &self.inner
    }

    /// Run a store call on the blocking pool.
    pub(crate) async fn with_store<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow::anyhow!("store task join error: {e}"))?
    }

    /// The access check behind join and every mutating operation. Store
    /// failures fail closed.
    pub(crate) async fn check_access(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), GatewayError> {
        let allowed = self
            .with_store(move |db| {
                db.is_active_participant(&chat_id.to_string(), &user_id.to_string())
            })
            .await
            .unwrap_or_else(|e| {
                warn!("participant check failed for {} in {}: {}", user_id, chat_id, e);
                false
            });
        if allowed {
            Ok(())
        } else {
            Err(GatewayError::AccessDenied)
        }
    }

    // -- Connection lifecycle --

    /// Register a connection for a verified identity. The first connection
    /// flips presence to online and notifies accepted contacts.
    pub async fn register_connection(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let (conn_id, rx, _first) = self.inner.registry.register(user_id).await;

        // Any register bumps the presence generation, cancelling a pending
        // offline transition from a rapid reconnect.
        if let Some(state) = self.inner.presence.mark_online(user_id, Utc::now()) {
            self.broadcast_presence(user_id, state).await;
        }

        (conn_id, rx)
    }

    /// Tear down a connection: leave all broadcast groups, unregister, and
    /// if it was the identity's last connection, arm the offline grace
    /// timer. Typing entries are left to their own 2s expiry.
    pub async fn disconnect(&self, user_id: Uuid, conn_id: Uuid) {
        self.inner.channels.remove_conn(conn_id).await;

        let last = self.inner.registry.unregister(user_id, conn_id).await;
        if last {
            let generation = self.inner.presence.schedule_offline(user_id);
            let hub = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(OFFLINE_GRACE).await;
                hub.finish_offline(user_id, generation).await;
            });
        }
    }

    async fn finish_offline(&self, user_id: Uuid, generation: u64) {
        let now = Utc::now();
        let Some(state) = self.inner.presence.expire_offline(user_id, generation, now) else {
            return;
        };
        debug!("{} offline after grace period", user_id);

        let ts = parley_db::format_ts(now);
        if let Err(e) = self
            .with_store(move |db| db.stamp_last_seen(&user_id.to_string(), &ts))
            .await
        {
            warn!("failed to stamp last_seen for {}: {}", user_id, e);
        }
        self.broadcast_presence(user_id, state).await;
    }

    // -- Channel membership --

    /// Subscribe a connection to a chat's broadcast group, after verifying
    /// an active participant row. Membership is not re-validated per
    /// delivered event; removal from a chat takes effect on next join.
    pub async fn join_chat(
        &self,
        user_id: Uuid,
        conn_id: Uuid,
        chat_id: Uuid,
    ) -> Result<(), GatewayError> {
        self.check_access(chat_id, user_id).await?;

        let Some(tx) = self.inner.registry.sender_for(user_id, conn_id).await else {
            // Connection already torn down; nothing to subscribe.
            return Ok(());
        };
        self.inner.channels.join(chat_id, conn_id, user_id, tx).await;
        self.send_to_conn(user_id, conn_id, ServerEvent::JoinedChat { chat_id })
            .await;
        Ok(())
    }

    pub async fn leave_chat(&self, user_id: Uuid, conn_id: Uuid, chat_id: Uuid) {
        self.inner.channels.leave(chat_id, conn_id).await;
        self.send_to_conn(user_id, conn_id, ServerEvent::LeftChat { chat_id })
            .await;
    }

    // -- Typing --

    /// Record a typing burst and arm (or refresh) its expiry. Broadcasts
    /// `user_typing` only on a fresh start, to connections of everyone in
    /// the group except the typist.
    pub async fn typing_start(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        conn_id: Uuid,
        username: &str,
    ) -> Result<(), GatewayError> {
        if !self.inner.channels.contains(chat_id, conn_id).await {
            return Err(GatewayError::AccessDenied);
        }

        let (fresh, generation) = self.inner.typing.start(chat_id, user_id);
        if fresh {
            self.inner
                .channels
                .broadcast_except_user(
                    chat_id,
                    user_id,
                    ServerEvent::UserTyping {
                        chat_id,
                        user_id,
                        username: username.to_string(),
                    },
                )
                .await;
        }

        let hub = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TYPING_TTL).await;
            if hub.inner.typing.expire(chat_id, user_id, generation) {
                hub.inner
                    .channels
                    .broadcast_except_user(
                        chat_id,
                        user_id,
                        ServerEvent::UserStoppedTyping { chat_id, user_id },
                    )
                    .await;
            }
        });
        Ok(())
    }

    pub async fn typing_stop(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        conn_id: Uuid,
    ) -> Result<(), GatewayError> {
        if !self.inner.channels.contains(chat_id, conn_id).await {
            return Err(GatewayError::AccessDenied);
        }
        if self.inner.typing.stop(chat_id, user_id) {
            self.inner
                .channels
                .broadcast_except_user(
                    chat_id,
                    user_id,
                    ServerEvent::UserStoppedTyping { chat_id, user_id },
                )
                .await;
        }
        Ok(())
    }

    // -- Presence --

    /// Manual status set by the user; applied immediately, last-write-wins
    /// across devices.
    pub async fn set_status(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        status_text: Option<String>,
    ) {
        if let Some(state) = self
            .inner
            .presence
            .set_manual(user_id, status, status_text, Utc::now())
        {
            self.broadcast_presence(user_id, state).await;
        }
    }

    pub fn presence_status(&self, user_id: Uuid) -> PresenceState {
        self.inner.presence.status(user_id)
    }

    /// Fan a presence change out to the identity's accepted contacts.
    async fn broadcast_presence(&self, user_id: Uuid, state: PresenceState) {
        let contacts = match self
            .with_store(move |db| db.accepted_contacts(&user_id.to_string()))
            .await
        {
            Ok(contacts) => contacts,
            Err(e) => {
                warn!("contact lookup failed for {}: {}", user_id, e);
                return;
            }
        };

        let event = ServerEvent::UserStatusUpdate {
            user_id,
            status: state.status,
            status_text: state.status_text,
            last_seen: state.last_seen,
        };
        for contact in contacts {
            match contact.parse::<Uuid>() {
                Ok(contact_id) => {
                    self.inner.registry.send_to_user(contact_id, event.clone()).await;
                }
                Err(e) => warn!("corrupt contact id '{}': {}", contact, e),
            }
        }
    }

    // -- Targeted delivery --

    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) {
        self.inner.registry.send_to_user(user_id, event).await;
    }

    pub async fn send_to_conn(&self, user_id: Uuid, conn_id: Uuid, event: ServerEvent) {
        self.inner.registry.send_to_conn(user_id, conn_id, event).await;
    }

    pub(crate) async fn chat_send_lock(&self, chat_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.send_locks.lock().await;
        locks.entry(chat_id).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CHAT, drain, seeded_hub};
    use std::time::Duration;

    #[tokio::test]
    async fn join_requires_active_participant_row() {
        let (hub, _alice, _bob) = seeded_hub();
        let carol = Uuid::new_v4();
        hub.inner()
            .db
            .create_user(&carol.to_string(), "carol")
            .unwrap();

        let (conn, mut rx) = hub.register_connection(carol).await;
        let err = hub.join_chat(carol, conn, CHAT).await.unwrap_err();
        assert!(matches!(err, GatewayError::AccessDenied));
        assert!(!hub.inner().channels.contains(CHAT, conn).await);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_expires_within_the_ttl_window() {
        let (hub, alice, bob) = seeded_hub();
        let (a_conn, _a_rx) = hub.register_connection(alice).await;
        let (b_conn, mut b_rx) = hub.register_connection(bob).await;
        hub.join_chat(alice, a_conn, CHAT).await.unwrap();
        hub.join_chat(bob, b_conn, CHAT).await.unwrap();
        drain(&mut b_rx);

        hub.typing_start(CHAT, alice, a_conn, "alice").await.unwrap();
        let events = drain(&mut b_rx);
        assert!(
            matches!(events.as_slice(), [ServerEvent::UserTyping { user_id, .. }] if *user_id == alice)
        );

        // Just before the TTL nothing has expired.
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(drain(&mut b_rx).is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let events = drain(&mut b_rx);
        assert!(
            matches!(events.as_slice(), [ServerEvent::UserStoppedTyping { user_id, .. }] if *user_id == alice)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn typing_refresh_is_silent_and_extends_expiry() {
        let (hub, alice, bob) = seeded_hub();
        let (a_conn, _a_rx) = hub.register_connection(alice).await;
        let (b_conn, mut b_rx) = hub.register_connection(bob).await;
        hub.join_chat(alice, a_conn, CHAT).await.unwrap();
        hub.join_chat(bob, b_conn, CHAT).await.unwrap();
        drain(&mut b_rx);

        hub.typing_start(CHAT, alice, a_conn, "alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        hub.typing_start(CHAT, alice, a_conn, "alice").await.unwrap();

        // One second after the refresh the original timer has lapsed, but
        // the refreshed entry is still live and nothing was broadcast.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let events = drain(&mut b_rx);
        assert!(
            matches!(events.as_slice(), [ServerEvent::UserTyping { .. }]),
            "expected only the initial user_typing, got {:?}",
            events
        );

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let events = drain(&mut b_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::UserStoppedTyping { .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_broadcast_waits_out_the_grace_period() {
        let (hub, alice, bob) = seeded_hub();
        hub.inner()
            .db
            .add_contact(&alice.to_string(), &bob.to_string(), true)
            .unwrap();

        let (_b_conn, mut b_rx) = hub.register_connection(bob).await;
        let (a_conn, _a_rx) = hub.register_connection(alice).await;

        let events = drain(&mut b_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::UserStatusUpdate {
                status: PresenceStatus::Online,
                ..
            }]
        ));

        hub.disconnect(alice, a_conn).await;

        // Inside the grace window nothing is broadcast.
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(drain(&mut b_rx).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let events = drain(&mut b_rx);
        match events.as_slice() {
            [ServerEvent::UserStatusUpdate {
                user_id,
                status: PresenceStatus::Offline,
                last_seen,
                ..
            }] => {
                assert_eq!(*user_id, alice);
                assert!(last_seen.is_some());
            }
            other => panic!("expected exactly one offline update, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_suppresses_offline_broadcast() {
        let (hub, alice, bob) = seeded_hub();
        hub.inner()
            .db
            .add_contact(&alice.to_string(), &bob.to_string(), true)
            .unwrap();

        let (_b_conn, mut b_rx) = hub.register_connection(bob).await;
        let (a_conn, _a_rx) = hub.register_connection(alice).await;
        drain(&mut b_rx);

        hub.disconnect(alice, a_conn).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        // Tab refresh: a new connection arrives well inside the grace window.
        let (_a_conn2, _a_rx2) = hub.register_connection(alice).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(
            drain(&mut b_rx).is_empty(),
            "no presence transition may be broadcast across a rapid reconnect"
        );
        assert_eq!(hub.presence_status(alice).status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn manual_status_reaches_contacts_immediately() {
        let (hub, alice, bob) = seeded_hub();
        hub.inner()
            .db
            .add_contact(&alice.to_string(), &bob.to_string(), true)
            .unwrap();

        let (_b_conn, mut b_rx) = hub.register_connection(bob).await;
        let (_a_conn, _a_rx) = hub.register_connection(alice).await;
        drain(&mut b_rx);

        hub.set_status(alice, PresenceStatus::Away, Some("brb".into()))
            .await;
        let events = drain(&mut b_rx);
        match events.as_slice() {
            [ServerEvent::UserStatusUpdate {
                status: PresenceStatus::Away,
                status_text,
                ..
            }] => assert_eq!(status_text.as_deref(), Some("brb")),
            other => panic!("expected one away update, got {:?}", other),
        }
    }
}
