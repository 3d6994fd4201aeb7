use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use parley_db::models::group_reactions;
use parley_types::events::ServerEvent;
use parley_types::models::{MessageKind, MessagePayload, ReplySnapshot};

use crate::error::{GatewayError, send_failed};
use crate::hub::Hub;

impl Hub {
    /// The send pipeline: re-verify access, persist, enrich, broadcast,
    /// acknowledge. The broadcast step is only reached after persistence
    /// succeeds, so a failed send is never partially visible to others.
    /// A connection that closes mid-send does not cancel it; once
    /// persistence begins, the message runs to completion and is
    /// broadcast.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_message(
        &self,
        user_id: Uuid,
        username: &str,
        conn_id: Uuid,
        chat_id: Uuid,
        content: String,
        kind: MessageKind,
        reply_to: Option<i64>,
        temp_id: Option<String>,
    ) -> Result<(), GatewayError> {
        // Defense in depth beyond the group membership cached at join time.
        self.check_access(chat_id, user_id).await?;

        // Reply snapshots are resolved at send time and never updated
        // retroactively; the target must exist and belong to this chat.
        let reply = match reply_to {
            Some(reply_id) => {
                let row = self
                    .with_store(move |db| db.get_message(reply_id))
                    .await
                    .map_err(send_failed)?
                    .ok_or(GatewayError::NotFound)?;
                if row.chat_id != chat_id.to_string() {
                    return Err(GatewayError::NotFound);
                }
                Some(ReplySnapshot {
                    message_id: row.id,
                    sender_id: row.sender_id.parse().unwrap_or_default(),
                    sender_username: row.sender_username,
                    content: row.content,
                })
            }
            None => None,
        };

        // Hold the chat's send lock across persist→broadcast so delivery
        // order matches store insertion order.
        let lock = self.chat_send_lock(chat_id).await;
        let _guard = lock.lock().await;

        let created_at = Utc::now();
        let id = {
            let content = content.clone();
            let ts = parley_db::format_ts(created_at);
            let reply = reply.clone();
            self.with_store(move |db| {
                db.insert_message(
                    &chat_id.to_string(),
                    &user_id.to_string(),
                    &content,
                    kind.as_str(),
                    reply.as_ref().map(|r| r.message_id),
                    reply.as_ref().map(|r| r.sender_id.to_string()).as_deref(),
                    reply.as_ref().map(|r| r.sender_username.as_str()),
                    reply.as_ref().map(|r| r.content.as_str()),
                    &ts,
                )
            })
            .await
            .map_err(send_failed)?
        };

        let message = MessagePayload {
            id,
            chat_id,
            sender_id: user_id,
            sender_username: username.to_string(),
            content,
            kind,
            reply_to: reply,
            edit_count: 0,
            deleted: false,
            created_at,
            reactions: vec![],
        };

        debug!("message {} persisted in {}", id, chat_id);

        match temp_id {
            // The sender supplied a correlation token: its own connection
            // gets a dedicated ack instead of a second broadcast copy,
            // while its other devices receive the normal event.
            Some(temp_id) => {
                self.inner()
                    .channels
                    .broadcast_except_conn(
                        chat_id,
                        conn_id,
                        ServerEvent::NewMessage {
                            message: message.clone(),
                        },
                    )
                    .await;
                self.send_to_conn(user_id, conn_id, ServerEvent::MessageSent { temp_id, message })
                    .await;
            }
            None => {
                self.inner()
                    .channels
                    .broadcast(chat_id, ServerEvent::NewMessage { message })
                    .await;
            }
        }
        Ok(())
    }

    /// Edit an existing message. Requires sender-identity match; bumps the
    /// edit counter and broadcasts the updated payload.
    pub async fn edit_message(
        &self,
        user_id: Uuid,
        message_id: i64,
        content: String,
    ) -> Result<(), GatewayError> {
        let chat_id = self.mutable_message(user_id, message_id).await?;
        self.check_access(chat_id, user_id).await?;

        let lock = self.chat_send_lock(chat_id).await;
        let _guard = lock.lock().await;

        let changed = {
            let content = content.clone();
            self.with_store(move |db| db.apply_edit(message_id, &user_id.to_string(), &content))
                .await
                .map_err(send_failed)?
        };
        if !changed {
            // Lost a race with a concurrent delete.
            return Err(GatewayError::NotFound);
        }

        let message = self.load_payload(message_id).await?;
        self.inner()
            .channels
            .broadcast(chat_id, ServerEvent::MessageEdited { message })
            .await;
        Ok(())
    }

    /// Soft-delete a message: content cleared, flag set, row retained so
    /// reply references keep resolving.
    pub async fn delete_message(
        &self,
        user_id: Uuid,
        message_id: i64,
    ) -> Result<(), GatewayError> {
        let chat_id = self.mutable_message(user_id, message_id).await?;
        self.check_access(chat_id, user_id).await?;

        let lock = self.chat_send_lock(chat_id).await;
        let _guard = lock.lock().await;

        let changed = self
            .with_store(move |db| db.apply_delete(message_id, &user_id.to_string()))
            .await
            .map_err(send_failed)?;
        if !changed {
            return Err(GatewayError::NotFound);
        }

        self.inner()
            .channels
            .broadcast(chat_id, ServerEvent::MessageDeleted { message_id, chat_id })
            .await;
        Ok(())
    }

    /// Idempotent reaction add: a duplicate (message, identity, emoji)
    /// triple collapses silently to success and broadcasts nothing.
    pub async fn add_reaction(
        &self,
        user_id: Uuid,
        message_id: i64,
        emoji: String,
    ) -> Result<(), GatewayError> {
        let chat_id = self.reactable_chat(user_id, message_id).await?;

        let inserted = {
            let emoji = emoji.clone();
            let reaction_id = Uuid::new_v4().to_string();
            self.with_store(move |db| {
                db.add_reaction(&reaction_id, message_id, &user_id.to_string(), &emoji)
            })
            .await
            .map_err(send_failed)?
        };

        if inserted {
            self.inner()
                .channels
                .broadcast(
                    chat_id,
                    ServerEvent::ReactionAdded {
                        message_id,
                        chat_id,
                        user_id,
                        emoji,
                    },
                )
                .await;
        }
        Ok(())
    }

    pub async fn remove_reaction(
        &self,
        user_id: Uuid,
        message_id: i64,
        emoji: String,
    ) -> Result<(), GatewayError> {
        let chat_id = self.reactable_chat(user_id, message_id).await?;

        let removed = {
            let emoji = emoji.clone();
            self.with_store(move |db| db.remove_reaction(message_id, &user_id.to_string(), &emoji))
                .await
                .map_err(send_failed)?
        };

        if removed {
            self.inner()
                .channels
                .broadcast(
                    chat_id,
                    ServerEvent::ReactionRemoved {
                        message_id,
                        chat_id,
                        user_id,
                        emoji,
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Advance the read cursor to now. Regressions are rejected silently
    /// at the store; read receipts go to the rest of the group only when
    /// the cursor actually moved.
    pub async fn mark_read(&self, user_id: Uuid, chat_id: Uuid) -> Result<(), GatewayError> {
        self.check_access(chat_id, user_id).await?;

        let now = Utc::now();
        let ts = parley_db::format_ts(now);
        let advanced = self
            .with_store(move |db| {
                db.advance_read_cursor(&chat_id.to_string(), &user_id.to_string(), &ts)
            })
            .await
            .map_err(send_failed)?;

        if advanced {
            self.inner()
                .channels
                .broadcast_except_user(
                    chat_id,
                    user_id,
                    ServerEvent::MessagesRead {
                        chat_id,
                        user_id,
                        last_read_at: now,
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Shared precondition for edit/delete: the message exists, is not
    /// already deleted, and belongs to the caller.
    async fn mutable_message(&self, user_id: Uuid, message_id: i64) -> Result<Uuid, GatewayError> {
        let row = self
            .with_store(move |db| db.get_message(message_id))
            .await
            .map_err(send_failed)?
            .ok_or(GatewayError::NotFound)?;
        if row.deleted {
            return Err(GatewayError::NotFound);
        }
        if row.sender_id != user_id.to_string() {
            return Err(GatewayError::AccessDenied);
        }
        row.chat_id.parse().map_err(|_| GatewayError::NotFound)
    }

    /// Shared precondition for reactions: the message exists, is live, and
    /// the caller is an active participant of its chat.
    async fn reactable_chat(&self, user_id: Uuid, message_id: i64) -> Result<Uuid, GatewayError> {
        let row = self
            .with_store(move |db| db.get_message(message_id))
            .await
            .map_err(send_failed)?
            .ok_or(GatewayError::NotFound)?;
        if row.deleted {
            return Err(GatewayError::NotFound);
        }
        let chat_id: Uuid = row.chat_id.parse().map_err(|_| GatewayError::NotFound)?;
        self.check_access(chat_id, user_id).await?;
        Ok(chat_id)
    }

    async fn load_payload(&self, message_id: i64) -> Result<MessagePayload, GatewayError> {
        let (row, reaction_rows) = self
            .with_store(move |db| {
                let row = db.get_message(message_id)?;
                let reactions = db.get_reactions_for_messages(&[message_id])?;
                Ok((row, reactions))
            })
            .await
            .map_err(send_failed)?;
        let row = row.ok_or(GatewayError::NotFound)?;
        let mut grouped = group_reactions(&reaction_rows);
        Ok(row.into_payload(grouped.remove(&message_id).unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CHAT, drain, seeded_hub};

    #[tokio::test]
    async fn temp_id_yields_one_ack_and_one_broadcast_copy() {
        let (hub, alice, bob) = seeded_hub();
        let (a_phone, mut a_phone_rx) = hub.register_connection(alice).await;
        let (a_laptop, mut a_laptop_rx) = hub.register_connection(alice).await;
        let (b_conn, mut b_rx) = hub.register_connection(bob).await;
        hub.join_chat(alice, a_phone, CHAT).await.unwrap();
        hub.join_chat(alice, a_laptop, CHAT).await.unwrap();
        hub.join_chat(bob, b_conn, CHAT).await.unwrap();
        drain(&mut a_phone_rx);
        drain(&mut a_laptop_rx);
        drain(&mut b_rx);

        hub.send_message(
            alice,
            "alice",
            a_phone,
            CHAT,
            "hello".into(),
            MessageKind::Text,
            None,
            Some("abc".into()),
        )
        .await
        .unwrap();

        // The sending connection: exactly one ack, no broadcast copy.
        let events = drain(&mut a_phone_rx);
        match events.as_slice() {
            [ServerEvent::MessageSent { temp_id, message }] => {
                assert_eq!(temp_id, "abc");
                assert_eq!(message.content, "hello");
            }
            other => panic!("expected one message_sent, got {:?}", other),
        }

        // The sender's other device and the peer: one new_message each.
        assert!(matches!(
            drain(&mut a_laptop_rx).as_slice(),
            [ServerEvent::NewMessage { .. }]
        ));
        assert!(matches!(
            drain(&mut b_rx).as_slice(),
            [ServerEvent::NewMessage { .. }]
        ));
    }

    #[tokio::test]
    async fn continuously_subscribed_observers_see_insertion_order() {
        let (hub, alice, bob) = seeded_hub();
        let (a_conn, _a_rx) = hub.register_connection(alice).await;
        let (b_conn, mut b_rx) = hub.register_connection(bob).await;
        hub.join_chat(alice, a_conn, CHAT).await.unwrap();
        hub.join_chat(bob, b_conn, CHAT).await.unwrap();
        drain(&mut b_rx);

        for content in ["one", "two", "three"] {
            hub.send_message(
                alice,
                "alice",
                a_conn,
                CHAT,
                content.into(),
                MessageKind::Text,
                None,
                None,
            )
            .await
            .unwrap();
        }

        let ids: Vec<i64> = drain(&mut b_rx)
            .into_iter()
            .map(|event| match event {
                ServerEvent::NewMessage { message } => message.id,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn duplicate_reaction_broadcasts_once() {
        let (hub, alice, bob) = seeded_hub();
        let (a_conn, mut a_rx) = hub.register_connection(alice).await;
        let (b_conn, mut b_rx) = hub.register_connection(bob).await;
        hub.join_chat(alice, a_conn, CHAT).await.unwrap();
        hub.join_chat(bob, b_conn, CHAT).await.unwrap();

        hub.send_message(
            alice,
            "alice",
            a_conn,
            CHAT,
            "react to me".into(),
            MessageKind::Text,
            None,
            None,
        )
        .await
        .unwrap();
        let message_id = match drain(&mut b_rx).pop() {
            Some(ServerEvent::NewMessage { message }) => message.id,
            other => panic!("expected new_message, got {:?}", other),
        };
        drain(&mut a_rx);

        hub.add_reaction(bob, message_id, "👍".into()).await.unwrap();
        hub.add_reaction(bob, message_id, "👍".into()).await.unwrap();

        let reaction_events: Vec<_> = drain(&mut a_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::ReactionAdded { .. }))
            .collect();
        assert_eq!(reaction_events.len(), 1, "duplicate add must stay silent");

        hub.remove_reaction(bob, message_id, "👍".into()).await.unwrap();
        hub.remove_reaction(bob, message_id, "👍".into()).await.unwrap();
        let removal_events: Vec<_> = drain(&mut a_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::ReactionRemoved { .. }))
            .collect();
        assert_eq!(removal_events.len(), 1);
    }

    #[tokio::test]
    async fn edit_and_delete_enforce_sender_match() {
        let (hub, alice, bob) = seeded_hub();
        let (a_conn, _a_rx) = hub.register_connection(alice).await;
        let (b_conn, mut b_rx) = hub.register_connection(bob).await;
        hub.join_chat(alice, a_conn, CHAT).await.unwrap();
        hub.join_chat(bob, b_conn, CHAT).await.unwrap();

        hub.send_message(
            alice,
            "alice",
            a_conn,
            CHAT,
            "original".into(),
            MessageKind::Text,
            None,
            None,
        )
        .await
        .unwrap();
        let message_id = match drain(&mut b_rx).pop() {
            Some(ServerEvent::NewMessage { message }) => message.id,
            other => panic!("expected new_message, got {:?}", other),
        };

        let err = hub
            .edit_message(bob, message_id, "hijacked".into())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AccessDenied));
        assert!(drain(&mut b_rx).is_empty(), "failed edit must not broadcast");

        hub.edit_message(alice, message_id, "fixed".into())
            .await
            .unwrap();
        match drain(&mut b_rx).as_slice() {
            [ServerEvent::MessageEdited { message }] => {
                assert_eq!(message.content, "fixed");
                assert_eq!(message.edit_count, 1);
            }
            other => panic!("expected message_edited, got {:?}", other),
        }

        hub.delete_message(alice, message_id).await.unwrap();
        assert!(matches!(
            drain(&mut b_rx).as_slice(),
            [ServerEvent::MessageDeleted { .. }]
        ));

        // Deleted messages are gone for further mutation.
        let err = hub
            .edit_message(alice, message_id, "too late".into())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound));
    }

    #[tokio::test]
    async fn reply_snapshot_is_resolved_at_send_time() {
        let (hub, alice, bob) = seeded_hub();
        let (a_conn, _a_rx) = hub.register_connection(alice).await;
        let (b_conn, mut b_rx) = hub.register_connection(bob).await;
        hub.join_chat(alice, a_conn, CHAT).await.unwrap();
        hub.join_chat(bob, b_conn, CHAT).await.unwrap();

        hub.send_message(
            alice,
            "alice",
            a_conn,
            CHAT,
            "first".into(),
            MessageKind::Text,
            None,
            None,
        )
        .await
        .unwrap();
        let original_id = match drain(&mut b_rx).pop() {
            Some(ServerEvent::NewMessage { message }) => message.id,
            other => panic!("expected new_message, got {:?}", other),
        };

        hub.send_message(
            bob,
            "bob",
            b_conn,
            CHAT,
            "replying".into(),
            MessageKind::Text,
            Some(original_id),
            None,
        )
        .await
        .unwrap();
        let reply = match drain(&mut b_rx).pop() {
            Some(ServerEvent::NewMessage { message }) => message,
            other => panic!("expected new_message, got {:?}", other),
        };
        let snapshot = reply.reply_to.expect("reply snapshot present");
        assert_eq!(snapshot.message_id, original_id);
        assert_eq!(snapshot.content, "first");
        assert_eq!(snapshot.sender_username, "alice");

        // Editing the original later must not change the stored snapshot.
        hub.edit_message(alice, original_id, "rewritten".into())
            .await
            .unwrap();
        let stored = hub
            .with_store(move |db| db.get_message(reply.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.reply_content.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn replying_across_chats_is_not_found() {
        let (hub, alice, _bob) = seeded_hub();
        let other_chat = Uuid::from_u128(2);
        hub.inner()
            .db
            .create_chat(&other_chat.to_string(), "side")
            .unwrap();
        hub.inner()
            .db
            .add_participant(&other_chat.to_string(), &alice.to_string(), "member")
            .unwrap();

        let (a_conn, mut a_rx) = hub.register_connection(alice).await;
        hub.join_chat(alice, a_conn, CHAT).await.unwrap();
        hub.join_chat(alice, a_conn, other_chat).await.unwrap();
        drain(&mut a_rx);

        hub.send_message(
            alice,
            "alice",
            a_conn,
            CHAT,
            "here".into(),
            MessageKind::Text,
            None,
            None,
        )
        .await
        .unwrap();
        let message_id = match drain(&mut a_rx).pop() {
            Some(ServerEvent::NewMessage { message }) => message.id,
            other => panic!("expected new_message, got {:?}", other),
        };

        let err = hub
            .send_message(
                alice,
                "alice",
                a_conn,
                other_chat,
                "cross-chat reply".into(),
                MessageKind::Text,
                Some(message_id),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound));
    }

    #[tokio::test]
    async fn read_receipts_go_to_the_rest_of_the_group() {
        let (hub, alice, bob) = seeded_hub();
        let (a_conn, _a_rx) = hub.register_connection(alice).await;
        let (b_conn, mut b_rx) = hub.register_connection(bob).await;
        hub.join_chat(alice, a_conn, CHAT).await.unwrap();
        hub.join_chat(bob, b_conn, CHAT).await.unwrap();
        drain(&mut b_rx);

        hub.send_message(
            alice,
            "alice",
            a_conn,
            CHAT,
            "unread".into(),
            MessageKind::Text,
            None,
            None,
        )
        .await
        .unwrap();
        drain(&mut b_rx);

        hub.mark_read(bob, CHAT).await.unwrap();

        // Bob's own connections hear nothing; alice's do.
        assert!(drain(&mut b_rx).is_empty());

        let unread = hub
            .with_store(move |db| db.unread_count(&CHAT.to_string(), &bob.to_string()))
            .await
            .unwrap();
        assert_eq!(unread, 0);
    }

    #[tokio::test]
    async fn non_participant_send_is_denied_without_broadcast() {
        let (hub, alice, bob) = seeded_hub();
        let carol = Uuid::new_v4();
        hub.inner()
            .db
            .create_user(&carol.to_string(), "carol")
            .unwrap();

        let (a_conn, _a_rx) = hub.register_connection(alice).await;
        let (b_conn, mut b_rx) = hub.register_connection(bob).await;
        hub.join_chat(alice, a_conn, CHAT).await.unwrap();
        hub.join_chat(bob, b_conn, CHAT).await.unwrap();
        drain(&mut b_rx);

        let (c_conn, _c_rx) = hub.register_connection(carol).await;
        let err = hub
            .send_message(
                carol,
                "carol",
                c_conn,
                CHAT,
                "let me in".into(),
                MessageKind::Text,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AccessDenied));
        assert!(drain(&mut b_rx).is_empty());
    }
}
