use std::collections::HashMap;

use tracing::warn;
use uuid::Uuid;

use parley_types::models::{MessageKind, MessagePayload, ReactionGroup, ReplySnapshot};

/// Database row types — these map directly to SQLite rows.
/// Distinct from parley-types wire models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub last_seen: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: i64,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub content: String,
    pub kind: String,
    pub reply_to_id: Option<i64>,
    pub reply_sender_id: Option<String>,
    pub reply_sender_username: Option<String>,
    pub reply_content: Option<String>,
    pub edit_count: i64,
    pub deleted: bool,
    pub created_at: String,
}

pub struct ReactionRow {
    pub id: String,
    pub message_id: i64,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

impl MessageRow {
    /// Convert to the enriched wire shape served by both the gateway
    /// broadcast and the history endpoint.
    pub fn into_payload(self, reactions: Vec<ReactionGroup>) -> MessagePayload {
        let reply_to = self.reply_to_id.map(|message_id| ReplySnapshot {
            message_id,
            sender_id: parse_uuid(self.reply_sender_id.as_deref().unwrap_or(""), self.id),
            sender_username: self.reply_sender_username.unwrap_or_default(),
            content: self.reply_content.unwrap_or_default(),
        });

        MessagePayload {
            id: self.id,
            chat_id: parse_uuid(&self.chat_id, self.id),
            sender_id: parse_uuid(&self.sender_id, self.id),
            sender_username: self.sender_username,
            content: self.content,
            kind: MessageKind::parse(&self.kind),
            reply_to,
            edit_count: self.edit_count.max(0) as u32,
            deleted: self.deleted,
            created_at: crate::parse_ts(&self.created_at),
            reactions,
        }
    }
}

fn parse_uuid(s: &str, message_id: i64) -> Uuid {
    s.parse().unwrap_or_else(|e| {
        warn!("corrupt uuid '{}' on message {}: {}", s, message_id, e);
        Uuid::default()
    })
}

/// Group raw reaction rows by message, then by emoji, preserving who
/// reacted. Corrupt user ids are skipped.
pub fn group_reactions(rows: &[ReactionRow]) -> HashMap<i64, Vec<ReactionGroup>> {
    let mut by_message: HashMap<i64, HashMap<String, Vec<Uuid>>> = HashMap::new();
    for row in rows {
        let emoji_map = by_message.entry(row.message_id).or_default();
        let user_ids = emoji_map.entry(row.emoji.clone()).or_default();
        if let Ok(uid) = row.user_id.parse::<Uuid>() {
            user_ids.push(uid);
        }
    }

    by_message
        .into_iter()
        .map(|(message_id, emoji_map)| {
            let groups = emoji_map
                .into_iter()
                .map(|(emoji, user_ids)| ReactionGroup {
                    emoji,
                    count: user_ids.len(),
                    user_ids,
                })
                .collect();
            (message_id, groups)
        })
        .collect()
}
