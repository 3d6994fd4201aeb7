use crate::Database;
use crate::models::{MessageRow, ReactionRow, UserRow};
use anyhow::{Result, anyhow};
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username) VALUES (?1, ?2)",
                (id, username),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    pub fn get_username_by_id(&self, id: &str) -> Result<String> {
        self.with_conn(|conn| {
            conn.query_row("SELECT username FROM users WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(|_| anyhow!("User not found: {}", id))
        })
    }

    /// Stamp the durable last-seen timestamp on the offline transition.
    pub fn stamp_last_seen(&self, id: &str, ts: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE users SET last_seen = ?1 WHERE id = ?2", (ts, id))?;
            Ok(())
        })
    }

    // -- Chats & participants --

    pub fn create_chat(&self, id: &str, name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("INSERT INTO chats (id, name) VALUES (?1, ?2)", (id, name))?;
            Ok(())
        })
    }

    pub fn add_participant(&self, chat_id: &str, user_id: &str, role: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO participants (chat_id, user_id, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(chat_id, user_id) DO UPDATE SET left_at = NULL",
                (chat_id, user_id, role),
            )?;
            Ok(())
        })
    }

    /// Participant-layer leave (owned by a collaborator API). Distinct from
    /// dropping out of the broadcast group, which is purely in-memory.
    pub fn mark_participant_left(&self, chat_id: &str, user_id: &str, ts: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE participants SET left_at = ?1 WHERE chat_id = ?2 AND user_id = ?3",
                (ts, chat_id, user_id),
            )?;
            Ok(())
        })
    }

    /// The access check behind join and every mutating operation.
    pub fn is_active_participant(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM participants
                 WHERE chat_id = ?1 AND user_id = ?2 AND left_at IS NULL",
                (chat_id, user_id),
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    // -- Messages --

    /// Insert a message and return its store-assigned id. The rowid is the
    /// canonical delivery order within a chat. Reply snapshot fields are
    /// resolved by the caller at send time and stored verbatim.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
        kind: &str,
        reply_to_id: Option<i64>,
        reply_sender_id: Option<&str>,
        reply_sender_username: Option<&str>,
        reply_content: Option<&str>,
        created_at: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (chat_id, sender_id, content, kind, reply_to_id,
                                       reply_sender_id, reply_sender_username, reply_content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    chat_id,
                    sender_id,
                    content,
                    kind,
                    reply_to_id,
                    reply_sender_id,
                    reply_sender_username,
                    reply_content,
                    created_at
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{MESSAGE_SELECT} WHERE m.id = ?1"))?;
            let row = stmt.query_row([id], map_message_row).optional()?;
            Ok(row)
        })
    }

    /// Apply an edit. Sender match and liveness were verified by the caller;
    /// the WHERE clause re-checks both so a lost race degrades to a no-op.
    pub fn apply_edit(&self, id: i64, sender_id: &str, content: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET content = ?1, edit_count = edit_count + 1
                 WHERE id = ?2 AND sender_id = ?3 AND deleted = 0",
                rusqlite::params![content, id, sender_id],
            )?;
            Ok(n > 0)
        })
    }

    /// Soft delete: content cleared, flag set. The row survives so reply
    /// references remain resolvable.
    pub fn apply_delete(&self, id: i64, sender_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET content = '', deleted = 1
                 WHERE id = ?1 AND sender_id = ?2 AND deleted = 0",
                rusqlite::params![id, sender_id],
            )?;
            Ok(n > 0)
        })
    }

    /// History page, newest first. `before_id` is the cursor: pass the
    /// smallest id from the previous page to fetch older messages.
    pub fn get_messages(
        &self,
        chat_id: &str,
        limit: u32,
        before_id: Option<i64>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = match before_id {
                Some(_) => format!(
                    "{MESSAGE_SELECT} WHERE m.chat_id = ?1 AND m.id < ?3 ORDER BY m.id DESC LIMIT ?2"
                ),
                None => format!("{MESSAGE_SELECT} WHERE m.chat_id = ?1 ORDER BY m.id DESC LIMIT ?2"),
            };
            let mut stmt = conn.prepare(&sql)?;

            let rows = match before_id {
                Some(before) => stmt
                    .query_map(rusqlite::params![chat_id, limit, before], map_message_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?,
                None => stmt
                    .query_map(rusqlite::params![chat_id, limit], map_message_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            };

            Ok(rows)
        })
    }

    // -- Reactions --

    /// Idempotent add: the UNIQUE(message_id, user_id, emoji) constraint
    /// absorbs duplicates. Returns whether a row was actually inserted, so
    /// the caller broadcasts on state change only.
    pub fn add_reaction(
        &self,
        id: &str,
        message_id: i64,
        user_id: &str,
        emoji: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO reactions (id, message_id, user_id, emoji)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, message_id, user_id, emoji],
            )?;
            Ok(n > 0)
        })
    }

    /// Returns whether a row was actually removed.
    pub fn remove_reaction(&self, message_id: i64, user_id: &str, emoji: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                rusqlite::params![message_id, user_id, emoji],
            )?;
            Ok(n > 0)
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn get_reactions_for_messages(&self, message_ids: &[i64]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, message_id, user_id, emoji, created_at FROM reactions WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        emoji: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Read cursors --

    /// Monotonic advance: a write that would move the cursor backward
    /// matches no row and reports false.
    pub fn advance_read_cursor(&self, chat_id: &str, user_id: &str, ts: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE participants SET last_read_at = ?1
                 WHERE chat_id = ?2 AND user_id = ?3 AND left_at IS NULL
                   AND (last_read_at IS NULL OR last_read_at < ?1)",
                rusqlite::params![ts, chat_id, user_id],
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_last_read_at(&self, chat_id: &str, user_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let ts = conn
                .query_row(
                    "SELECT last_read_at FROM participants WHERE chat_id = ?1 AND user_id = ?2",
                    (chat_id, user_id),
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?;
            Ok(ts.flatten())
        })
    }

    /// Unread counts are derived, never stored: messages newer than the
    /// cursor, excluding the participant's own and soft-deleted ones.
    pub fn unread_count(&self, chat_id: &str, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE chat_id = ?1 AND sender_id != ?2 AND deleted = 0
                   AND created_at > COALESCE(
                       (SELECT last_read_at FROM participants
                        WHERE chat_id = ?1 AND user_id = ?2), '')",
                (chat_id, user_id),
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    // -- Contacts --

    pub fn add_contact(&self, user_id: &str, contact_id: &str, accepted: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contacts (user_id, contact_id, accepted) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, contact_id) DO UPDATE SET accepted = ?3",
                rusqlite::params![user_id, contact_id, accepted],
            )?;
            Ok(())
        })
    }

    /// Presence fan-out audience: accepted contacts in either direction.
    pub fn accepted_contacts(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT CASE WHEN user_id = ?1 THEN contact_id ELSE user_id END
                 FROM contacts WHERE accepted = 1 AND (user_id = ?1 OR contact_id = ?1)",
            )?;
            let rows = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(rows)
        })
    }
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.chat_id, m.sender_id, u.username,
        m.content, m.kind, m.reply_to_id, m.reply_sender_id, m.reply_sender_username,
        m.reply_content, m.edit_count, m.deleted, m.created_at
 FROM messages m
 LEFT JOIN users u ON m.sender_id = u.id";

fn map_message_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        content: row.get(4)?,
        kind: row.get(5)?,
        reply_to_id: row.get(6)?,
        reply_sender_id: row.get(7)?,
        reply_sender_username: row.get(8)?,
        reply_content: row.get(9)?,
        edit_count: row.get(10)?,
        deleted: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let mut stmt =
        conn.prepare("SELECT id, username, last_seen, created_at FROM users WHERE id = ?1")?;

    let row = stmt
        .query_row([id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                last_seen: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format_ts;
    use chrono::{Duration, Utc};

    const ALICE: &str = "00000000-0000-0000-0000-00000000000a";
    const BOB: &str = "00000000-0000-0000-0000-00000000000b";
    const CHAT: &str = "00000000-0000-0000-0000-000000000001";

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user(ALICE, "alice").unwrap();
        db.create_user(BOB, "bob").unwrap();
        db.create_chat(CHAT, "general").unwrap();
        db.add_participant(CHAT, ALICE, "member").unwrap();
        db.add_participant(CHAT, BOB, "member").unwrap();
        db
    }

    fn send(db: &Database, sender: &str, content: &str) -> i64 {
        db.insert_message(
            CHAT,
            sender,
            content,
            "text",
            None,
            None,
            None,
            None,
            &format_ts(Utc::now()),
        )
        .unwrap()
    }

    #[test]
    fn message_ids_order_by_insertion() {
        let db = test_db();
        let a = send(&db, ALICE, "first");
        let b = send(&db, BOB, "second");
        let c = send(&db, ALICE, "third");
        assert!(a < b && b < c);

        // History is newest-first; cursor pages strictly older.
        let page = db.get_messages(CHAT, 2, None).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, c);
        assert_eq!(page[1].id, b);

        let older = db.get_messages(CHAT, 50, Some(b)).unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].id, a);
    }

    #[test]
    fn duplicate_reaction_is_a_noop() {
        let db = test_db();
        let msg = send(&db, ALICE, "react to me");

        assert!(db.add_reaction("r1", msg, BOB, "👍").unwrap());
        assert!(!db.add_reaction("r2", msg, BOB, "👍").unwrap());

        let rows = db.get_reactions_for_messages(&[msg]).unwrap();
        assert_eq!(rows.len(), 1);

        assert!(db.remove_reaction(msg, BOB, "👍").unwrap());
        assert!(!db.remove_reaction(msg, BOB, "👍").unwrap());
    }

    #[test]
    fn read_cursor_never_regresses() {
        let db = test_db();
        let now = Utc::now();
        let later = format_ts(now);
        let earlier = format_ts(now - Duration::seconds(10));

        assert!(db.advance_read_cursor(CHAT, BOB, &later).unwrap());
        assert!(!db.advance_read_cursor(CHAT, BOB, &earlier).unwrap());
        assert_eq!(db.get_last_read_at(CHAT, BOB).unwrap(), Some(later));
    }

    #[test]
    fn unread_counts_exclude_own_and_deleted() {
        let db = test_db();
        let m1 = send(&db, ALICE, "one");
        send(&db, ALICE, "two");
        send(&db, BOB, "mine");

        assert_eq!(db.unread_count(CHAT, BOB).unwrap(), 2);

        assert!(db.apply_delete(m1, ALICE).unwrap());
        assert_eq!(db.unread_count(CHAT, BOB).unwrap(), 1);

        assert!(db.advance_read_cursor(CHAT, BOB, &format_ts(Utc::now())).unwrap());
        assert_eq!(db.unread_count(CHAT, BOB).unwrap(), 0);
    }

    #[test]
    fn soft_delete_keeps_reply_resolvable() {
        let db = test_db();
        let original = send(&db, ALICE, "to be deleted");
        assert!(db.apply_delete(original, ALICE).unwrap());

        let row = db.get_message(original).unwrap().unwrap();
        assert!(row.deleted);
        assert_eq!(row.content, "");

        // A reply inserted before the delete still carries its snapshot.
        let reply = db
            .insert_message(
                CHAT,
                BOB,
                "replying",
                "text",
                Some(original),
                Some(ALICE),
                Some("alice"),
                Some("to be deleted"),
                &format_ts(Utc::now()),
            )
            .unwrap();
        let reply_row = db.get_message(reply).unwrap().unwrap();
        assert_eq!(reply_row.reply_to_id, Some(original));
        assert_eq!(reply_row.reply_content.as_deref(), Some("to be deleted"));
    }

    #[test]
    fn edit_requires_sender_match_and_liveness() {
        let db = test_db();
        let msg = send(&db, ALICE, "original");

        assert!(!db.apply_edit(msg, BOB, "hijacked").unwrap());
        assert!(db.apply_edit(msg, ALICE, "fixed").unwrap());

        let row = db.get_message(msg).unwrap().unwrap();
        assert_eq!(row.content, "fixed");
        assert_eq!(row.edit_count, 1);

        assert!(db.apply_delete(msg, ALICE).unwrap());
        assert!(!db.apply_edit(msg, ALICE, "too late").unwrap());
    }

    #[test]
    fn participant_gating_tracks_left_at() {
        let db = test_db();
        assert!(db.is_active_participant(CHAT, ALICE).unwrap());

        db.mark_participant_left(CHAT, ALICE, &format_ts(Utc::now()))
            .unwrap();
        assert!(!db.is_active_participant(CHAT, ALICE).unwrap());

        // Re-adding clears left_at.
        db.add_participant(CHAT, ALICE, "member").unwrap();
        assert!(db.is_active_participant(CHAT, ALICE).unwrap());
    }

    #[test]
    fn accepted_contacts_are_symmetric() {
        let db = test_db();
        db.add_contact(ALICE, BOB, true).unwrap();

        assert_eq!(db.accepted_contacts(ALICE).unwrap(), vec![BOB.to_string()]);
        assert_eq!(db.accepted_contacts(BOB).unwrap(), vec![ALICE.to_string()]);

        db.add_contact(ALICE, BOB, false).unwrap();
        assert!(db.accepted_contacts(ALICE).unwrap().is_empty());
    }
}
