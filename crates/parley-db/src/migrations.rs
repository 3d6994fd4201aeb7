use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            last_seen   TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS chats (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS participants (
            chat_id       TEXT NOT NULL REFERENCES chats(id),
            user_id       TEXT NOT NULL REFERENCES users(id),
            role          TEXT NOT NULL DEFAULT 'member',
            last_read_at  TEXT,
            muted         INTEGER NOT NULL DEFAULT 0,
            joined_at     TEXT NOT NULL DEFAULT (datetime('now')),
            left_at       TEXT,
            PRIMARY KEY (chat_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id                       INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id                  TEXT NOT NULL REFERENCES chats(id),
            sender_id                TEXT NOT NULL REFERENCES users(id),
            content                  TEXT NOT NULL,
            kind                     TEXT NOT NULL DEFAULT 'text',
            reply_to_id              INTEGER REFERENCES messages(id),
            reply_sender_id          TEXT,
            reply_sender_username    TEXT,
            reply_content            TEXT,
            edit_count               INTEGER NOT NULL DEFAULT 0,
            deleted                  INTEGER NOT NULL DEFAULT 0,
            created_at               TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, id);

        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  INTEGER NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        CREATE TABLE IF NOT EXISTS contacts (
            user_id     TEXT NOT NULL REFERENCES users(id),
            contact_id  TEXT NOT NULL REFERENCES users(id),
            accepted    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (user_id, contact_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
