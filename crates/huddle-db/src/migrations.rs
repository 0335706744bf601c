use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            email       TEXT NOT NULL UNIQUE,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chats (
            id                  TEXT PRIMARY KEY,
            chat_name           TEXT,
            is_group_chat       INTEGER NOT NULL DEFAULT 0,
            group_admin         TEXT REFERENCES users(id),
            -- weak pointer, no FK: the message may be gone
            latest_message_id   TEXT,
            latest_message_at   TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chat_members (
            chat_id         TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            user_id         TEXT NOT NULL REFERENCES users(id),
            unread_count    INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
            PRIMARY KEY (chat_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_chat_members_user
            ON chat_members(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            chat_id     TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            sender_id   TEXT NOT NULL REFERENCES users(id),
            content     TEXT NOT NULL CHECK (length(content) > 0),
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, created_at);

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (message_id, user_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
