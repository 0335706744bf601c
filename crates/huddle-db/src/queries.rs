use std::collections::{HashMap, HashSet};

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use huddle_types::models::{ChatView, LatestMessage, MessageView, User};

use crate::Database;
use crate::models::{ChatRecord, MemberRow, MessageRow, NewChat, NewMessage, UserRow};

impl Database {
    // -- Users --

    pub fn create_user(&self, name: &str, email: &str) -> Result<UserRow> {
        let row = UserRow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            created_at: Utc::now(),
        };

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, email, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    row.id.to_string(),
                    row.name,
                    row.email,
                    encode_time(&row.created_at)
                ],
            )?;
            Ok(())
        })?;

        Ok(row)
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, id))
    }

    // -- Chats --

    /// Chat CRUD belongs to another service; this exists to seed chats.
    pub fn create_chat(&self, chat: &NewChat) -> Result<ChatRecord> {
        validate_new_chat(chat)?;

        let id = Uuid::new_v4();
        let now = encode_time(&Utc::now());

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chats (id, chat_name, is_group_chat, group_admin, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    id.to_string(),
                    chat.chat_name,
                    chat.is_group_chat,
                    chat.group_admin.map(|a| a.to_string()),
                    now
                ],
            )?;
            for user_id in &chat.users {
                tx.execute(
                    "INSERT INTO chat_members (chat_id, user_id) VALUES (?1, ?2)",
                    params![id.to_string(), user_id.to_string()],
                )?;
            }
            let record = query_chat(&tx, id)?;
            tx.commit()?;
            record.ok_or_else(|| anyhow!("Chat {} vanished during creation", id))
        })
    }

    pub fn find_chat(&self, chat_id: Uuid) -> Result<Option<ChatRecord>> {
        self.with_conn(|conn| query_chat(conn, chat_id))
    }

    /// Point the chat at `message_id` and bump `updated_at`, in one statement.
    /// A message older than the current latest leaves the chat untouched; on an
    /// equal timestamp the later insert wins, matching `find_messages` order.
    /// Returns `None` when the chat does not exist.
    pub fn update_chat_latest(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<Option<ChatRecord>> {
        let at = encode_time(&created_at);
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE chats
                 SET latest_message_id = ?2, latest_message_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND (
                     latest_message_at IS NULL
                     OR latest_message_at < ?3
                     OR (latest_message_at = ?3
                         AND COALESCE((SELECT rowid FROM messages WHERE id = chats.latest_message_id), -1)
                             <= COALESCE((SELECT rowid FROM messages WHERE id = ?2), -1))
                 )",
                params![chat_id.to_string(), message_id.to_string(), at],
            )?;
            query_chat(conn, chat_id)
        })
    }

    pub fn chat_view(&self, chat_id: Uuid) -> Result<Option<ChatView>> {
        self.with_conn(|conn| query_chat_view(conn, chat_id))
    }

    /// Every chat the user belongs to, most recently active first.
    pub fn chats_for_user(&self, user_id: Uuid) -> Result<Vec<ChatView>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM chats c
                 JOIN chat_members m ON m.chat_id = c.id
                 WHERE m.user_id = ?1
                 ORDER BY c.updated_at DESC",
            )?;
            let ids = stmt
                .query_map([user_id.to_string()], |row| uuid_at(row, 0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut chats = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(view) = query_chat_view(conn, id)? {
                    chats.push(view);
                }
            }
            Ok(chats)
        })
    }

    // -- Messages --

    pub fn create_message(&self, sender_id: Uuid, chat_id: Uuid, content: &str) -> Result<MessageRow> {
        self.insert_message(&NewMessage {
            id: Uuid::new_v4(),
            chat_id,
            sender_id,
            content: content.to_string(),
            created_at: Utc::now(),
        })
    }

    /// Append a message with a caller-chosen id and timestamp.
    pub fn insert_message(&self, msg: &NewMessage) -> Result<MessageRow> {
        if msg.content.trim().is_empty() {
            bail!("Message content is empty");
        }

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, chat_id, sender_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    msg.id.to_string(),
                    msg.chat_id.to_string(),
                    msg.sender_id.to_string(),
                    msg.content,
                    encode_time(&msg.created_at)
                ],
            )?;
            Ok(())
        })?;

        Ok(MessageRow {
            id: msg.id,
            chat_id: msg.chat_id,
            sender_id: msg.sender_id,
            content: msg.content.clone(),
            read_by: vec![],
            created_at: msg.created_at,
        })
    }

    pub fn find_message(&self, message_id: Uuid) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, message_id))
    }

    /// All messages of a chat, oldest first. Ties keep insertion order.
    pub fn find_messages(&self, chat_id: Uuid) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, chat_id))
    }

    pub fn message_view(&self, message_id: Uuid) -> Result<Option<MessageView>> {
        self.with_conn(|conn| {
            let Some(msg) = query_message(conn, message_id)? else {
                return Ok(None);
            };
            let Some(chat) = query_chat_view(conn, msg.chat_id)? else {
                return Ok(None);
            };
            let sender = resolve_sender(conn, &chat, msg.sender_id)?;
            Ok(Some(into_view(msg, sender, chat)))
        })
    }

    /// Full history of a chat with senders and the chat snapshot resolved.
    pub fn message_views(&self, chat_id: Uuid) -> Result<Vec<MessageView>> {
        self.with_conn(|conn| {
            let Some(chat) = query_chat_view(conn, chat_id)? else {
                return Ok(vec![]);
            };

            let rows = query_messages(conn, chat_id)?;
            let mut senders: HashMap<Uuid, User> = HashMap::new();
            let mut views = Vec::with_capacity(rows.len());
            for row in rows {
                let sender = match senders.get(&row.sender_id) {
                    Some(user) => user.clone(),
                    None => {
                        let user = resolve_sender(conn, &chat, row.sender_id)?;
                        senders.insert(row.sender_id, user.clone());
                        user
                    }
                };
                views.push(into_view(row, sender, chat.clone()));
            }
            Ok(views)
        })
    }

    /// Add `user_id` to `readBy` of every message in the chat it did not send.
    /// Returns how many messages gained the user. Never removes anyone.
    pub fn mark_read(&self, chat_id: Uuid, user_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id)
                 SELECT id, ?2 FROM messages WHERE chat_id = ?1 AND sender_id != ?2",
                params![chat_id.to_string(), user_id.to_string()],
            )?;
            Ok(updated)
        })
    }
}

fn validate_new_chat(chat: &NewChat) -> Result<()> {
    let mut seen = HashSet::new();
    if !chat.users.iter().all(|u| seen.insert(*u)) {
        bail!("Duplicate chat member");
    }
    if chat.users.len() < 2 {
        bail!("A chat needs at least two members");
    }
    if chat.is_group_chat {
        if let Some(admin) = chat.group_admin {
            if !chat.users.contains(&admin) {
                bail!("Group admin {} is not a member", admin);
            }
        }
    } else {
        if chat.users.len() != 2 {
            bail!("A one-to-one chat has exactly two members");
        }
        if chat.group_admin.is_some() {
            bail!("A one-to-one chat has no admin");
        }
    }
    Ok(())
}

pub(crate) fn encode_time(t: &DateTime<Utc>) -> String {
    // Fixed width, so text order is time order
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        Uuid::parse_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn time_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn user_at(row: &Row, offset: usize) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_at(row, offset)?,
        name: row.get(offset + 1)?,
        email: row.get(offset + 2)?,
    })
}

fn query_user(conn: &Connection, id: Uuid) -> Result<Option<UserRow>> {
    let row = conn
        .query_row(
            "SELECT id, name, email, created_at FROM users WHERE id = ?1",
            [id.to_string()],
            |row| {
                Ok(UserRow {
                    id: uuid_at(row, 0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    created_at: time_at(row, 3)?,
                })
            },
        )
        .optional()?;

    Ok(row)
}

fn query_chat(conn: &Connection, chat_id: Uuid) -> Result<Option<ChatRecord>> {
    let chat = conn
        .query_row(
            "SELECT id, chat_name, is_group_chat, group_admin, latest_message_id, created_at, updated_at
             FROM chats WHERE id = ?1",
            [chat_id.to_string()],
            |row| {
                Ok(ChatRecord {
                    id: uuid_at(row, 0)?,
                    chat_name: row.get(1)?,
                    is_group_chat: row.get(2)?,
                    group_admin: opt_uuid_at(row, 3)?,
                    latest_message_id: opt_uuid_at(row, 4)?,
                    members: vec![],
                    created_at: time_at(row, 5)?,
                    updated_at: time_at(row, 6)?,
                })
            },
        )
        .optional()?;

    let Some(mut chat) = chat else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT user_id, unread_count FROM chat_members WHERE chat_id = ?1 ORDER BY rowid",
    )?;
    chat.members = stmt
        .query_map([chat_id.to_string()], |row| {
            Ok(MemberRow {
                user_id: uuid_at(row, 0)?,
                unread_count: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(chat))
}

/// Assemble the denormalized chat: members, admin, latest message with sender.
fn query_chat_view(conn: &Connection, chat_id: Uuid) -> Result<Option<ChatView>> {
    let Some(chat) = query_chat(conn, chat_id)? else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT u.id, u.name, u.email FROM chat_members m
         JOIN users u ON u.id = m.user_id
         WHERE m.chat_id = ?1
         ORDER BY m.rowid",
    )?;
    let users = stmt
        .query_map([chat_id.to_string()], |row| user_at(row, 0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let group_admin = match chat.group_admin {
        Some(admin) => query_user(conn, admin)?.map(User::from),
        None => None,
    };

    let latest_message = match chat.latest_message_id {
        Some(message_id) => conn
            .query_row(
                "SELECT m.id, m.content, m.created_at, u.id, u.name, u.email
                 FROM messages m
                 JOIN users u ON u.id = m.sender_id
                 WHERE m.id = ?1",
                [message_id.to_string()],
                |row| {
                    Ok(LatestMessage {
                        id: uuid_at(row, 0)?,
                        content: row.get(1)?,
                        created_at: time_at(row, 2)?,
                        sender: user_at(row, 3)?,
                    })
                },
            )
            .optional()?,
        None => None,
    };

    Ok(Some(ChatView {
        id: chat.id,
        chat_name: chat.chat_name,
        is_group_chat: chat.is_group_chat,
        users,
        group_admin,
        latest_message,
        unread_count: chat
            .members
            .iter()
            .map(|m| (m.user_id, m.unread_count))
            .collect(),
        created_at: chat.created_at,
        updated_at: chat.updated_at,
    }))
}

fn message_at(row: &Row) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: uuid_at(row, 0)?,
        chat_id: uuid_at(row, 1)?,
        sender_id: uuid_at(row, 2)?,
        content: row.get(3)?,
        read_by: vec![],
        created_at: time_at(row, 4)?,
    })
}

fn query_message(conn: &Connection, message_id: Uuid) -> Result<Option<MessageRow>> {
    let msg = conn
        .query_row(
            "SELECT id, chat_id, sender_id, content, created_at FROM messages WHERE id = ?1",
            [message_id.to_string()],
            message_at,
        )
        .optional()?;

    let Some(mut msg) = msg else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT user_id FROM message_reads WHERE message_id = ?1 ORDER BY rowid")?;
    msg.read_by = stmt
        .query_map([message_id.to_string()], |row| uuid_at(row, 0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(msg))
}

fn query_messages(conn: &Connection, chat_id: Uuid) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, chat_id, sender_id, content, created_at
         FROM messages
         WHERE chat_id = ?1
         ORDER BY created_at ASC, rowid ASC",
    )?;
    let mut rows = stmt
        .query_map([chat_id.to_string()], message_at)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // One pass over the read receipts instead of one query per message
    let mut stmt = conn.prepare(
        "SELECT r.message_id, r.user_id FROM message_reads r
         JOIN messages m ON m.id = r.message_id
         WHERE m.chat_id = ?1
         ORDER BY r.rowid",
    )?;
    let mut reads: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let pairs = stmt
        .query_map([chat_id.to_string()], |row| Ok((uuid_at(row, 0)?, uuid_at(row, 1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (message_id, user_id) in pairs {
        reads.entry(message_id).or_default().push(user_id);
    }

    for row in &mut rows {
        if let Some(read_by) = reads.remove(&row.id) {
            row.read_by = read_by;
        }
    }

    Ok(rows)
}

/// Members are already loaded on the chat; anyone else is looked up.
fn resolve_sender(conn: &Connection, chat: &ChatView, sender_id: Uuid) -> Result<User> {
    if let Some(user) = chat.users.iter().find(|u| u.id == sender_id) {
        return Ok(user.clone());
    }
    Ok(query_user(conn, sender_id)?
        .map(User::from)
        .unwrap_or_else(|| User {
            id: sender_id,
            name: "unknown".to_string(),
            email: String::new(),
        }))
}

fn into_view(row: MessageRow, sender: User, chat: ChatView) -> MessageView {
    MessageView {
        id: row.id,
        sender,
        content: row.content,
        chat,
        read_by: row.read_by,
        created_at: row.created_at,
    }
}
