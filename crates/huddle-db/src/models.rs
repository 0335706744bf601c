//! Database row types. Distinct from the huddle-types API models to keep the
//! DB layer independent; views are assembled in `queries`.

use chrono::{DateTime, Utc};
use huddle_types::models::User;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            name: row.name,
            email: row.email,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRow {
    pub user_id: Uuid,
    pub unread_count: u32,
}

#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub id: Uuid,
    pub chat_name: Option<String>,
    pub is_group_chat: bool,
    pub group_admin: Option<Uuid>,
    pub latest_message_id: Option<Uuid>,
    pub members: Vec<MemberRow>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatRecord {
    pub fn is_member(&self, user_id: Uuid) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }

    /// Every member except the sender.
    pub fn recipients(&self, sender_id: Uuid) -> Vec<Uuid> {
        self.members
            .iter()
            .map(|m| m.user_id)
            .filter(|id| *id != sender_id)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub read_by: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

pub struct NewChat {
    pub chat_name: Option<String>,
    pub is_group_chat: bool,
    pub users: Vec<Uuid>,
    pub group_admin: Option<Uuid>,
}

impl NewChat {
    pub fn one_to_one(a: Uuid, b: Uuid) -> Self {
        Self {
            chat_name: None,
            is_group_chat: false,
            users: vec![a, b],
            group_admin: None,
        }
    }

    pub fn group(name: impl Into<String>, admin: Uuid, users: Vec<Uuid>) -> Self {
        Self {
            chat_name: Some(name.into()),
            is_group_chat: true,
            users,
            group_admin: Some(admin),
        }
    }
}

pub struct NewMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
