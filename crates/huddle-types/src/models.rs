use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

/// Denormalized snapshot of a chat's most recent message, kept for list previews.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestMessage {
    pub id: Uuid,
    pub sender: User,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A chat with its members, admin and latest message resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub id: Uuid,
    pub chat_name: Option<String>,
    pub is_group_chat: bool,
    pub users: Vec<User>,
    pub group_admin: Option<User>,
    pub latest_message: Option<LatestMessage>,
    /// Per-member unread counters. Keys are always a subset of `users`.
    pub unread_count: HashMap<Uuid, u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatView {
    pub fn member_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.users.iter().map(|u| u.id)
    }

    pub fn has_member(&self, user_id: Uuid) -> bool {
        self.users.iter().any(|u| u.id == user_id)
    }
}

/// A persisted message with its sender and owning chat resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: Uuid,
    pub sender: User,
    pub content: String,
    pub chat: ChatView,
    pub read_by: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// What a client hands back over the socket after persisting a message.
/// Only the id is trusted; everything else is re-read from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: Uuid,
}
