//! Per-(chat, user) unread counters.
//!
//! Counters live on the `chat_members` row, so only members can have one.
//! Increments are `count = count + 1` in SQL rather than a read-then-write of a
//! cached value, which keeps concurrent senders from losing updates.

use anyhow::Result;
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use crate::Database;

impl Database {
    /// Add one to each user's counter in the chat. Non-members are skipped.
    /// Returns how many counters moved.
    pub fn increment_unread(&self, chat_id: Uuid, user_ids: &[Uuid]) -> Result<usize> {
        if user_ids.is_empty() {
            return Ok(0);
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut changed = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE chat_members SET unread_count = unread_count + 1
                     WHERE chat_id = ?1 AND user_id = ?2",
                )?;
                for user_id in user_ids {
                    changed += stmt.execute(params![chat_id.to_string(), user_id.to_string()])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        })
    }

    /// Set the counter to zero. Returns false if the user is not a member.
    pub fn reset_unread(&self, chat_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE chat_members SET unread_count = 0 WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id.to_string(), user_id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn unread_count(&self, chat_id: Uuid, user_id: Uuid) -> Result<Option<u32>> {
        self.with_conn(|conn| {
            let count = conn
                .query_row(
                    "SELECT unread_count FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
                    params![chat_id.to_string(), user_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count)
        })
    }
}
