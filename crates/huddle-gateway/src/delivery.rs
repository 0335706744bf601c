use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use huddle_db::Database;
use huddle_db::models::MessageRow;
use huddle_types::events::ServerEvent;
use huddle_types::models::MessageView;

use crate::presence::{ConnId, PresenceRegistry};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("chat {0} not found")]
    ChatNotFound(Uuid),

    #[error("message {0} not found")]
    MessageNotFound(Uuid),

    #[error("user {user_id} did not send message {message_id}")]
    NotSender { message_id: Uuid, user_id: Uuid },

    #[error("store failure: {0}")]
    Store(#[from] anyhow::Error),
}

/// Outcome of a completed delivery.
#[derive(Debug)]
pub struct Delivery {
    pub message: MessageView,
    /// Number of connections the message was queued on
    pub pushed: usize,
}

/// Commits a persisted message to its chat and fans it out to live sessions.
#[derive(Clone)]
pub struct DeliveryCoordinator {
    db: Arc<Database>,
    presence: PresenceRegistry,
}

impl DeliveryCoordinator {
    pub fn new(db: Arc<Database>, presence: PresenceRegistry) -> Self {
        Self { db, presence }
    }

    /// Commit and push in one go.
    pub async fn deliver(
        &self,
        message: &MessageRow,
        origin: Option<ConnId>,
    ) -> Result<Delivery, DeliveryError> {
        let view = self.commit(message).await?;
        let skip: HashSet<ConnId> = origin.into_iter().collect();
        let pushed = self.push(&view, &skip);
        Ok(Delivery {
            message: view,
            pushed,
        })
    }

    /// Commit and push for a message created outside any socket. The sender
    /// already holds the created message, so none of their connections get a
    /// copy; every other member is reached as usual.
    pub async fn deliver_on_create(&self, message: &MessageRow) -> Result<Delivery, DeliveryError> {
        let view = self.commit(message).await?;
        let skip = self.presence.handles_for_user(message.sender_id);
        let pushed = self.push(&view, &skip);
        Ok(Delivery {
            message: view,
            pushed,
        })
    }

    /// Make the message the chat's latest and bump every recipient's unread
    /// counter. Nothing is touched past the first step if the chat is gone.
    /// Returns the message with the updated chat snapshot.
    pub async fn commit(&self, message: &MessageRow) -> Result<MessageView, DeliveryError> {
        let (message_id, chat_id, sender_id, created_at) =
            (message.id, message.chat_id, message.sender_id, message.created_at);

        let outcome = self
            .db
            .run(move |db| {
                let Some(chat) = db.update_chat_latest(chat_id, message_id, created_at)? else {
                    return Ok(Err(DeliveryError::ChatNotFound(chat_id)));
                };

                let recipients = chat.recipients(sender_id);
                let bumped = db.increment_unread(chat_id, &recipients)?;
                debug!("Message {} bumped {} unread counters in chat {}", message_id, bumped, chat_id);

                Ok(db
                    .message_view(message_id)?
                    .ok_or(DeliveryError::MessageNotFound(message_id)))
            })
            .await?;

        if outcome.is_ok() {
            info!("Message {} committed to chat {}", message_id, chat_id);
        }
        outcome
    }

    /// Push an already committed message to live sessions. The chat is
    /// re-read so recipients see the current snapshot; if it is gone, nothing
    /// is sent.
    pub async fn fan_out(
        &self,
        message_id: Uuid,
        sender_id: Uuid,
        origin: Option<ConnId>,
    ) -> Result<Delivery, DeliveryError> {
        let view = self
            .db
            .run(move |db| {
                let Some(msg) = db.find_message(message_id)? else {
                    return Ok(Err(DeliveryError::MessageNotFound(message_id)));
                };
                if msg.sender_id != sender_id {
                    return Ok(Err(DeliveryError::NotSender {
                        message_id,
                        user_id: sender_id,
                    }));
                }
                Ok(db
                    .message_view(message_id)?
                    .ok_or(DeliveryError::ChatNotFound(msg.chat_id)))
            })
            .await??;

        let skip: HashSet<ConnId> = origin.into_iter().collect();
        let pushed = self.push(&view, &skip);
        Ok(Delivery {
            message: view,
            pushed,
        })
    }

    /// One copy per connection: the room broadcast for connections in the
    /// chat room, the personal channel for recipients' other connections.
    /// Connections in `skip` never get the message.
    fn push(&self, view: &MessageView, skip: &HashSet<ConnId>) -> usize {
        let chat_id = view.chat.id;
        let sender_id = view.sender.id;

        let room = self.presence.handles_for_room(chat_id);

        // Room broadcast, minus anyone who has since left the chat
        let mut targets: HashSet<ConnId> = room
            .iter()
            .copied()
            .filter(|conn| {
                self.presence
                    .user_of(*conn)
                    .is_some_and(|user| view.chat.has_member(user))
            })
            .collect();

        // Personal channel for recipients not already reached through the room
        for recipient in view.chat.member_ids().filter(|id| *id != sender_id) {
            for conn in self.presence.handles_for_user(recipient) {
                if !room.contains(&conn) {
                    targets.insert(conn);
                }
            }
        }

        targets.retain(|conn| !skip.contains(conn));

        let mut pushed = 0;
        for conn in targets {
            if self
                .presence
                .send(conn, ServerEvent::MessageReceived(view.clone()))
            {
                pushed += 1;
            } else {
                debug!("Connection {} went away before message {}", conn, view.id);
            }
        }

        info!(
            "Message {} fanned out to {} connections in chat {}",
            view.id, pushed, chat_id
        );
        pushed
    }
}
