use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_db::Database;
use huddle_db::models::{ChatRecord, MessageRow};
use huddle_types::api::{Claims, MarkReadResponse, SendMessageRequest};
use huddle_types::models::MessageView;

use crate::error::ApiError;
use crate::state::AppState;

/// Persist a message and commit it to its chat. Live fan-out follows through
/// the sender's socket `new message`, or right here when server push is on.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<MessageView>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let (content, chat_id) = match (req.content, req.chat_id) {
        (Some(content), Some(chat_id)) if !content.trim().is_empty() => (content, chat_id),
        _ => {
            warn!("User {} sent a message without content or chatId", claims.sub);
            return Err(ApiError::BadRequest("Invalid data passed into request".into()));
        }
    };

    let sender_id = claims.sub;
    let row = state
        .db
        .run(move |db| Ok(create_in_chat(db, sender_id, chat_id, &content)))
        .await??;

    let view = if state.server_push {
        state.delivery.deliver_on_create(&row).await?.message
    } else {
        state.delivery.commit(&row).await?
    };

    info!("{} sent message {} to chat {}", claims.name, view.id, chat_id);
    Ok(Json(view))
}

/// Full history, oldest first. Fetching counts as reading: the caller's
/// unread counter goes back to zero.
pub async fn all_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<MessageView>>, ApiError> {
    let user_id = claims.sub;
    let messages = state
        .db
        .run(move |db| Ok(history(db, chat_id, user_id)))
        .await??;

    debug!("Served {} messages of chat {} to {}", messages.len(), chat_id, user_id);
    Ok(Json(messages))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let user_id = claims.sub;
    let updated = state
        .db
        .run(move |db| Ok(read_all(db, chat_id, user_id)))
        .await??;

    debug!("User {} read {} messages in chat {}", user_id, updated, chat_id);
    Ok(Json(MarkReadResponse {
        message: "Messages marked as read".into(),
        updated,
    }))
}

fn require_member(db: &Database, chat_id: Uuid, user_id: Uuid) -> Result<ChatRecord, ApiError> {
    let chat = db
        .find_chat(chat_id)?
        .ok_or_else(|| ApiError::NotFound("Chat not found".into()))?;
    if !chat.is_member(user_id) {
        return Err(ApiError::Forbidden("Not a member of this chat".into()));
    }
    Ok(chat)
}

fn create_in_chat(
    db: &Database,
    sender_id: Uuid,
    chat_id: Uuid,
    content: &str,
) -> Result<MessageRow, ApiError> {
    require_member(db, chat_id, sender_id)?;
    Ok(db.create_message(sender_id, chat_id, content)?)
}

fn history(db: &Database, chat_id: Uuid, user_id: Uuid) -> Result<Vec<MessageView>, ApiError> {
    require_member(db, chat_id, user_id)?;
    let views = db.message_views(chat_id)?;
    db.reset_unread(chat_id, user_id)?;
    Ok(views)
}

fn read_all(db: &Database, chat_id: Uuid, user_id: Uuid) -> Result<usize, ApiError> {
    require_member(db, chat_id, user_id)?;
    let updated = db.mark_read(chat_id, user_id)?;
    db.reset_unread(chat_id, user_id)?;
    Ok(updated)
}
