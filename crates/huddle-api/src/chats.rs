use axum::{Extension, Json, extract::State};

use huddle_types::api::Claims;
use huddle_types::models::ChatView;

use crate::error::ApiError;
use crate::state::AppState;

/// The caller's chats with latest message and unread counts, most recently
/// active first.
pub async fn fetch_chats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ChatView>>, ApiError> {
    let user_id = claims.sub;
    let chats = state.db.run(move |db| db.chats_for_user(user_id)).await?;
    Ok(Json(chats))
}
