pub mod chats;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod state;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post, put},
};

pub use crate::error::ApiError;
pub use crate::state::{AppState, AppStateInner};

/// Every `/api` route. All of them require a bearer token.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/message", post(messages::send_message))
        .route("/api/message/{chat_id}", get(messages::all_messages))
        .route("/api/message/mark-read/{chat_id}", put(messages::mark_read))
        .route("/api/chat", get(chats::fetch_chats))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ))
        .with_state(state)
}
