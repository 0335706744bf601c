use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageRef, MessageView};

/// Typing indicator payload. Relayed to the room exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
}

/// Events sent FROM client TO server over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Handshake carrying the caller's bearer token
    #[serde(rename = "setup")]
    Setup { token: String },

    #[serde(rename = "join chat")]
    JoinChat(Uuid),

    #[serde(rename = "leave chat")]
    LeaveChat(Uuid),

    #[serde(rename = "typing")]
    Typing(TypingPayload),

    #[serde(rename = "stop typing")]
    StopTyping(TypingPayload),

    /// A message that was already persisted over HTTP and now needs fan-out
    #[serde(rename = "new message")]
    NewMessage(MessageRef),
}

/// Events sent FROM server TO client over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Handshake accepted
    #[serde(rename = "connected")]
    Connected,

    #[serde(rename = "typing")]
    Typing(TypingPayload),

    #[serde(rename = "stop typing")]
    StopTyping(TypingPayload),

    #[serde(rename = "message received")]
    MessageReceived(MessageView),

    /// Sent only to the connection whose action failed
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop typing",
            Self::MessageReceived(_) => "message received",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_client_events() {
        let chat_id = Uuid::new_v4();
        let raw = format!(r#"{{"event":"join chat","data":"{}"}}"#, chat_id);
        match serde_json::from_str::<ClientEvent>(&raw).unwrap() {
            ClientEvent::JoinChat(id) => assert_eq!(id, chat_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn typing_requires_all_fields() {
        let raw = format!(
            r#"{{"event":"typing","data":{{"chatId":"{}","userId":"{}"}}}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        assert!(serde_json::from_str::<ClientEvent>(&raw).is_err());
    }

    #[test]
    fn setup_without_token_is_rejected() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"setup","data":{}}"#).is_err());
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"setup"}"#).is_err());
    }

    #[test]
    fn new_message_ignores_extra_fields() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"event":"new message","data":{{"id":"{}","content":"hi","chat":{{}}}}}}"#,
            id
        );
        match serde_json::from_str::<ClientEvent>(&raw).unwrap() {
            ClientEvent::NewMessage(m) => assert_eq!(m.id, id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn connected_has_no_payload() {
        let json = serde_json::to_value(ServerEvent::Connected).unwrap();
        assert_eq!(json, serde_json::json!({ "event": "connected" }));
    }
}
