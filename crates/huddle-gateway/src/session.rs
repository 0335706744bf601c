use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use huddle_types::api::Claims;
use huddle_types::events::{ClientEvent, ServerEvent, TypingPayload};
use huddle_types::models::MessageRef;

use crate::Gateway;
use crate::presence::ConnId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, waiting for `setup`
    Unidentified,
    Identified { user_id: Uuid, name: String },
    /// Disconnected; every further event is ignored
    Closed,
}

/// Per-connection state machine. Events for one connection are handled one
/// at a time; different connections run concurrently.
pub struct Session {
    conn_id: ConnId,
    state: SessionState,
    gateway: Gateway,
}

impl Session {
    pub fn new(gateway: Gateway, conn_id: ConnId) -> Self {
        Self {
            conn_id,
            state: SessionState::Unidentified,
            gateway,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match &self.state {
            SessionState::Identified { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }

    /// Parse and handle one text frame. Malformed frames are dropped.
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.handle(event).await,
            Err(e) => {
                let raw: String = text.chars().take(200).collect();
                debug!("Connection {} dropped bad event: {} -- raw: {}", self.conn_id, e, raw);
            }
        }
    }

    pub async fn handle(&mut self, event: ClientEvent) {
        if self.state == SessionState::Closed {
            return;
        }

        match event {
            ClientEvent::Setup { token } => self.setup(&token).await,
            ClientEvent::JoinChat(chat_id) => self.join_chat(chat_id).await,
            ClientEvent::LeaveChat(chat_id) => {
                self.gateway.presence.leave_room(chat_id, self.conn_id);
                debug!("Connection {} left chat room {}", self.conn_id, chat_id);
            }
            ClientEvent::Typing(payload) => self.relay_typing(payload, false),
            ClientEvent::StopTyping(payload) => self.relay_typing(payload, true),
            ClientEvent::NewMessage(message) => self.new_message(message).await,
        }
    }

    /// Disconnect: drop every room and the personal channel. Terminal.
    pub fn close(&mut self) {
        self.gateway.presence.unregister(self.conn_id);
        if let SessionState::Identified { name, .. } = &self.state {
            debug!("{} left, connection {} unregistered", name, self.conn_id);
        }
        self.state = SessionState::Closed;
    }

    async fn setup(&mut self, token: &str) {
        let claims = match verify_token(&self.gateway.config.jwt_secret, token) {
            Some(claims) => claims,
            None => {
                warn!("Connection {} sent setup with an invalid token", self.conn_id);
                return;
            }
        };

        let user_id = claims.sub;
        let user = match self.gateway.db.run(move |db| db.get_user(user_id)).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!("Connection {} sent a token for unknown user {}", self.conn_id, user_id);
                return;
            }
            Err(e) => {
                error!("Connection {} setup lookup failed: {:#}", self.conn_id, e);
                return;
            }
        };

        // Re-registering as someone else drops the old identity's rooms
        if !self.gateway.presence.register(user.id, self.conn_id) {
            return;
        }

        info!("{} ({}) joined personal channel on {}", user.name, user.id, self.conn_id);
        self.state = SessionState::Identified {
            user_id: user.id,
            name: user.name,
        };
        self.gateway.presence.send(self.conn_id, ServerEvent::Connected);
    }

    async fn join_chat(&mut self, chat_id: Uuid) {
        let Some(user_id) = self.user_id() else {
            warn!("Connection {} tried to join chat {} before setup", self.conn_id, chat_id);
            return;
        };

        let chat = match self.gateway.db.run(move |db| db.find_chat(chat_id)).await {
            Ok(chat) => chat,
            Err(e) => {
                error!("Connection {} join chat {} lookup failed: {:#}", self.conn_id, chat_id, e);
                return;
            }
        };

        match chat {
            None => debug!("Connection {} asked for unknown chat room {}", self.conn_id, chat_id),
            Some(chat) if !chat.is_member(user_id) => {
                warn!("User {} is not a member of chat {}, not joining", user_id, chat_id);
            }
            Some(_) => {
                self.gateway.presence.join_room(chat_id, self.conn_id);
                debug!("Connection {} joined chat room {}", self.conn_id, chat_id);
            }
        }
    }

    /// Relay verbatim to everyone else in the room. No persistence, no retry.
    /// Only a connection that joined the room may type into it.
    fn relay_typing(&self, payload: TypingPayload, stop: bool) {
        let SessionState::Identified { user_id, name } = &self.state else {
            return;
        };
        if payload.user_id != *user_id {
            debug!(
                "Connection {} typing payload names user {}, dropping",
                self.conn_id, payload.user_id
            );
            return;
        }

        let room = self.gateway.presence.handles_for_room(payload.chat_id);
        if !room.contains(&self.conn_id) {
            debug!("{} is not in chat room {}, dropping typing", name, payload.chat_id);
            return;
        }
        for conn in room.into_iter().filter(|c| *c != self.conn_id) {
            let event = if stop {
                ServerEvent::StopTyping(payload.clone())
            } else {
                ServerEvent::Typing(payload.clone())
            };
            self.gateway.presence.send(conn, event);
        }
    }

    async fn new_message(&self, message: MessageRef) {
        let Some(user_id) = self.user_id() else {
            warn!("Connection {} sent a message before setup", self.conn_id);
            return;
        };

        if self.gateway.config.server_push {
            debug!("Message {} was pushed on create, skipping socket fan-out", message.id);
            return;
        }

        if let Err(e) = self
            .gateway
            .delivery
            .fan_out(message.id, user_id, Some(self.conn_id))
            .await
        {
            warn!("Connection {} fan-out of {} failed: {}", self.conn_id, message.id, e);
            self.gateway.presence.send(
                self.conn_id,
                ServerEvent::Error {
                    message: "Error processing message".to_string(),
                },
            );
        }
    }
}

fn verify_token(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

/// Drive one WebSocket until it closes. The outbound queue and heartbeat run
/// in their own task; inbound events are handled here in order.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut outbound) = gateway.presence.connect();
    info!("Connection {} opened", conn_id);

    let ping_interval = gateway.config.ping_interval;
    let max_missed = missed_pongs_allowed(ping_interval, gateway.config.ping_timeout);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(ping_interval);
        heartbeat.tick().await;
        let mut missed: u32 = 0;

        loop {
            tokio::select! {
                event = outbound.recv() => {
                    // Queue closes when the connection is unregistered
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {} for {}: {}", event.name(), conn_id, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed = 0;
                    } else {
                        missed += 1;
                        if missed >= max_missed {
                            warn!("Connection {} missed {} pongs, dropping", conn_id, missed);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut session = Session::new(gateway, conn_id);

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                    Some(Ok(Message::Pong(_))) => pong_received.store(true, Ordering::Release),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    send_task.abort();
    session.close();
    info!("Connection {} closed", conn_id);
}

/// How many heartbeats may pass without a pong before the timeout is hit.
fn missed_pongs_allowed(interval: Duration, timeout: Duration) -> u32 {
    let interval = interval.as_secs_f64();
    let timeout = timeout.as_secs_f64();
    if interval <= 0.0 {
        return 1;
    }
    ((timeout / interval).ceil() as u32).max(1)
}
