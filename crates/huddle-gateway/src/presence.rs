use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use huddle_types::events::ServerEvent;

/// Opaque handle for one live socket connection.
pub type ConnId = Uuid;

/// Live state of one connection: where to push, who it is, which rooms it sits in.
struct Connection {
    tx: mpsc::UnboundedSender<ServerEvent>,
    user_id: Option<Uuid>,
    rooms: HashSet<Uuid>,
}

/// Tracks which connections belong to which user and which chat rooms.
///
/// All maps are sharded, so unrelated users and rooms never contend on one lock.
/// No method holds a guard on one map while touching another.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    /// conn_id -> connection state
    connections: DashMap<ConnId, Connection>,

    /// user_id -> every live connection of that user (personal channel)
    users: DashMap<Uuid, HashSet<ConnId>>,

    /// chat_id -> every connection currently in that room
    rooms: DashMap<Uuid, HashSet<ConnId>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle and its outbound queue for a new connection.
    pub fn connect(&self) -> (ConnId, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.connections.insert(
            conn_id,
            Connection {
                tx,
                user_id: None,
                rooms: HashSet::new(),
            },
        );
        (conn_id, rx)
    }

    /// Tie a connection to a user. Registering again overwrites the identity;
    /// a change of user also drops every room joined under the old one.
    /// Returns false if the connection is already gone.
    pub fn register(&self, user_id: Uuid, conn_id: ConnId) -> bool {
        let (previous, dropped_rooms) = match self.inner.connections.get_mut(&conn_id) {
            Some(mut conn) => {
                let previous = conn.user_id.replace(user_id);
                let rooms = match previous {
                    Some(prev) if prev != user_id => std::mem::take(&mut conn.rooms),
                    _ => HashSet::new(),
                };
                (previous, rooms)
            }
            None => {
                debug!("register on unknown connection {}", conn_id);
                return false;
            }
        };

        if let Some(prev) = previous.filter(|p| *p != user_id) {
            remove_from(&self.inner.users, prev, conn_id);
            for chat_id in dropped_rooms {
                remove_from(&self.inner.rooms, chat_id, conn_id);
            }
        }

        self.inner.users.entry(user_id).or_default().insert(conn_id);
        true
    }

    /// Put a connection into a chat room. Joining twice is a no-op.
    pub fn join_room(&self, chat_id: Uuid, conn_id: ConnId) -> bool {
        match self.inner.connections.get_mut(&conn_id) {
            Some(mut conn) => {
                conn.rooms.insert(chat_id);
            }
            None => return false,
        }

        self.inner.rooms.entry(chat_id).or_default().insert(conn_id);
        true
    }

    /// Take a connection out of a chat room. Valid even if it never joined.
    pub fn leave_room(&self, chat_id: Uuid, conn_id: ConnId) {
        if let Some(mut conn) = self.inner.connections.get_mut(&conn_id) {
            conn.rooms.remove(&chat_id);
        }
        remove_from(&self.inner.rooms, chat_id, conn_id);
    }

    pub fn handles_for_user(&self, user_id: Uuid) -> HashSet<ConnId> {
        self.inner
            .users
            .get(&user_id)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    pub fn handles_for_room(&self, chat_id: Uuid) -> HashSet<ConnId> {
        self.inner
            .rooms
            .get(&chat_id)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    pub fn user_of(&self, conn_id: ConnId) -> Option<Uuid> {
        self.inner.connections.get(&conn_id).and_then(|c| c.user_id)
    }

    pub fn rooms_of(&self, conn_id: ConnId) -> HashSet<Uuid> {
        self.inner
            .connections
            .get(&conn_id)
            .map(|c| c.rooms.clone())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.inner
            .users
            .get(&user_id)
            .is_some_and(|set| !set.is_empty())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Forget a connection everywhere and close its outbound queue.
    /// Safe to call more than once, and before registration ever happened.
    pub fn unregister(&self, conn_id: ConnId) {
        let Some((_, conn)) = self.inner.connections.remove(&conn_id) else {
            return;
        };

        if let Some(user_id) = conn.user_id {
            remove_from(&self.inner.users, user_id, conn_id);
        }
        for chat_id in conn.rooms {
            remove_from(&self.inner.rooms, chat_id, conn_id);
        }
    }

    /// Queue an event for one connection. False if it is gone.
    pub fn send(&self, conn_id: ConnId, event: ServerEvent) -> bool {
        match self.inner.connections.get(&conn_id) {
            Some(conn) => conn.tx.send(event).is_ok(),
            None => false,
        }
    }
}

/// Drop `conn_id` from the set under `key`, removing the set once empty.
fn remove_from(map: &DashMap<Uuid, HashSet<ConnId>>, key: Uuid, conn_id: ConnId) {
    if let Some(mut set) = map.get_mut(&key) {
        set.remove(&conn_id);
    }
    map.remove_if(&key, |_, set| set.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_can_have_several_connections() {
        let registry = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let (phone, _rx1) = registry.connect();
        let (laptop, _rx2) = registry.connect();

        assert!(registry.register(user, phone));
        assert!(registry.register(user, laptop));
        assert!(registry.register(user, laptop));

        let handles = registry.handles_for_user(user);
        assert_eq!(handles, HashSet::from([phone, laptop]));
        assert!(registry.is_online(user));
    }

    #[test]
    fn re_register_moves_connection_to_new_user() {
        let registry = PresenceRegistry::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (conn, _rx) = registry.connect();

        registry.register(alice, conn);
        registry.register(bob, conn);

        assert!(registry.handles_for_user(alice).is_empty());
        assert!(!registry.is_online(alice));
        assert_eq!(registry.user_of(conn), Some(bob));
    }

    #[test]
    fn identity_change_drops_rooms_but_same_user_keeps_them() {
        let registry = PresenceRegistry::new();
        let (alice, eve) = (Uuid::new_v4(), Uuid::new_v4());
        let chat = Uuid::new_v4();
        let (conn, _rx) = registry.connect();

        registry.register(alice, conn);
        registry.join_room(chat, conn);
        registry.register(alice, conn);
        assert!(registry.handles_for_room(chat).contains(&conn));

        registry.register(eve, conn);
        assert!(registry.handles_for_room(chat).is_empty());
        assert!(registry.rooms_of(conn).is_empty());
    }

    #[test]
    fn join_and_leave_are_idempotent() {
        let registry = PresenceRegistry::new();
        let chat = Uuid::new_v4();
        let (conn, _rx) = registry.connect();

        registry.join_room(chat, conn);
        registry.join_room(chat, conn);
        assert_eq!(registry.handles_for_room(chat).len(), 1);

        registry.leave_room(chat, conn);
        registry.leave_room(chat, conn);
        registry.leave_room(Uuid::new_v4(), conn);
        assert!(registry.handles_for_room(chat).is_empty());
        assert!(registry.rooms_of(conn).is_empty());
    }

    #[test]
    fn unregister_clears_every_room_and_user() {
        let registry = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let rooms = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let (conn, _rx) = registry.connect();
        let (other, _rx2) = registry.connect();

        registry.register(user, conn);
        registry.register(user, other);
        for room in rooms {
            registry.join_room(room, conn);
        }
        registry.join_room(rooms[0], other);

        registry.unregister(conn);

        for room in rooms {
            assert!(!registry.handles_for_room(room).contains(&conn));
        }
        assert!(!registry.handles_for_user(user).contains(&conn));
        assert!(registry.handles_for_room(rooms[0]).contains(&other));
        assert!(!registry.send(conn, ServerEvent::Connected));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn unregister_is_safe_without_registration() {
        let registry = PresenceRegistry::new();
        let (conn, _rx) = registry.connect();

        registry.unregister(conn);
        registry.unregister(conn);
        registry.unregister(Uuid::new_v4());

        assert_eq!(registry.connection_count(), 0);
        assert!(!registry.join_room(Uuid::new_v4(), conn));
        assert!(!registry.register(Uuid::new_v4(), conn));
    }

    #[test]
    fn send_reaches_only_the_target() {
        let registry = PresenceRegistry::new();
        let (a, mut rx_a) = registry.connect();
        let (_b, mut rx_b) = registry.connect();

        assert!(registry.send(a, ServerEvent::Connected));
        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::Connected)));
        assert!(rx_b.try_recv().is_err());
    }
}
