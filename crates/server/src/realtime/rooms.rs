//! Room Registry
//!
//! In-memory bookkeeping of live connections and the rooms they are joined
//! to. Connections live in one table keyed by [`ConnectionId`]; rooms only
//! hold ids, so dropping a connection is a single removal plus a sweep of
//! the rooms recorded in its session.
//!
//! Every connection owns a bounded outbox. Delivery uses `try_send`, so a
//! slow receiver loses events instead of stalling the broadcaster.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::realtime::events::ServerEvent;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKey {
    /// Personal room: every connection of one user.
    User(String),
    /// Broadcast room for one conversation.
    Conversation(String),
}

impl RoomKey {
    pub fn user(user_id: impl Into<String>) -> Self {
        RoomKey::User(user_id.into())
    }

    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        RoomKey::Conversation(conversation_id.into())
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::User(id) => write!(f, "user:{}", id),
            RoomKey::Conversation(id) => write!(f, "conversation:{}", id),
        }
    }
}

struct Session {
    user_id: String,
    outbox: mpsc::Sender<ServerEvent>,
    /// Conversation rooms joined, so they can be left en masse.
    conversation_rooms: HashSet<String>,
}

/// What was torn down when a connection was unregistered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedSession {
    pub user_id: String,
    /// Rooms left, conversation rooms first and the personal room last.
    pub left_rooms: Vec<RoomKey>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<ConnectionId, Session>,
    rooms: HashMap<RoomKey, HashSet<ConnectionId>>,
}

impl Registry {
    fn remove_from_room(&mut self, conn: ConnectionId, room: &RoomKey) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(&conn);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    fn deliver(&self, conn: ConnectionId, event: &ServerEvent) -> bool {
        let Some(session) = self.sessions.get(&conn) else {
            return false;
        };
        match session.outbox.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "[Rooms] Outbox full for connection {} ({}), dropping {}",
                    conn,
                    session.user_id,
                    event.name()
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

pub struct RoomRegistry {
    inner: RwLock<Registry>,
    outbox_capacity: usize,
}

impl RoomRegistry {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    /// Adds a live connection for `user_id` and returns the receiving end
    /// of its outbox. The connection is not in any room yet.
    pub fn register(&self, user_id: &str) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        let conn = Uuid::new_v4();
        self.inner.write().sessions.insert(
            conn,
            Session {
                user_id: user_id.to_string(),
                outbox: tx,
                conversation_rooms: HashSet::new(),
            },
        );
        debug!("[Rooms] Registered connection {} for {}", conn, user_id);
        (conn, rx)
    }

    /// Removes a connection and leaves every room it was in. Returns `None`
    /// if the connection was already gone.
    pub fn unregister(&self, conn: ConnectionId) -> Option<DetachedSession> {
        let mut inner = self.inner.write();
        let session = inner.sessions.remove(&conn)?;

        let mut left_rooms = Vec::with_capacity(session.conversation_rooms.len() + 1);
        for conversation_id in &session.conversation_rooms {
            let room = RoomKey::conversation(conversation_id.clone());
            if inner.remove_from_room(conn, &room) {
                left_rooms.push(room);
            }
        }
        let personal = RoomKey::user(session.user_id.clone());
        if inner.remove_from_room(conn, &personal) {
            left_rooms.push(personal);
        }

        debug!(
            "[Rooms] Unregistered connection {} ({} rooms left)",
            conn,
            left_rooms.len()
        );
        Some(DetachedSession {
            user_id: session.user_id,
            left_rooms,
        })
    }

    pub fn user_of(&self, conn: ConnectionId) -> Option<String> {
        self.inner.read().sessions.get(&conn).map(|s| s.user_id.clone())
    }

    /// Idempotent. Returns true only when the connection was newly added.
    pub fn join(&self, conn: ConnectionId, room: RoomKey) -> bool {
        let mut inner = self.inner.write();
        let Some(session) = inner.sessions.get_mut(&conn) else {
            return false;
        };
        if let RoomKey::Conversation(id) = &room {
            session.conversation_rooms.insert(id.clone());
        }
        inner.rooms.entry(room).or_default().insert(conn)
    }

    /// Idempotent. Leaving a room that does not exist is not an error.
    pub fn leave(&self, conn: ConnectionId, room: &RoomKey) -> bool {
        let mut inner = self.inner.write();
        if let RoomKey::Conversation(id) = room {
            if let Some(session) = inner.sessions.get_mut(&conn) {
                session.conversation_rooms.remove(id);
            }
        }
        inner.remove_from_room(conn, room)
    }

    /// Delivers `event` to every connection in `room` except `exclude`.
    /// Returns how many outboxes accepted it.
    pub fn broadcast(
        &self,
        room: &RoomKey,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        self.broadcast_to_rooms(std::slice::from_ref(room), event, exclude)
    }

    /// Like [`broadcast`](Self::broadcast) over several rooms; a connection
    /// present in more than one of them receives the event once.
    pub fn broadcast_to_rooms(
        &self,
        rooms: &[RoomKey],
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let inner = self.inner.read();
        let mut targets = HashSet::new();
        for room in rooms {
            if let Some(members) = inner.rooms.get(room) {
                targets.extend(members.iter().copied());
            }
        }
        if let Some(excluded) = exclude {
            targets.remove(&excluded);
        }

        targets
            .into_iter()
            .filter(|conn| inner.deliver(*conn, event))
            .count()
    }

    /// Sends to a single connection.
    pub fn send_to(&self, conn: ConnectionId, event: &ServerEvent) -> bool {
        self.inner.read().deliver(conn, event)
    }

    /// Distinct users with at least one connection in `room`.
    pub fn members_of(&self, room: &RoomKey) -> HashSet<String> {
        let inner = self.inner.read();
        inner
            .rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|conn| inner.sessions.get(conn))
                    .map(|s| s.user_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn connections_in(&self, room: &RoomKey) -> usize {
        self.inner.read().rooms.get(room).map_or(0, HashSet::len)
    }

    pub fn is_in_room(&self, conn: ConnectionId, room: &RoomKey) -> bool {
        self.inner
            .read()
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(&conn))
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn room_count(&self) -> usize {
        self.inner.read().rooms.len()
    }
}
