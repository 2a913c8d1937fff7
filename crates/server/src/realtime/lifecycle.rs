//! Connection Lifecycle Coordinator
//!
//! Ties an authenticated connection to the room registry and presence
//! tracker, and routes its inbound events to the message pipeline. Nothing
//! here knows about the transport; the socket layer feeds frames in and
//! drains the outbox returned by [`ConnectionCoordinator::connect`].

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::error::{Error, Result};
use crate::core::models::Identity;
use crate::core::store::ChatStore;
use crate::realtime::events::{ClientEvent, ServerEvent};
use crate::realtime::messages::MessagePipeline;
use crate::realtime::presence::PresenceTracker;
use crate::realtime::rooms::{ConnectionId, RoomKey, RoomRegistry};

pub struct ConnectionCoordinator {
    store: Arc<ChatStore>,
    rooms: Arc<RoomRegistry>,
    presence: Arc<PresenceTracker>,
    messages: Arc<MessagePipeline>,
}

impl ConnectionCoordinator {
    pub fn new(
        store: Arc<ChatStore>,
        rooms: Arc<RoomRegistry>,
        presence: Arc<PresenceTracker>,
        messages: Arc<MessagePipeline>,
    ) -> Self {
        Self {
            store,
            rooms,
            presence,
            messages,
        }
    }

    /// Registers an already-authenticated connection: personal room, then
    /// presence (which starts the heartbeat on the first device).
    pub async fn connect(&self, identity: &Identity) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (conn, outbox) = self.rooms.register(&identity.user_id);
        self.rooms.join(conn, RoomKey::user(identity.user_id.clone()));
        self.presence
            .connect(&identity.user_id, &identity.display_name, conn)
            .await;
        info!("[Lifecycle] {} connected as {}", identity.user_id, conn);
        (conn, outbox)
    }

    /// Tears a connection down. Safe to call more than once.
    pub async fn disconnect(&self, conn: ConnectionId, identity: &Identity) {
        match self.rooms.unregister(conn) {
            Some(detached) => debug!(
                "[Lifecycle] {} left {} room(s)",
                conn,
                detached.left_rooms.len()
            ),
            None => debug!("[Lifecycle] {} was already unregistered", conn),
        }
        self.presence
            .disconnect(&identity.user_id, &identity.display_name, conn)
            .await;
        info!("[Lifecycle] {} disconnected ({})", identity.user_id, conn);
    }

    /// Parses and handles one inbound text frame. Any failure is reported
    /// to this connection only.
    pub async fn handle_frame(&self, conn: ConnectionId, identity: &Identity, frame: &str) {
        match ClientEvent::parse(frame) {
            Ok(event) => self.handle(conn, identity, event).await,
            Err(e) => {
                debug!("[Lifecycle] Rejected frame from {}: {}", conn, e);
                self.rooms.send_to(conn, &ServerEvent::error(&e, None));
            }
        }
    }

    pub async fn handle(&self, conn: ConnectionId, identity: &Identity, event: ClientEvent) {
        let name = event.name();
        let correlation_id = event.correlation_id().map(str::to_string);

        if let Err(e) = self.dispatch(conn, identity, event).await {
            match &e {
                Error::TransientStore(_) => warn!("[Lifecycle] {} failed for {}: {}", name, conn, e),
                _ => debug!("[Lifecycle] {} rejected for {}: {}", name, conn, e),
            }
            self.rooms
                .send_to(conn, &ServerEvent::error(&e, correlation_id));
        }
    }

    async fn dispatch(&self, conn: ConnectionId, identity: &Identity, event: ClientEvent) -> Result<()> {
        let user_id = identity.user_id.as_str();
        match event {
            ClientEvent::SendMessage(payload) => {
                self.messages
                    .send_message(Some(conn), identity, payload)
                    .await?;
            }
            ClientEvent::MarkRead(r) => {
                self.messages
                    .mark_read(user_id, &r.message_id, &r.conversation_id)
                    .await?;
            }
            ClientEvent::MarkMessagesRead(p) => {
                self.messages
                    .mark_all_read(user_id, &p.conversation_id, p.up_to_message_id.as_deref())
                    .await?;
            }
            ClientEvent::MessageStatusUpdate(update) => {
                self.messages.update_status(user_id, update).await?;
            }
            ClientEvent::JoinConversation(r) => {
                if !self.store.is_member(&r.conversation_id, user_id).await? {
                    return Err(Error::access_denied("not a member of this conversation"));
                }
                self.rooms
                    .join(conn, RoomKey::conversation(r.conversation_id.clone()));
                self.rooms.send_to(
                    conn,
                    &ServerEvent::ConversationJoined {
                        conversation_id: r.conversation_id,
                    },
                );
            }
            ClientEvent::LeaveConversation(r) => {
                self.rooms
                    .leave(conn, &RoomKey::conversation(r.conversation_id.clone()));
                self.rooms.send_to(
                    conn,
                    &ServerEvent::ConversationLeft {
                        conversation_id: r.conversation_id,
                    },
                );
            }
            ClientEvent::Typing(payload) => {
                self.messages.typing(conn, identity, payload).await?;
            }
            ClientEvent::DeleteMessage(r) => {
                self.messages
                    .delete_message(user_id, &r.message_id, &r.conversation_id)
                    .await?;
            }
            ClientEvent::Heartbeat => {
                let server_time = match self.presence.touch(user_id).await {
                    Ok(at) => at,
                    Err(e) => {
                        warn!("[Lifecycle] Heartbeat for {} not persisted: {}", user_id, e);
                        Utc::now()
                    }
                };
                self.rooms
                    .send_to(conn, &ServerEvent::HeartbeatAck { server_time });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ConversationType;
    use crate::realtime::push::LogPushNotifier;
    use std::time::Duration;

    async fn coordinator() -> (Arc<ChatStore>, Arc<RoomRegistry>, ConnectionCoordinator) {
        let store = Arc::new(ChatStore::in_memory().await.unwrap());
        let rooms = Arc::new(RoomRegistry::new(64));
        let presence = Arc::new(PresenceTracker::new(
            store.clone(),
            rooms.clone(),
            Duration::from_secs(60),
        ));
        let messages = Arc::new(MessagePipeline::new(
            store.clone(),
            rooms.clone(),
            presence.clone(),
            Arc::new(LogPushNotifier),
            4000,
        ));
        let coordinator =
            ConnectionCoordinator::new(store.clone(), rooms.clone(), presence, messages);
        (store, rooms, coordinator)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_connect_joins_personal_room_and_disconnect_cleans_up() {
        let (store, rooms, coordinator) = coordinator().await;
        let ann = Identity::from(store.create_user("ann@example.com", "Ann").await.unwrap());

        let (conn, _rx) = coordinator.connect(&ann).await;
        assert!(rooms.is_in_room(conn, &RoomKey::user(ann.user_id.clone())));
        assert!(store.get_user(&ann.user_id).await.unwrap().unwrap().is_online);

        coordinator.disconnect(conn, &ann).await;
        coordinator.disconnect(conn, &ann).await;
        assert_eq!(rooms.connection_count(), 0);
        assert_eq!(rooms.room_count(), 0);
        assert!(!store.get_user(&ann.user_id).await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn test_join_conversation_requires_membership() {
        let (store, rooms, coordinator) = coordinator().await;
        let ann = Identity::from(store.create_user("ann@example.com", "Ann").await.unwrap());
        let eve = Identity::from(store.create_user("eve@example.com", "Eve").await.unwrap());
        let group = store
            .create_conversation(ConversationType::Group, Some("team"), &[ann.user_id.clone()])
            .await
            .unwrap();

        let (conn, mut rx) = coordinator.connect(&eve).await;
        let frame = format!(
            r#"{{"event":"join_conversation","data":{{"conversationId":"{}"}}}}"#,
            group.id
        );
        coordinator.handle_frame(conn, &eve, &frame).await;

        assert!(!rooms.is_in_room(conn, &RoomKey::conversation(group.id.clone())));
        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(ServerEvent::Error { .. })));

        let (ann_conn, mut ann_rx) = coordinator.connect(&ann).await;
        coordinator.handle_frame(ann_conn, &ann, &frame).await;
        assert!(rooms.is_in_room(ann_conn, &RoomKey::conversation(group.id.clone())));
        assert!(drain(&mut ann_rx)
            .iter()
            .any(|e| e.name() == "conversation_joined"));
    }

    #[tokio::test]
    async fn test_errors_echo_correlation_id_to_origin_only() {
        let (store, _rooms, coordinator) = coordinator().await;
        let ann = Identity::from(store.create_user("ann@example.com", "Ann").await.unwrap());
        let bob = Identity::from(store.create_user("bob@example.com", "Bob").await.unwrap());

        let (ann_conn, mut ann_rx) = coordinator.connect(&ann).await;
        let (_bob_conn, mut bob_rx) = coordinator.connect(&bob).await;
        drain(&mut ann_rx);
        drain(&mut bob_rx);

        let frame = r#"{"event":"send_message","data":{"conversationId":"missing","content":"hi","clientCorrelationId":"tmp-1"}}"#;
        coordinator.handle_frame(ann_conn, &ann, frame).await;

        match drain(&mut ann_rx).as_slice() {
            [ServerEvent::Error {
                client_correlation_id,
                ..
            }] => assert_eq!(client_correlation_id.as_deref(), Some("tmp-1")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_is_acked() {
        let (store, _rooms, coordinator) = coordinator().await;
        let ann = Identity::from(store.create_user("ann@example.com", "Ann").await.unwrap());
        let (conn, mut rx) = coordinator.connect(&ann).await;

        coordinator
            .handle_frame(conn, &ann, r#"{"event":"heartbeat"}"#)
            .await;
        assert!(matches!(
            drain(&mut rx).last(),
            Some(ServerEvent::HeartbeatAck { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_yields_error() {
        let (store, _rooms, coordinator) = coordinator().await;
        let ann = Identity::from(store.create_user("ann@example.com", "Ann").await.unwrap());
        let (conn, mut rx) = coordinator.connect(&ann).await;

        coordinator.handle_frame(conn, &ann, "{nope").await;
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerEvent::Error { .. }]
        ));
    }
}
