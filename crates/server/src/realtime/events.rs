//! Wire events
//!
//! Every frame is a JSON object `{"event": <name>, "data": {...}}`. Inbound
//! frames are parsed into [`ClientEvent`] before any business logic runs;
//! unknown event names, unknown fields and malformed payloads are rejected
//! as validation errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::core::models::{Message, MessageStatus, MessageType};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendMessagePayload {
    pub conversation_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub client_correlation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MessageRef {
    pub message_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MarkMessagesReadPayload {
    pub conversation_id: String,
    #[serde(default)]
    pub up_to_message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StatusUpdatePayload {
    pub message_id: String,
    pub conversation_id: String,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConversationRef {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TypingPayload {
    pub conversation_id: String,
    pub is_typing: bool,
}

/// Client → server events
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage(SendMessagePayload),
    MarkRead(MessageRef),
    MarkMessagesRead(MarkMessagesReadPayload),
    MessageStatusUpdate(StatusUpdatePayload),
    JoinConversation(ConversationRef),
    LeaveConversation(ConversationRef),
    Typing(TypingPayload),
    DeleteMessage(MessageRef),
    Heartbeat,
}

impl ClientEvent {
    pub fn parse(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| Error::validation(format!("malformed event: {}", e)))
    }

    /// Correlation id echoed back on errors, if the client sent one.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ClientEvent::SendMessage(p) => p.client_correlation_id.as_deref(),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::MarkRead(_) => "mark_read",
            ClientEvent::MarkMessagesRead(_) => "mark_messages_read",
            ClientEvent::MessageStatusUpdate(_) => "message_status_update",
            ClientEvent::JoinConversation(_) => "join_conversation",
            ClientEvent::LeaveConversation(_) => "leave_conversation",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::DeleteMessage(_) => "delete_message",
            ClientEvent::Heartbeat => "heartbeat",
        }
    }
}

/// Server → client events
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    MessageReceived {
        message: Message,
        conversation_id: String,
        sent_by: String,
        online_member_count: usize,
        total_member_count: usize,
    },
    MessageSent {
        message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_correlation_id: Option<String>,
        status: MessageStatus,
        sent_at: DateTime<Utc>,
    },
    MessageRead {
        message_id: String,
        conversation_id: String,
        read_by: String,
        read_at: DateTime<Utc>,
    },
    MessagesRead {
        conversation_id: String,
        read_by: String,
        read_count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        up_to_message_id: Option<String>,
    },
    MessageStatusUpdate {
        message_id: String,
        conversation_id: String,
        status: MessageStatus,
    },
    MessageDeleted {
        message_id: String,
        conversation_id: String,
        deleted_by: String,
    },
    #[serde(rename = "user-presence-updated")]
    UserPresenceUpdated {
        user_id: String,
        display_name: String,
        is_online: bool,
        last_seen: DateTime<Utc>,
        conversation_id: String,
    },
    UserOnline {
        user_id: String,
        display_name: String,
        last_seen: DateTime<Utc>,
    },
    UserOffline {
        user_id: String,
        display_name: String,
        last_seen: DateTime<Utc>,
    },
    UserTyping {
        conversation_id: String,
        user_id: String,
        display_name: String,
        is_typing: bool,
    },
    ConversationJoined {
        conversation_id: String,
    },
    ConversationLeft {
        conversation_id: String,
    },
    HeartbeatAck {
        server_time: DateTime<Utc>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_correlation_id: Option<String>,
    },
}

impl ServerEvent {
    pub fn error(err: &Error, client_correlation_id: Option<String>) -> Self {
        ServerEvent::Error {
            message: err.client_message(),
            client_correlation_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::MessageReceived { .. } => "message_received",
            ServerEvent::MessageSent { .. } => "message_sent",
            ServerEvent::MessageRead { .. } => "message_read",
            ServerEvent::MessagesRead { .. } => "messages_read",
            ServerEvent::MessageStatusUpdate { .. } => "message_status_update",
            ServerEvent::MessageDeleted { .. } => "message_deleted",
            ServerEvent::UserPresenceUpdated { .. } => "user-presence-updated",
            ServerEvent::UserOnline { .. } => "user_online",
            ServerEvent::UserOffline { .. } => "user_offline",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::ConversationJoined { .. } => "conversation_joined",
            ServerEvent::ConversationLeft { .. } => "conversation_left",
            ServerEvent::HeartbeatAck { .. } => "heartbeat_ack",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn to_frame(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::validation(format!("unencodable event: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_send_message() {
        let frame = json!({
            "event": "send_message",
            "data": {
                "conversationId": "c1",
                "content": "hello",
                "type": "image",
                "mediaUrl": "https://cdn/x.png",
                "clientCorrelationId": "tmp-1"
            }
        })
        .to_string();

        let event = ClientEvent::parse(&frame).unwrap();
        assert_eq!(event.correlation_id(), Some("tmp-1"));
        match event {
            ClientEvent::SendMessage(p) => {
                assert_eq!(p.conversation_id, "c1");
                assert_eq!(p.message_type, MessageType::Image);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_send_message_type_defaults_to_text() {
        let frame = r#"{"event":"send_message","data":{"conversationId":"c1","content":"hi"}}"#;
        match ClientEvent::parse(frame).unwrap() {
            ClientEvent::SendMessage(p) => assert_eq!(p.message_type, MessageType::Text),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_without_data() {
        assert_eq!(
            ClientEvent::parse(r#"{"event":"heartbeat"}"#).unwrap(),
            ClientEvent::Heartbeat
        );
    }

    #[test]
    fn test_rejects_malformed_frames() {
        let frames = [
            "not json",
            r#"{"event":"launch_rockets","data":{}}"#,
            r#"{"event":"send_message","data":{"conversationId":"c1","content":"x","type":"video"}}"#,
            r#"{"event":"mark_read","data":{"messageId":"m1"}}"#,
            r#"{"event":"mark_read","data":{"messageId":"m1","conversationId":"c1","extra":1}}"#,
        ];
        for frame in frames {
            let err = ClientEvent::parse(frame).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{} -> {:?}", frame, err);
        }
    }

    #[test]
    fn test_server_event_shapes() {
        let event = ServerEvent::UserPresenceUpdated {
            user_id: "u1".into(),
            display_name: "Ann".into(),
            is_online: true,
            last_seen: DateTime::<Utc>::UNIX_EPOCH,
            conversation_id: "c1".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(value["event"], "user-presence-updated");
        assert_eq!(value["data"]["isOnline"], true);
        assert_eq!(value["data"]["conversationId"], "c1");

        let sent = ServerEvent::MessageSent {
            message_id: "m1".into(),
            client_correlation_id: None,
            status: MessageStatus::Sent,
            sent_at: DateTime::<Utc>::UNIX_EPOCH,
        };
        let value: serde_json::Value = serde_json::from_str(&sent.to_frame().unwrap()).unwrap();
        assert_eq!(value["event"], "message_sent");
        assert_eq!(value["data"]["status"], "sent");
        assert!(value["data"].get("clientCorrelationId").is_none());
    }
}
