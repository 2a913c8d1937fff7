//! Message Pipeline
//!
//! Creation, read receipts, status transitions and history for chat
//! messages. Every operation checks conversation membership before touching
//! the store, and only broadcasts after the store write succeeded.
//!
//! Conversation-wide events go to the conversation room plus the personal
//! room of every member, de-duplicated per connection, so a member who is
//! connected but has not joined the conversation room still hears about it.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::error::{Error, Result};
use crate::core::models::{Identity, Message, MessageStatus, MessageType, ReadReceipt};
use crate::core::store::{ChatStore, MessageCursor, MessageWindow, NewMessage};
use crate::realtime::events::{SendMessagePayload, ServerEvent, StatusUpdatePayload, TypingPayload};
use crate::realtime::presence::PresenceTracker;
use crate::realtime::push::{PushNotification, PushNotifier};
use crate::realtime::rooms::{ConnectionId, RoomKey, RoomRegistry};

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 100;
pub const DELETED_TOMBSTONE: &str = "This message was deleted";

const PUSH_PREVIEW_CHARS: usize = 100;

/// History request. `before`/`after` are message ids; `page` is 1-based and
/// only applies when no cursor is given.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub before: Option<String>,
    pub after: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<i64>,
}

impl HistoryQuery {
    pub fn clamped_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }
}

pub struct MessagePipeline {
    store: Arc<ChatStore>,
    rooms: Arc<RoomRegistry>,
    presence: Arc<PresenceTracker>,
    push: Arc<dyn PushNotifier>,
    max_message_length: usize,
}

impl MessagePipeline {
    pub fn new(
        store: Arc<ChatStore>,
        rooms: Arc<RoomRegistry>,
        presence: Arc<PresenceTracker>,
        push: Arc<dyn PushNotifier>,
        max_message_length: usize,
    ) -> Self {
        Self {
            store,
            rooms,
            presence,
            push,
            max_message_length,
        }
    }

    /// Validates, persists and fans out a new message. The confirmation goes
    /// to `origin` only; offline members are handed to the push notifier in
    /// a detached task.
    pub async fn send_message(
        &self,
        origin: Option<ConnectionId>,
        sender: &Identity,
        payload: SendMessagePayload,
    ) -> Result<Message> {
        self.validate_content(&payload.content)?;

        if !self
            .store
            .is_member(&payload.conversation_id, &sender.user_id)
            .await?
        {
            return Err(Error::access_denied(
                "sender is not a member of this conversation",
            ));
        }
        if self
            .store
            .get_conversation(&payload.conversation_id)
            .await?
            .is_none()
        {
            return Err(Error::not_found("conversation"));
        }

        let message = self
            .store
            .insert_message(NewMessage {
                conversation_id: payload.conversation_id.clone(),
                sender_id: sender.user_id.clone(),
                content: payload.content,
                message_type: payload.message_type,
                media_url: payload.media_url,
            })
            .await?;

        // The message is committed; anything below degrades instead of failing
        let member_ids = self.fanout_members(&message.conversation_id).await;
        let online_member_count = self.presence.online_count(&member_ids);

        let event = ServerEvent::MessageReceived {
            message: message.clone(),
            conversation_id: message.conversation_id.clone(),
            sent_by: sender.user_id.clone(),
            online_member_count,
            total_member_count: member_ids.len(),
        };
        let reached = self
            .rooms
            .broadcast_to_rooms(&audience(&message.conversation_id, &member_ids), &event, None);
        debug!(
            "[Messages] {} delivered to {} connection(s)",
            message.id, reached
        );

        if let Some(conn) = origin {
            self.rooms.send_to(
                conn,
                &ServerEvent::MessageSent {
                    message_id: message.id.clone(),
                    client_correlation_id: payload.client_correlation_id,
                    status: message.status,
                    sent_at: message.created_at,
                },
            );
        }

        let offline: Vec<String> = member_ids
            .iter()
            .filter(|id| **id != sender.user_id && !self.presence.is_online(id))
            .cloned()
            .collect();
        let others_online = member_ids
            .iter()
            .any(|id| *id != sender.user_id && self.presence.is_online(id));

        if !offline.is_empty() {
            let dispatch = PushDispatch {
                store: self.store.clone(),
                rooms: self.rooms.clone(),
                push: self.push.clone(),
            };
            let notification = push_notification(sender, &message);
            let sender_id = sender.user_id.clone();
            tokio::spawn(async move {
                dispatch
                    .run(offline, notification, sender_id, others_online)
                    .await;
            });
        }

        info!(
            "[Messages] {} sent {} to {}",
            sender.user_id, message.id, message.conversation_id
        );
        Ok(message)
    }

    /// Records that `user_id` read a message. The message moves to `read`
    /// once every member but the sender holds a receipt; that transition
    /// happens and is announced exactly once.
    pub async fn mark_read(
        &self,
        user_id: &str,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<ReadReceipt> {
        let message = self.load_message(message_id, conversation_id).await?;
        self.require_member(conversation_id, user_id).await?;

        let receipt = self
            .store
            .upsert_read_receipt(message_id, user_id, Utc::now())
            .await?;
        if let Err(e) = self.promote_if_read(&message).await {
            warn!("[Messages] Read promotion of {} skipped: {}", message_id, e);
        }

        let member_ids = self.fanout_members(conversation_id).await;
        self.rooms.broadcast_to_rooms(
            &audience(conversation_id, &member_ids),
            &ServerEvent::MessageRead {
                message_id: message_id.to_string(),
                conversation_id: conversation_id.to_string(),
                read_by: user_id.to_string(),
                read_at: receipt.read_at,
            },
            None,
        );
        Ok(receipt)
    }

    /// Bulk read up to `up_to_message_id` (inclusive) or the whole
    /// conversation. Returns how many messages were newly read.
    pub async fn mark_all_read(
        &self,
        user_id: &str,
        conversation_id: &str,
        up_to_message_id: Option<&str>,
    ) -> Result<usize> {
        self.require_member(conversation_id, user_id).await?;

        let cursor = match up_to_message_id {
            Some(id) => Some(self.cursor(conversation_id, id).await?),
            None => None,
        };

        let read_ids = self
            .store
            .mark_all_read(conversation_id, user_id, cursor, Utc::now())
            .await?;

        for message_id in &read_ids {
            let promoted = match self.store.get_message(message_id).await {
                Ok(Some(message)) => self.promote_if_read(&message).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = promoted {
                warn!("[Messages] Read promotion of {} skipped: {}", message_id, e);
            }
        }

        let member_ids = self.fanout_members(conversation_id).await;
        self.rooms.broadcast_to_rooms(
            &audience(conversation_id, &member_ids),
            &ServerEvent::MessagesRead {
                conversation_id: conversation_id.to_string(),
                read_by: user_id.to_string(),
                read_count: read_ids.len(),
                up_to_message_id: up_to_message_id.map(str::to_string),
            },
            None,
        );
        debug!(
            "[Messages] {} read {} message(s) in {}",
            user_id,
            read_ids.len(),
            conversation_id
        );
        Ok(read_ids.len())
    }

    /// Client acknowledgment that a message reached one of its devices.
    /// Only `delivered` may be requested; a message already further along
    /// is left alone. Returns whether the status changed.
    pub async fn update_status(&self, user_id: &str, update: StatusUpdatePayload) -> Result<bool> {
        if update.status != MessageStatus::Delivered {
            return Err(Error::validation(format!(
                "clients may only report delivered, got {}",
                update.status
            )));
        }
        let message = self
            .load_message(&update.message_id, &update.conversation_id)
            .await?;
        self.require_member(&update.conversation_id, user_id).await?;
        if message.sender_id == user_id {
            return Err(Error::validation("sender cannot acknowledge own message"));
        }

        let changed = self
            .store
            .transition_status(&message.id, &[MessageStatus::Sent], MessageStatus::Delivered)
            .await?;
        if changed {
            self.announce_status(&message, MessageStatus::Delivered).await;
        }
        Ok(changed)
    }

    /// Soft delete. Only the sender may delete; content is replaced with a
    /// tombstone. Deleting twice is a no-op.
    pub async fn delete_message(
        &self,
        user_id: &str,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<bool> {
        let message = self.load_message(message_id, conversation_id).await?;
        if message.sender_id != user_id {
            return Err(Error::access_denied("only the sender can delete a message"));
        }

        let deleted = self
            .store
            .soft_delete_message(message_id, DELETED_TOMBSTONE)
            .await?;
        if deleted {
            let member_ids = self.fanout_members(conversation_id).await;
            self.rooms.broadcast_to_rooms(
                &audience(conversation_id, &member_ids),
                &ServerEvent::MessageDeleted {
                    message_id: message_id.to_string(),
                    conversation_id: conversation_id.to_string(),
                    deleted_by: user_id.to_string(),
                },
                None,
            );
            info!("[Messages] {} deleted {}", user_id, message_id);
        }
        Ok(deleted)
    }

    pub async fn typing(
        &self,
        origin: ConnectionId,
        user: &Identity,
        payload: TypingPayload,
    ) -> Result<()> {
        self.require_member(&payload.conversation_id, &user.user_id)
            .await?;
        let room = RoomKey::conversation(payload.conversation_id.clone());
        self.rooms.broadcast(
            &room,
            &ServerEvent::UserTyping {
                conversation_id: payload.conversation_id,
                user_id: user.user_id.clone(),
                display_name: user.display_name.clone(),
                is_typing: payload.is_typing,
            },
            Some(origin),
        );
        Ok(())
    }

    /// History in chronological order.
    pub async fn history(
        &self,
        user_id: &str,
        conversation_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<Message>> {
        self.require_member(conversation_id, user_id).await?;

        let limit = query.clamped_limit();
        let window = match (&query.before, &query.after) {
            (Some(_), Some(_)) => {
                return Err(Error::validation("before and after are mutually exclusive"));
            }
            (Some(before), None) => MessageWindow::Before {
                cursor: self.cursor(conversation_id, before).await?,
                limit,
            },
            (None, Some(after)) => MessageWindow::After {
                cursor: self.cursor(conversation_id, after).await?,
                limit,
            },
            (None, None) => {
                let page = query.page.unwrap_or(1);
                if page == 0 {
                    return Err(Error::validation("page starts at 1"));
                }
                MessageWindow::Latest {
                    limit,
                    offset: (i64::from(page) - 1) * limit,
                }
            }
        };

        self.store.page_messages(conversation_id, window).await
    }

    pub async fn unread_count(&self, user_id: &str, conversation_id: &str) -> Result<i64> {
        self.require_member(conversation_id, user_id).await?;
        self.store.unread_count(conversation_id, user_id).await
    }

    /// Moves a message to `failed` and tells the sender. Returns false if
    /// the message was already terminal.
    pub async fn mark_failed(&self, message_id: &str) -> Result<bool> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| Error::not_found("message"))?;
        fail_message(
            &self.store,
            &self.rooms,
            &message.id,
            &message.conversation_id,
            &message.sender_id,
        )
        .await
    }

    fn validate_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(Error::validation("message content is empty"));
        }
        let length = content.chars().count();
        if length > self.max_message_length {
            return Err(Error::validation(format!(
                "message content is {} characters, limit is {}",
                length, self.max_message_length
            )));
        }
        Ok(())
    }

    async fn require_member(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        if self.store.is_member(conversation_id, user_id).await? {
            Ok(())
        } else {
            Err(Error::access_denied("not a member of this conversation"))
        }
    }

    async fn load_message(&self, message_id: &str, conversation_id: &str) -> Result<Message> {
        self.store
            .get_message(message_id)
            .await?
            .filter(|m| m.conversation_id == conversation_id)
            .ok_or_else(|| Error::not_found("message"))
    }

    async fn cursor(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<MessageCursor> {
        self.store
            .message_cursor(conversation_id, message_id)
            .await?
            .ok_or_else(|| Error::not_found("cursor message"))
    }

    async fn promote_if_read(&self, message: &Message) -> Result<()> {
        if message.status.is_terminal() || !self.store.read_by_all_recipients(message).await? {
            return Ok(());
        }
        let promoted = self
            .store
            .transition_status(
                &message.id,
                &[MessageStatus::Sent, MessageStatus::Delivered],
                MessageStatus::Read,
            )
            .await?;
        if promoted {
            self.announce_status(message, MessageStatus::Read).await;
        }
        Ok(())
    }

    /// Members to fan out to after a committed write. If the lookup fails
    /// only the conversation room hears about it.
    async fn fanout_members(&self, conversation_id: &str) -> Vec<String> {
        match self.store.member_ids(conversation_id).await {
            Ok(member_ids) => member_ids,
            Err(e) => {
                warn!("[Messages] Could not load members of {}: {}", conversation_id, e);
                Vec::new()
            }
        }
    }

    async fn announce_status(&self, message: &Message, status: MessageStatus) {
        let member_ids = self.fanout_members(&message.conversation_id).await;
        self.rooms.broadcast_to_rooms(
            &audience(&message.conversation_id, &member_ids),
            &ServerEvent::MessageStatusUpdate {
                message_id: message.id.clone(),
                conversation_id: message.conversation_id.clone(),
                status,
            },
            None,
        );
        debug!("[Messages] {} is now {}", message.id, status);
    }
}

/// Conversation room plus every member's personal room.
fn audience(conversation_id: &str, member_ids: &[String]) -> Vec<RoomKey> {
    std::iter::once(RoomKey::conversation(conversation_id))
        .chain(member_ids.iter().cloned().map(RoomKey::user))
        .collect()
}

fn push_notification(sender: &Identity, message: &Message) -> PushNotification {
    let body = match message.message_type {
        MessageType::Image => "Sent an image".to_string(),
        MessageType::File => "Sent a file".to_string(),
        MessageType::Text | MessageType::System => {
            let mut preview: String = message.content.chars().take(PUSH_PREVIEW_CHARS).collect();
            if message.content.chars().count() > PUSH_PREVIEW_CHARS {
                preview.push('…');
            }
            preview
        }
    };
    PushNotification {
        title: sender.display_name.clone(),
        body,
        conversation_id: message.conversation_id.clone(),
        message_id: message.id.clone(),
    }
}

async fn fail_message(
    store: &ChatStore,
    rooms: &RoomRegistry,
    message_id: &str,
    conversation_id: &str,
    sender_id: &str,
) -> Result<bool> {
    let failed = store
        .transition_status(
            message_id,
            &[MessageStatus::Sent, MessageStatus::Delivered],
            MessageStatus::Failed,
        )
        .await?;
    if failed {
        rooms.broadcast(
            &RoomKey::user(sender_id),
            &ServerEvent::MessageStatusUpdate {
                message_id: message_id.to_string(),
                conversation_id: conversation_id.to_string(),
                status: MessageStatus::Failed,
            },
            None,
        );
        warn!("[Messages] {} could not reach any recipient", message_id);
    }
    Ok(failed)
}

/// Detached push side effect of a send.
struct PushDispatch {
    store: Arc<ChatStore>,
    rooms: Arc<RoomRegistry>,
    push: Arc<dyn PushNotifier>,
}

impl PushDispatch {
    async fn run(
        self,
        recipients: Vec<String>,
        notification: PushNotification,
        sender_id: String,
        others_online: bool,
    ) {
        let reached_anyone = match self.push.push_notify(&recipients, &notification).await {
            Ok(result) => {
                if !result.failed.is_empty() {
                    warn!(
                        "[Push] {} of {} push(es) failed for {}",
                        result.failed.len(),
                        recipients.len(),
                        notification.message_id
                    );
                }
                !result.delivered.is_empty()
            }
            Err(e) => {
                warn!("[Push] Dispatch for {} failed: {:#}", notification.message_id, e);
                false
            }
        };

        if others_online || reached_anyone {
            return;
        }
        if let Err(e) = fail_message(
            &self.store,
            &self.rooms,
            &notification.message_id,
            &notification.conversation_id,
            &sender_id,
        )
        .await
        {
            warn!(
                "[Messages] Could not mark {} failed: {}",
                notification.message_id, e
            );
        }
    }
}
