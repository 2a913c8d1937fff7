#![allow(dead_code)]

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use std::sync::Arc;
use std::time::Duration;
use teamchat_server::core::auth::Claims;
use teamchat_server::core::config::{AppState, RealtimeConfig};
use teamchat_server::core::models::{ConversationType, Identity};
use teamchat_server::core::store::ChatStore;
use teamchat_server::realtime::events::ServerEvent;
use teamchat_server::realtime::push::{DeliveryResult, PushNotification, PushNotifier};
use tokio::sync::mpsc;

pub const SECRET: &str = "integration-secret";

pub fn config() -> RealtimeConfig {
    RealtimeConfig {
        jwt_secret: SECRET.to_string(),
        ..Default::default()
    }
}

pub async fn state_with(push: Arc<dyn PushNotifier>) -> AppState {
    let store = Arc::new(ChatStore::in_memory().await.unwrap());
    AppState::new(config(), store, push)
}

pub fn token_for(user_id: &str) -> String {
    let config = config();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        iss: config.jwt_issuer,
        aud: config.jwt_audience,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

pub async fn user(store: &ChatStore, name: &str) -> Identity {
    let email = format!("{}@example.com", name.to_lowercase());
    Identity::from(store.create_user(&email, name).await.unwrap())
}

pub async fn group(store: &ChatStore, members: &[&Identity]) -> String {
    let ids: Vec<String> = members.iter().map(|m| m.user_id.clone()).collect();
    store
        .create_conversation(ConversationType::Group, Some("team"), &ids)
        .await
        .unwrap()
        .id
}

pub fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

pub fn names(events: &[ServerEvent]) -> Vec<&'static str> {
    events.iter().map(ServerEvent::name).collect()
}

/// Waits for the next event called `name`, skipping others.
pub async fn next_named(rx: &mut mpsc::Receiver<ServerEvent>, name: &str) -> Option<ServerEvent> {
    tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = rx.recv().await {
            if event.name() == name {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

pub type PushCall = (Vec<String>, PushNotification);

/// Records every dispatch and reports it delivered.
pub struct RecordingPush {
    calls: mpsc::UnboundedSender<PushCall>,
}

impl RecordingPush {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PushCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { calls: tx }), rx)
    }
}

#[async_trait]
impl PushNotifier for RecordingPush {
    async fn push_notify(
        &self,
        user_ids: &[String],
        notification: &PushNotification,
    ) -> anyhow::Result<DeliveryResult> {
        let _ = self.calls.send((user_ids.to_vec(), notification.clone()));
        Ok(DeliveryResult::all_delivered(user_ids))
    }
}

/// Provider outage: every dispatch errors.
pub struct FailingPush;

#[async_trait]
impl PushNotifier for FailingPush {
    async fn push_notify(
        &self,
        _user_ids: &[String],
        _notification: &PushNotification,
    ) -> anyhow::Result<DeliveryResult> {
        anyhow::bail!("push provider unavailable")
    }
}
