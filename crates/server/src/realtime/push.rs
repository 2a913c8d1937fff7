//! Push notification dispatch for members who are not connected.
//!
//! The realtime core only hands recipients and a payload to a
//! [`PushNotifier`]; device tokens and provider integrations live behind it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    pub conversation_id: String,
    pub message_id: String,
}

/// Per-recipient outcome reported by the push collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeliveryResult {
    #[serde(default)]
    pub delivered: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

impl DeliveryResult {
    pub fn all_delivered(user_ids: &[String]) -> Self {
        Self {
            delivered: user_ids.to_vec(),
            failed: Vec::new(),
        }
    }

    /// Reads a 2xx webhook reply. An empty body accepts every recipient;
    /// an unreadable one is logged and also taken as accepted, since the
    /// service already answered with success.
    pub fn from_webhook_body(body: &[u8], user_ids: &[String]) -> Self {
        if body.is_empty() {
            return Self::all_delivered(user_ids);
        }
        serde_json::from_slice(body).unwrap_or_else(|e| {
            warn!(
                "[Push] Unreadable webhook reply for {} recipient(s), assuming accepted: {}",
                user_ids.len(),
                e
            );
            Self::all_delivered(user_ids)
        })
    }

    pub fn all_failed(user_ids: &[String]) -> Self {
        Self {
            delivered: Vec::new(),
            failed: user_ids.to_vec(),
        }
    }
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn push_notify(
        &self,
        user_ids: &[String],
        notification: &PushNotification,
    ) -> Result<DeliveryResult>;
}

/// Logs instead of dispatching. Used when no webhook is configured.
pub struct LogPushNotifier;

#[async_trait]
impl PushNotifier for LogPushNotifier {
    async fn push_notify(
        &self,
        user_ids: &[String],
        notification: &PushNotification,
    ) -> Result<DeliveryResult> {
        info!(
            "[Push] Would notify {} user(s) about message {}",
            user_ids.len(),
            notification.message_id
        );
        Ok(DeliveryResult::all_delivered(user_ids))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookRequest<'a> {
    user_ids: &'a [String],
    notification: &'a PushNotification,
}

/// POSTs each dispatch to an HTTP endpoint owned by the notification service.
pub struct WebhookPushNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookPushNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl PushNotifier for WebhookPushNotifier {
    async fn push_notify(
        &self,
        user_ids: &[String],
        notification: &PushNotification,
    ) -> Result<DeliveryResult> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookRequest {
                user_ids,
                notification,
            })
            .send()
            .await
            .context("push webhook unreachable")?
            .error_for_status()
            .context("push webhook rejected dispatch")?;

        let body = response.bytes().await.context("push webhook body")?;
        Ok(DeliveryResult::from_webhook_body(&body, user_ids))
    }
}
