//! Realtime server configuration

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::core::auth::{Authenticator, JwtVerifier};
use crate::core::error::{Error, Result};
use crate::core::store::ChatStore;
use crate::realtime::lifecycle::ConnectionCoordinator;
use crate::realtime::messages::MessagePipeline;
use crate::realtime::presence::PresenceTracker;
use crate::realtime::push::PushNotifier;
use crate::realtime::rooms::RoomRegistry;

/// Configuration for the realtime server
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    /// sqlx connection string for the durable store
    pub database_url: String,
    /// Address the HTTP/WebSocket listener binds to
    pub bind_addr: SocketAddr,
    /// HMAC secret used to verify connection tokens
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    /// How often lastSeen is refreshed for connected users
    pub heartbeat_interval: Duration,
    /// How often the stale-presence sweep runs
    pub sweep_interval: Duration,
    /// Users online in the store without a heartbeat for this long are swept
    pub stale_after: Duration,
    /// Max message length in characters
    pub max_message_length: usize,
    /// Per-connection outbound queue depth
    pub outbox_capacity: usize,
    /// Push webhook endpoint. Unset means pushes are only logged.
    pub push_webhook_url: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:teamchat.sqlite".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            jwt_secret: String::new(),
            jwt_issuer: "teamchat".to_string(),
            jwt_audience: "teamchat-clients".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(60),
            max_message_length: 4000,
            outbox_capacity: 256,
            push_webhook_url: None,
        }
    }
}

impl RealtimeConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::FatalConfig("JWT_SECRET must be set".to_string()))?;

        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: parse_or(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            jwt_secret,
            jwt_issuer: lookup("JWT_ISSUER").unwrap_or(defaults.jwt_issuer),
            jwt_audience: lookup("JWT_AUDIENCE").unwrap_or(defaults.jwt_audience),
            heartbeat_interval: Duration::from_secs(parse_or(
                &lookup,
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(parse_or(
                &lookup,
                "PRESENCE_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            stale_after: Duration::from_secs(parse_or(
                &lookup,
                "PRESENCE_STALE_AFTER_SECS",
                defaults.stale_after.as_secs(),
            )?),
            max_message_length: parse_or(
                &lookup,
                "MAX_MESSAGE_LENGTH",
                defaults.max_message_length,
            )?,
            outbox_capacity: parse_or(&lookup, "OUTBOX_CAPACITY", defaults.outbox_capacity)?,
            push_webhook_url: lookup("PUSH_WEBHOOK_URL").filter(|s| !s.is_empty()),
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::FatalConfig(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

/// App state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: RealtimeConfig,
    pub store: Arc<ChatStore>,
    pub auth: Arc<Authenticator>,
    pub rooms: Arc<RoomRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub messages: Arc<MessagePipeline>,
    pub coordinator: Arc<ConnectionCoordinator>,
}

impl AppState {
    /// Wires every component around an opened store. Built once per process.
    pub fn new(
        config: RealtimeConfig,
        store: Arc<ChatStore>,
        push: Arc<dyn PushNotifier>,
    ) -> Self {
        let verifier = Arc::new(JwtVerifier::new(&config, store.clone()));
        let auth = Arc::new(Authenticator::new(verifier));
        let rooms = Arc::new(RoomRegistry::new(config.outbox_capacity));
        let presence = Arc::new(PresenceTracker::new(
            store.clone(),
            rooms.clone(),
            config.stale_after,
        ));
        let messages = Arc::new(MessagePipeline::new(
            store.clone(),
            rooms.clone(),
            presence.clone(),
            push,
            config.max_message_length,
        ));
        let coordinator = Arc::new(ConnectionCoordinator::new(
            store.clone(),
            rooms.clone(),
            presence.clone(),
            messages.clone(),
        ));

        Self {
            config,
            store,
            auth,
            rooms,
            presence,
            messages,
            coordinator,
        }
    }
}
