//! Teamchat Realtime Server Library
//!
//! Message delivery, read receipts and presence for team conversations,
//! served over WebSocket with a small authenticated HTTP surface.

pub mod core;
pub mod realtime;

use axum::{routing::get, Router};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::core::config::{AppState, RealtimeConfig};
use crate::core::store::ChatStore;
use crate::realtime::presence::PresenceTasks;
use crate::realtime::push::{LogPushNotifier, PushNotifier, WebhookPushNotifier};
use crate::realtime::socket::ws_handler;

/// Opens the store, reconciles stale presence and wires every component.
pub async fn build_state(config: RealtimeConfig) -> anyhow::Result<AppState> {
    let store = Arc::new(ChatStore::open(&config.database_url).await?);
    info!("ChatStore opened at {}", config.database_url);

    // No connection can be live yet, so every online flag is stale.
    let reset = store.reset_presence().await?;
    if reset > 0 {
        info!("[Presence] Marked {} user(s) offline at startup", reset);
    }

    let push: Arc<dyn PushNotifier> = match &config.push_webhook_url {
        Some(url) => {
            info!("[Push] Dispatching to webhook {}", url);
            Arc::new(WebhookPushNotifier::new(url.clone()))
        }
        None => {
            warn!("[Push] PUSH_WEBHOOK_URL not set, push notifications are only logged");
            Arc::new(LogPushNotifier)
        }
    };

    Ok(AppState::new(config, store, push))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .merge(realtime::router(state.clone()))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

pub async fn run() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("teamchat_server=info,tower_http=info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        // Already set, ignore
    }

    info!("=== Teamchat Realtime Server ===");

    let config = RealtimeConfig::from_env()?;
    let state = build_state(config.clone()).await?;

    let _presence_tasks = PresenceTasks::spawn(
        state.presence.clone(),
        config.heartbeat_interval,
        config.sweep_interval,
    );
    info!(
        "[Presence] Heartbeat every {:?}, sweep every {:?} (stale after {:?})",
        config.heartbeat_interval, config.sweep_interval, config.stale_after
    );

    let app = app(state);

    info!("Listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK - Teamchat Realtime Server"
}
