//! HTTP routes for conversation history, unread counts and room presence.
//!
//! All routes sit behind [`mw_require_auth`] and accept the same bearer
//! credential as the socket handshake.

use axum::{
    extract::{Path, Query, State},
    middleware,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing::info;

use crate::core::auth::middleware::mw_require_auth;
use crate::core::config::AppState;
use crate::core::ctx::Ctx;
use crate::core::error::{Error, Result};
use crate::core::models::Message;
use crate::realtime::messages::HistoryQuery;
use crate::realtime::rooms::RoomKey;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub conversation_id: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadResponse {
    pub conversation_id: String,
    pub unread_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPresenceResponse {
    pub conversation_id: String,
    pub online_user_ids: Vec<String>,
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/conversations/{conversation_id}/messages", get(get_history))
        .route("/conversations/{conversation_id}/unread", get(get_unread))
        .route("/conversations/{conversation_id}/presence", get(get_room_presence))
        .route_layer(middleware::from_fn_with_state(state, mw_require_auth))
}

/// GET /conversations/{conversation_id}/messages
pub async fn get_history(
    ctx: Ctx,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>> {
    info!("GET /conversations/{}/messages", conversation_id);

    let messages = state
        .messages
        .history(ctx.user_id(), &conversation_id, &query)
        .await?;
    Ok(Json(HistoryResponse {
        conversation_id,
        messages,
    }))
}

/// GET /conversations/{conversation_id}/unread
pub async fn get_unread(
    ctx: Ctx,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<UnreadResponse>> {
    let unread_count = state
        .messages
        .unread_count(ctx.user_id(), &conversation_id)
        .await?;
    Ok(Json(UnreadResponse {
        conversation_id,
        unread_count,
    }))
}

/// GET /conversations/{conversation_id}/presence
pub async fn get_room_presence(
    ctx: Ctx,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<RoomPresenceResponse>> {
    if !state.store.is_member(&conversation_id, ctx.user_id()).await? {
        return Err(Error::access_denied("not a member of this conversation"));
    }

    let mut online_user_ids: Vec<String> = state
        .rooms
        .members_of(&RoomKey::conversation(conversation_id.clone()))
        .into_iter()
        .collect();
    online_user_ids.sort();

    Ok(Json(RoomPresenceResponse {
        conversation_id,
        online_user_ids,
    }))
}
