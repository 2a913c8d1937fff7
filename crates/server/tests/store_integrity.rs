mod common;

use common::*;
use std::sync::Arc;
use teamchat_server::build_state;
use teamchat_server::core::config::RealtimeConfig;
use teamchat_server::core::models::MessageStatus;
use teamchat_server::core::store::{ChatStore, MessageWindow};
use tempfile::tempdir;

#[tokio::test]
async fn test_startup_marks_everyone_offline() {
    let dir = tempdir().unwrap();
    let database_url = format!("sqlite:{}", dir.path().join("chat.sqlite").display());

    let user_id = {
        // 1. A previous process left a user flagged online
        let store = ChatStore::open(&database_url).await.unwrap();
        let ann = user(&store, "Ann").await;
        store
            .set_presence(&ann.user_id, true, chrono::Utc::now())
            .await
            .unwrap();
        assert!(store.get_user(&ann.user_id).await.unwrap().unwrap().is_online);
        ann.user_id
    };

    // 2. Starting up reconciles the flag
    let state = build_state(RealtimeConfig {
        database_url,
        ..config()
    })
    .await
    .unwrap();
    let ann = state.store.get_user(&user_id).await.unwrap().unwrap();
    assert!(!ann.is_online);
}

#[tokio::test]
async fn test_messages_and_receipts_survive_reopen() {
    let dir = tempdir().unwrap();
    let database_url = format!("sqlite:{}", dir.path().join("chat.sqlite").display());

    let (conversation_id, message_id, reader) = {
        let store = Arc::new(ChatStore::open(&database_url).await.unwrap());
        let state = teamchat_server::core::AppState::new(
            config(),
            store.clone(),
            Arc::new(teamchat_server::realtime::push::LogPushNotifier),
        );
        let ann = user(&store, "Ann").await;
        let bob = user(&store, "Bob").await;
        let g = group(&store, &[&ann, &bob]).await;
        let message = state
            .messages
            .send_message(
                None,
                &ann,
                serde_json::from_value(serde_json::json!({
                    "conversationId": g,
                    "content": "durable"
                }))
                .unwrap(),
            )
            .await
            .unwrap();
        state
            .messages
            .mark_read(&bob.user_id, &message.id, &g)
            .await
            .unwrap();
        (g, message.id, bob.user_id)
    };

    let store = ChatStore::open(&database_url).await.unwrap();
    let history = store
        .page_messages(&conversation_id, MessageWindow::Latest { limit: 10, offset: 0 })
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, message_id);
    assert_eq!(history[0].status, MessageStatus::Read);
    let receipts = store.read_receipts(&message_id).await.unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].user_id, reader);
    // single reads leave the watermark alone
    assert_eq!(store.unread_count(&conversation_id, &reader).await.unwrap(), 1);
}
