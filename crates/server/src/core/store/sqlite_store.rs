//! SQLite chat store
//!
//! All timestamps are stored as epoch milliseconds. Messages carry an
//! autoincrement `seq` so rows created in the same millisecond still have a
//! stable order that matches insertion order.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::core::error::{Error, Result};
use crate::core::models::{
    from_millis, Conversation, ConversationMember, ConversationType, Message, MessageStatus,
    MessageType, ReadReceipt, User,
};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, type, media_url, status, \
                               deleted, created_at, updated_at";

/// Position of a message in its conversation's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCursor {
    pub created_at_ms: i64,
    pub seq: i64,
}

/// Slice of a conversation's history to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageWindow {
    /// Most recent messages, skipping `offset` newer ones.
    Latest { limit: i64, offset: i64 },
    /// Messages strictly older than the cursor, newest first.
    Before { cursor: MessageCursor, limit: i64 },
    /// Messages strictly newer than the cursor, oldest first.
    After { cursor: MessageCursor, limit: i64 },
}

/// Input for [`ChatStore::insert_message`]
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub media_url: Option<String>,
}

pub struct ChatStore {
    pool: SqlitePool,
}

impl ChatStore {
    /// Open (creating if missing) the database at `database_url`.
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool).await?;
        info!("[Store] Opened {}", database_url);
        Ok(store)
    }

    /// Private in-memory database. A single pooled connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init_db().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY NOT NULL,
                email TEXT UNIQUE NOT NULL,
                display_name TEXT NOT NULL,
                is_online INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY NOT NULL,
                type TEXT NOT NULL,
                name TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_members (
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                last_read_at INTEGER,
                last_read_seq INTEGER,
                PRIMARY KEY (conversation_id, user_id),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                content TEXT NOT NULL,
                type TEXT NOT NULL DEFAULT 'text',
                media_url TEXT,
                status TEXT NOT NULL DEFAULT 'sent',
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
                FOREIGN KEY (sender_id) REFERENCES users(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_history
             ON messages (conversation_id, created_at, seq)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS read_receipts (
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                read_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id),
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub async fn create_user(&self, email: &str, display_name: &str) -> Result<User> {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            display_name: display_name.to_string(),
            is_online: false,
            last_seen: now,
        };

        sqlx::query(
            "INSERT INTO users (id, email, display_name, is_online, last_seen, created_at)
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, email, display_name, is_online, last_seen FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| user_from_row(&r)).transpose()
    }

    /// Sets the online flag. `last_seen` never moves backwards.
    pub async fn set_presence(
        &self,
        user_id: &str,
        is_online: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE users SET is_online = ?, last_seen = MAX(last_seen, ?) WHERE id = ?",
        )
        .bind(is_online)
        .bind(at.timestamp_millis())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refreshes `last_seen` for a batch of connected users.
    pub async fn touch_last_seen(&self, user_ids: &[String], at: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut touched = 0;
        for user_id in user_ids {
            touched += sqlx::query(
                "UPDATE users SET last_seen = MAX(last_seen, ?) WHERE id = ?",
            )
            .bind(at.timestamp_millis())
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(touched)
    }

    /// Users flagged online whose last heartbeat is older than `cutoff`.
    pub async fn stale_online_users(&self, cutoff: DateTime<Utc>) -> Result<Vec<User>> {
        let rows = sqlx::query(
            "SELECT id, email, display_name, is_online, last_seen FROM users
             WHERE is_online = 1 AND last_seen < ?",
        )
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(user_from_row).collect()
    }

    /// Marks every user offline. Run once at startup, when no connection
    /// can be live yet.
    pub async fn reset_presence(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE users SET is_online = 0 WHERE is_online = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Conversations and membership
    // ------------------------------------------------------------------

    pub async fn create_conversation(
        &self,
        conversation_type: ConversationType,
        name: Option<&str>,
        member_ids: &[String],
    ) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            conversation_type,
            name: name.map(str::to_string),
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO conversations (id, type, name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&conversation.id)
        .bind(conversation_type.as_str())
        .bind(&conversation.name)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        for user_id in member_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id, joined_at)
                 VALUES (?, ?, ?)",
            )
            .bind(&conversation.id)
            .bind(user_id)
            .bind(now.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(conversation)
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, type, name, created_at, updated_at FROM conversations WHERE id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| conversation_from_row(&r)).transpose()
    }

    /// Adds a member. Adding an existing member is a no-op.
    pub async fn add_member(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<ConversationMember> {
        sqlx::query(
            "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id, joined_at)
             VALUES (?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        self.get_member(conversation_id, user_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("conversation {}", conversation_id)))
    }

    pub async fn get_member(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<ConversationMember>> {
        let row: Option<(String, String, i64, Option<i64>)> = sqlx::query_as(
            "SELECT conversation_id, user_id, joined_at, last_read_at
             FROM conversation_members WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(conversation_id, user_id, joined_at, last_read_at)| ConversationMember {
                conversation_id,
                user_id,
                joined_at: from_millis(joined_at),
                last_read_at: last_read_at.map(from_millis),
            },
        ))
    }

    pub async fn is_member(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        Ok(self.get_member(conversation_id, user_id).await?.is_some())
    }

    pub async fn member_ids(&self, conversation_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM conversation_members WHERE conversation_id = ? ORDER BY joined_at",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn conversation_ids_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT conversation_id FROM conversation_members WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Counterparts of every direct conversation the user is in.
    pub async fn direct_contact_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT other.user_id
            FROM conversation_members me
            JOIN conversations c ON c.id = me.conversation_id AND c.type = 'direct'
            JOIN conversation_members other
              ON other.conversation_id = me.conversation_id AND other.user_id != me.user_id
            WHERE me.user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Persists a message with status `sent` and bumps the conversation's
    /// `updated_at` in the same transaction.
    pub async fn insert_message(&self, new: NewMessage) -> Result<Message> {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            content: new.content,
            message_type: new.message_type,
            media_url: new.media_url,
            status: MessageStatus::Sent,
            deleted: false,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO messages
             (id, conversation_id, sender_id, content, type, media_url, status, deleted, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.sender_id)
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(&message.media_url)
        .bind(message.status.as_str())
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at = MAX(updated_at, ?) WHERE id = ?")
            .bind(now.timestamp_millis())
            .bind(&message.conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(message)
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM messages WHERE id = ?",
            MESSAGE_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| message_from_row(&r)).transpose()
    }

    /// Resolves a message id to its history position within a conversation.
    pub async fn message_cursor(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Option<MessageCursor>> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT created_at, seq FROM messages WHERE id = ? AND conversation_id = ?",
        )
        .bind(message_id)
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(created_at_ms, seq)| MessageCursor { created_at_ms, seq }))
    }

    /// Loads a window of history. Always returned oldest first.
    pub async fn page_messages(
        &self,
        conversation_id: &str,
        window: MessageWindow,
    ) -> Result<Vec<Message>> {
        let rows = match window {
            MessageWindow::Latest { limit, offset } => {
                sqlx::query(&format!(
                    "SELECT {} FROM messages WHERE conversation_id = ?
                     ORDER BY created_at DESC, seq DESC LIMIT ? OFFSET ?",
                    MESSAGE_COLUMNS
                ))
                .bind(conversation_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            MessageWindow::Before { cursor, limit } => {
                sqlx::query(&format!(
                    "SELECT {} FROM messages WHERE conversation_id = ?
                     AND (created_at < ? OR (created_at = ? AND seq < ?))
                     ORDER BY created_at DESC, seq DESC LIMIT ?",
                    MESSAGE_COLUMNS
                ))
                .bind(conversation_id)
                .bind(cursor.created_at_ms)
                .bind(cursor.created_at_ms)
                .bind(cursor.seq)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            MessageWindow::After { cursor, limit } => {
                sqlx::query(&format!(
                    "SELECT {} FROM messages WHERE conversation_id = ?
                     AND (created_at > ? OR (created_at = ? AND seq > ?))
                     ORDER BY created_at ASC, seq ASC LIMIT ?",
                    MESSAGE_COLUMNS
                ))
                .bind(conversation_id)
                .bind(cursor.created_at_ms)
                .bind(cursor.created_at_ms)
                .bind(cursor.seq)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        if !matches!(window, MessageWindow::After { .. }) {
            messages.reverse();
        }
        Ok(messages)
    }

    /// Moves a message to `to` only if its current status is one of `from`.
    /// Returns whether this call performed the transition.
    pub async fn transition_status(
        &self,
        message_id: &str,
        from: &[MessageStatus],
        to: MessageStatus,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE messages SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(message_id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Overwrites the content of a message and flags it deleted.
    pub async fn soft_delete_message(&self, message_id: &str, tombstone: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET content = ?, media_url = NULL, deleted = 1, updated_at = ?
             WHERE id = ? AND deleted = 0",
        )
        .bind(tombstone)
        .bind(Utc::now().timestamp_millis())
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ------------------------------------------------------------------
    // Read receipts
    // ------------------------------------------------------------------

    /// Creates the receipt, or refreshes `read_at` if it already exists.
    pub async fn upsert_read_receipt(
        &self,
        message_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<ReadReceipt> {
        sqlx::query(
            "INSERT INTO read_receipts (message_id, user_id, read_at) VALUES (?, ?, ?)
             ON CONFLICT (message_id, user_id) DO UPDATE SET read_at = excluded.read_at",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(ReadReceipt {
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            read_at: from_millis(at.timestamp_millis()),
        })
    }

    pub async fn read_receipts(&self, message_id: &str) -> Result<Vec<ReadReceipt>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT message_id, user_id, read_at FROM read_receipts WHERE message_id = ?
             ORDER BY read_at",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(message_id, user_id, read_at)| ReadReceipt {
                message_id,
                user_id,
                read_at: from_millis(read_at),
            })
            .collect())
    }

    /// True when every member except the sender holds a receipt.
    pub async fn read_by_all_recipients(&self, message: &Message) -> Result<bool> {
        let (missing,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM conversation_members cm
            WHERE cm.conversation_id = ? AND cm.user_id != ?
              AND NOT EXISTS (
                SELECT 1 FROM read_receipts r
                WHERE r.message_id = ? AND r.user_id = cm.user_id
              )
            "#,
        )
        .bind(&message.conversation_id)
        .bind(&message.sender_id)
        .bind(&message.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(missing == 0)
    }

    /// Creates receipts for every unread message from other senders up to
    /// `up_to` (inclusive, or the latest message), and advances the member's
    /// watermark to that message's cursor. Returns the newly read message ids.
    pub async fn mark_all_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        up_to: Option<MessageCursor>,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let up_to = match up_to {
            Some(cursor) => Some(cursor),
            None => sqlx::query_as::<_, (i64, i64)>(
                "SELECT created_at, seq FROM messages WHERE conversation_id = ?
                 ORDER BY created_at DESC, seq DESC LIMIT 1",
            )
            .bind(conversation_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|(created_at_ms, seq)| MessageCursor { created_at_ms, seq }),
        };
        let Some(cursor) = up_to else {
            tx.commit().await?;
            return Ok(Vec::new());
        };

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT m.id FROM messages m
            WHERE m.conversation_id = ? AND m.sender_id != ?
              AND NOT EXISTS (
                SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.user_id = ?
              )
              AND (m.created_at < ? OR (m.created_at = ? AND m.seq <= ?))
            ORDER BY m.seq
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(user_id)
        .bind(cursor.created_at_ms)
        .bind(cursor.created_at_ms)
        .bind(cursor.seq)
        .fetch_all(&mut *tx)
        .await?;

        let message_ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        for message_id in &message_ids {
            sqlx::query(
                "INSERT INTO read_receipts (message_id, user_id, read_at) VALUES (?, ?, ?)
                 ON CONFLICT (message_id, user_id) DO UPDATE SET read_at = excluded.read_at",
            )
            .bind(message_id)
            .bind(user_id)
            .bind(at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        // The watermark only moves forward
        sqlx::query(
            "UPDATE conversation_members SET last_read_at = ?, last_read_seq = ?
             WHERE conversation_id = ? AND user_id = ?
               AND (last_read_at IS NULL OR last_read_at < ?
                    OR (last_read_at = ? AND COALESCE(last_read_seq, 0) < ?))",
        )
        .bind(cursor.created_at_ms)
        .bind(cursor.seq)
        .bind(conversation_id)
        .bind(user_id)
        .bind(cursor.created_at_ms)
        .bind(cursor.created_at_ms)
        .bind(cursor.seq)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message_ids)
    }

    /// Messages from other members positioned after the member's watermark.
    pub async fn unread_count(&self, conversation_id: &str, user_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages m
            JOIN conversation_members cm
              ON cm.conversation_id = m.conversation_id AND cm.user_id = ?
            WHERE m.conversation_id = ? AND m.sender_id != ?
              AND (m.created_at > COALESCE(cm.last_read_at, 0)
                   OR (m.created_at = cm.last_read_at AND m.seq > COALESCE(cm.last_read_seq, 0)))
            "#,
        )
        .bind(user_id)
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

fn decode_err(msg: String) -> Error {
    Error::TransientStore(sqlx::Error::Decode(msg.into()))
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        is_online: row.try_get("is_online")?,
        last_seen: from_millis(row.try_get("last_seen")?),
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let kind: String = row.try_get("type")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        conversation_type: kind.parse().map_err(decode_err)?,
        name: row.try_get("name")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let kind: String = row.try_get("type")?;
    let status: String = row.try_get("status")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        content: row.try_get("content")?,
        message_type: kind.parse().map_err(decode_err)?,
        media_url: row.try_get("media_url")?,
        status: status.parse().map_err(decode_err)?,
        deleted: row.try_get("deleted")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seeded() -> (ChatStore, User, User, Conversation) {
        let store = ChatStore::in_memory().await.unwrap();
        let alice = store.create_user("alice@example.com", "Alice").await.unwrap();
        let bob = store.create_user("bob@example.com", "Bob").await.unwrap();
        let conv = store
            .create_conversation(
                ConversationType::Direct,
                None,
                &[alice.id.clone(), bob.id.clone()],
            )
            .await
            .unwrap();
        (store, alice, bob, conv)
    }

    fn text(conv: &Conversation, sender: &User, content: &str) -> NewMessage {
        NewMessage {
            conversation_id: conv.id.clone(),
            sender_id: sender.id.clone(),
            content: content.to_string(),
            message_type: MessageType::Text,
            media_url: None,
        }
    }

    #[tokio::test]
    async fn test_insert_message_bumps_conversation() {
        let (store, alice, _bob, conv) = seeded().await;
        let msg = store.insert_message(text(&conv, &alice, "hi")).await.unwrap();

        assert_eq!(msg.status, MessageStatus::Sent);
        let reloaded = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert!(reloaded.updated_at >= from_millis(msg.created_at.timestamp_millis()));

        let fetched = store.get_message(&msg.id).await.unwrap().unwrap();
        assert_eq!(fetched.content, "hi");
        assert_eq!(fetched.sender_id, alice.id);
    }

    #[tokio::test]
    async fn test_receipt_upsert_refreshes_timestamp() {
        let (store, alice, bob, conv) = seeded().await;
        let msg = store.insert_message(text(&conv, &alice, "hi")).await.unwrap();

        let first = Utc::now();
        let second = first + Duration::seconds(5);
        store.upsert_read_receipt(&msg.id, &bob.id, first).await.unwrap();
        store.upsert_read_receipt(&msg.id, &bob.id, second).await.unwrap();

        let receipts = store.read_receipts(&msg.id).await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].read_at.timestamp_millis(), second.timestamp_millis());
    }

    #[tokio::test]
    async fn test_transition_status_is_conditional() {
        let (store, alice, _bob, conv) = seeded().await;
        let msg = store.insert_message(text(&conv, &alice, "hi")).await.unwrap();

        let from = [MessageStatus::Sent, MessageStatus::Delivered];
        assert!(store
            .transition_status(&msg.id, &from, MessageStatus::Read)
            .await
            .unwrap());
        assert!(!store
            .transition_status(&msg.id, &from, MessageStatus::Read)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_direct_contacts_and_membership() {
        let (store, alice, bob, conv) = seeded().await;
        let carol = store.create_user("carol@example.com", "Carol").await.unwrap();
        store
            .create_conversation(
                ConversationType::Group,
                Some("team"),
                &[alice.id.clone(), carol.id.clone()],
            )
            .await
            .unwrap();

        assert_eq!(store.direct_contact_ids(&alice.id).await.unwrap(), vec![bob.id.clone()]);
        assert!(store.is_member(&conv.id, &bob.id).await.unwrap());
        assert!(!store.is_member(&conv.id, &carol.id).await.unwrap());
        assert_eq!(store.conversation_ids_for_user(&alice.id).await.unwrap().len(), 2);

        // re-adding is a no-op
        store.add_member(&conv.id, &bob.id).await.unwrap();
        assert_eq!(store.member_ids(&conv.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_watermark_splits_same_millisecond_messages() {
        let (store, alice, bob, conv) = seeded().await;
        let first = store.insert_message(text(&conv, &alice, "one")).await.unwrap();
        let second = store.insert_message(text(&conv, &alice, "two")).await.unwrap();
        store.insert_message(text(&conv, &alice, "three")).await.unwrap();
        sqlx::query("UPDATE messages SET created_at = 1700000000000")
            .execute(store.pool())
            .await
            .unwrap();

        let up_to = store.message_cursor(&conv.id, &second.id).await.unwrap();
        let read = store
            .mark_all_read(&conv.id, &bob.id, up_to, Utc::now())
            .await
            .unwrap();
        assert_eq!(read, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(store.unread_count(&conv.id, &bob.id).await.unwrap(), 1);

        // An older cursor does not pull the watermark back
        let back = store.message_cursor(&conv.id, &first.id).await.unwrap();
        store
            .mark_all_read(&conv.id, &bob.id, back, Utc::now())
            .await
            .unwrap();
        assert_eq!(store.unread_count(&conv.id, &bob.id).await.unwrap(), 1);

        let rest = store
            .mark_all_read(&conv.id, &bob.id, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(store.unread_count(&conv.id, &bob.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_presence_columns() {
        let (store, alice, _bob, _conv) = seeded().await;
        let later = Utc::now() + Duration::seconds(10);
        store.set_presence(&alice.id, true, later).await.unwrap();
        // an older timestamp must not move last_seen backwards
        store
            .set_presence(&alice.id, true, later - Duration::seconds(60))
            .await
            .unwrap();

        let user = store.get_user(&alice.id).await.unwrap().unwrap();
        assert!(user.is_online);
        assert_eq!(user.last_seen.timestamp_millis(), later.timestamp_millis());

        let stale = store
            .stale_online_users(later + Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);

        assert_eq!(store.reset_presence().await.unwrap(), 1);
        assert!(!store.get_user(&alice.id).await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("chat.sqlite").display());

        let user_id = {
            let store = ChatStore::open(&url).await.unwrap();
            let user = store.create_user("dana@example.com", "Dana").await.unwrap();
            store.pool().close().await;
            user.id
        };

        let store = ChatStore::open(&url).await.unwrap();
        let user = store.get_user(&user_id).await.unwrap().unwrap();
        assert_eq!(user.display_name, "Dana");
    }
}
