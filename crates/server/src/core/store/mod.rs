//! Durable store
//!
//! SQLite-backed source of truth for users, conversations, memberships,
//! messages and read receipts.

pub mod sqlite_store;

pub use sqlite_store::{ChatStore, MessageCursor, MessageWindow, NewMessage};
