//! Core Service Layer
//!
//! Shared infrastructure for the realtime server: configuration, errors,
//! data models, the durable store and authentication.

pub mod auth;
pub mod config;
pub mod ctx;
pub mod error;
pub mod models;
pub mod store;

// Re-exports for convenience
pub use config::{AppState, RealtimeConfig};
pub use ctx::Ctx;
pub use error::{Error, Result};
