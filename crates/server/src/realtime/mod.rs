//! Realtime Service Layer
//!
//! Live connections, rooms, presence and the message pipeline, plus the
//! WebSocket and HTTP surfaces that expose them.

pub mod events;
pub mod handlers;
pub mod lifecycle;
pub mod messages;
pub mod presence;
pub mod push;
pub mod rooms;
pub mod socket;

pub use handlers::router;
