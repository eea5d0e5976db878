//! Client for the action monitor event service.
//!
//! The crate is organized by concern:
//! - `stream`: websocket engine with request correlation, subscription
//!   tracking, and supervised reconnection.
//! - `config`: connection, keepalive, and reconnection options.
//! - `retry`: shared timeout and reconnection pacing utilities.

/// Listener configuration and defaults.
pub mod config;
/// Timeout and reconnection pacing helpers used across the engine.
pub mod retry;
/// Event stream engine, protocol types, and subscription state.
pub mod stream;

pub use config::{ListenerConfig, ListenerDefaults};
pub use stream::client::{EventListener, EventListenerClient, ListenerError};
pub use stream::proto::{Event, EventMessage, EventType, Method};
pub use stream::supervisor::ConnectionState;
