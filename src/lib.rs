//! # Chathub
//!
//! Real-time chat fan-out hub - accepts many concurrent WebSocket clients and
//! rebroadcasts every message any of them sends to all of them.
//!
//! ## Features
//!
//! - **Safe concurrent registry**: connections come and go while broadcasts
//!   are in flight without lost updates or stale entries
//! - **Isolated delivery**: every send runs as its own task under a timeout,
//!   so one slow client cannot stall the others
//! - **Self-healing**: a failed read or write removes only that connection
//! - **Graceful shutdown**: queued messages are drained before connections
//!   are closed
//!
//! ## Modules
//!
//! - [`hub`]: Transport-independent broadcast core
//! - [`websocket`]: axum WebSocket adapter
//! - [`api`]: HTTP server, health endpoints and CORS
//! - [`config`]: TOML + environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chathub::hub::{BroadcastHub, ChannelHandle, HubConfig, Message};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (hub, dispatcher) = BroadcastHub::new(HubConfig::default());
//!     let cancel = CancellationToken::new();
//!     let delivery = tokio::spawn(dispatcher.run(cancel.clone()));
//!
//!     // Any ConnectionHandle can join; WebSockets use WebSocketHandle
//!     let (handle, mut rx) = ChannelHandle::new(16);
//!     hub.register(Arc::new(handle))?;
//!
//!     hub.publish(Message::new("alice", "hi"))?;
//!     println!("Received {:?}", rx.recv().await);
//!
//!     // Graceful shutdown
//!     cancel.cancel();
//!     delivery.await?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod hub;
pub mod websocket;

// Re-export top-level types for convenience
pub use hub::{
    run_ingress, BroadcastHub, ChannelHandle, CodecError, ConnectionHandle, DecodePolicy,
    Dispatcher, HandleId, HubConfig, HubError, HubResult, HubStats, Inbound, IngressOutcome,
    Message, Registration, Registry, SendError,
};

pub use api::{build_router, serve, serve_with_listener, ApiError, AppState};

pub use websocket::{websocket_handler, WebSocketHandle};

pub use config::{Config, ConfigError, HubSettings, LoggingConfig, ServerConfig};
