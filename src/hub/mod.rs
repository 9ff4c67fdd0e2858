//! Broadcast Hub
//!
//! The transport-independent core: every message published by any connection
//! is delivered to every connection registered at the time it is dequeued.
//!
//! ## Architecture
//!
//! - **Message**: the `{username, message}` unit clients exchange
//! - **ConnectionHandle**: what the hub needs from a client (send, close)
//! - **Registry**: the concurrency-safe set of live handles
//! - **BroadcastHub / Dispatcher**: the inbound queue and its single
//!   delivery loop
//! - **Ingress**: the per-connection read loop a transport plugs into
//!
//! ## Example
//!
//! ```rust,no_run
//! use chathub::hub::{BroadcastHub, ChannelHandle, HubConfig, Message};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), chathub::hub::HubError> {
//! let (hub, dispatcher) = BroadcastHub::new(HubConfig::default());
//! let cancel = CancellationToken::new();
//! tokio::spawn(dispatcher.run(cancel.clone()));
//!
//! let (handle, mut rx) = ChannelHandle::new(16);
//! hub.register(Arc::new(handle))?;
//! hub.publish(Message::new("alice", "hi"))?;
//!
//! assert_eq!(rx.recv().await, Some(Message::new("alice", "hi")));
//! cancel.cancel();
//! # Ok(())
//! # }
//! ```

mod broadcast;
mod error;
mod handle;
mod ingress;
mod message;
mod registry;

pub use broadcast::{BroadcastHub, Dispatcher, HubConfig, HubStats};
pub use error::{CodecError, HubError, HubResult, SendError};
pub use handle::{ChannelHandle, ConnectionHandle, HandleId};
pub use ingress::{run_ingress, DecodePolicy, Inbound, IngressOutcome, Registration};
pub use message::Message;
pub use registry::Registry;
