//! Connection Handles
//!
//! A handle is the hub's only view of a client: something with an identity
//! that a message can be sent to and that can be closed. Transport adapters
//! implement [`ConnectionHandle`]; [`ChannelHandle`] is an in-process
//! implementation backed by a bounded channel.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::SendError;
use super::message::Message;

/// Unique identity of a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(Uuid);

impl HandleId {
    /// Allocate a fresh identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One client's outbound channel, as seen by the hub
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Identity used for registry membership and removal
    fn id(&self) -> HandleId;

    /// Deliver a message to the client
    async fn send(&self, message: &Message) -> Result<(), SendError>;

    /// Close the underlying channel. Must be idempotent.
    async fn close(&self);
}

/// In-process handle backed by a bounded mpsc channel
///
/// `send` waits for channel capacity, so a receiver that stops reading
/// behaves like a slow network client. `close` also aborts a send that is
/// still waiting, so the receiver sees the channel end right away.
pub struct ChannelHandle {
    id: HandleId,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    closed: CancellationToken,
}

impl ChannelHandle {
    /// Create a handle and the receiving end its messages arrive on
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: HandleId::new(),
            sender: Mutex::new(Some(tx)),
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl ConnectionHandle for ChannelHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    async fn send(&self, message: &Message) -> Result<(), SendError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SendError::Closed)?;

        // Dropping the pending send releases its sender clone
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(SendError::Closed),
            result = sender.send(message.clone()) => result.map_err(|_| SendError::Closed),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
