//! WebSocket Connection Handle
//!
//! Adapts the write half of a WebSocket to the hub's [`ConnectionHandle`].

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt};
use tokio::sync::Mutex;

use crate::hub::{ConnectionHandle, HandleId, Message, SendError};

/// Connection handle over a WebSocket write half
///
/// Messages go out as JSON text frames. The sink is behind an async mutex so
/// a close can follow an in-flight send without interleaving frames.
pub struct WebSocketHandle<S = SplitSink<WebSocket, WsMessage>> {
    id: HandleId,
    sink: Mutex<S>,
    closed: AtomicBool,
}

impl<S> WebSocketHandle<S> {
    pub fn new(sink: S) -> Self {
        Self {
            id: HandleId::new(),
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl<S> ConnectionHandle for WebSocketHandle<S>
where
    S: Sink<WsMessage> + Unpin + Send + 'static,
    S::Error: Display,
{
    fn id(&self) -> HandleId {
        self.id
    }

    async fn send(&self, message: &Message) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let text = message.encode()?;

        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(text))
            .await
            .map_err(|e| SendError::Transport(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(WsMessage::Close(None)).await {
            tracing::debug!(handle_id = %self.id, error = %e, "Close frame not sent");
        }
        let _ = sink.close().await;
    }
}
