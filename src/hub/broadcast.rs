//! Broadcast Hub
//!
//! Owns the [`Registry`] and the inbound queue. Publishers enqueue messages
//! with [`BroadcastHub::publish`]; a single [`Dispatcher`] drains the queue
//! and fans every message out to a snapshot of the registry.
//!
//! Each send runs as its own task under a timeout, so one slow client costs
//! at most `send_timeout` per message. All sends for a message complete (or
//! fail) before the next message is dequeued, which keeps delivery FIFO for
//! every recipient.
//!
//! Closing a handle is bounded by the same timeout, so a peer that stopped
//! reading cannot hold a close open forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{HubError, HubResult, SendError};
use super::handle::{ConnectionHandle, HandleId};
use super::message::Message;
use super::registry::Registry;

/// Configuration for the broadcast hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long delivery waits on one recipient before dropping it
    pub send_timeout: Duration,
    /// Inbound queue bound (`None` = unbounded)
    pub queue_capacity: Option<usize>,
    /// Registry bound (`None` = unbounded)
    pub max_connections: Option<usize>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            queue_capacity: None,
            max_connections: None,
        }
    }
}

/// Point-in-time hub counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Currently registered connections
    pub connections: usize,
    /// Messages accepted by `publish`
    pub published: u64,
    /// Successful per-recipient sends
    pub delivered: u64,
    /// Failed or timed-out per-recipient sends
    pub send_failures: u64,
    /// Handles removed by the delivery loop after a failed send
    pub pruned: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    send_failures: AtomicU64,
    pruned: AtomicU64,
}

enum QueueSender {
    Bounded(mpsc::Sender<Message>),
    Unbounded(mpsc::UnboundedSender<Message>),
}

impl QueueSender {
    fn send(&self, message: Message) -> HubResult<()> {
        match self {
            QueueSender::Bounded(tx) => tx.try_send(message).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => HubError::CapacityExceeded("inbound queue"),
                mpsc::error::TrySendError::Closed(_) => HubError::Closed,
            }),
            QueueSender::Unbounded(tx) => tx.send(message).map_err(|_| HubError::Closed),
        }
    }
}

enum QueueReceiver {
    Bounded(mpsc::Receiver<Message>),
    Unbounded(mpsc::UnboundedReceiver<Message>),
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<Message> {
        match self {
            QueueReceiver::Bounded(rx) => rx.recv().await,
            QueueReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    fn close(&mut self) {
        match self {
            QueueReceiver::Bounded(rx) => rx.close(),
            QueueReceiver::Unbounded(rx) => rx.close(),
        }
    }
}

fn queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
        }
    }
}

/// Fan-out hub shared by every connection
pub struct BroadcastHub {
    registry: Registry,
    queue: QueueSender,
    counters: Counters,
    config: HubConfig,
}

impl BroadcastHub {
    /// Create a hub and the dispatcher that delivers its messages.
    ///
    /// Nothing is delivered until [`Dispatcher::run`] is polled.
    pub fn new(config: HubConfig) -> (Arc<Self>, Dispatcher) {
        let (queue, receiver) = queue(config.queue_capacity);
        let hub = Arc::new(Self {
            registry: Registry::new(config.max_connections),
            queue,
            counters: Counters::default(),
            config,
        });

        let dispatcher = Dispatcher {
            hub: Arc::clone(&hub),
            receiver,
        };
        (hub, dispatcher)
    }

    /// Add a handle to the set of delivery targets.
    ///
    /// The returned token is cancelled once the hub removes the handle, for
    /// whatever reason; the connection's reader should stop when it fires.
    pub fn register(&self, handle: Arc<dyn ConnectionHandle>) -> HubResult<CancellationToken> {
        let id = handle.id();
        let evicted = self.registry.register(handle)?;
        tracing::info!(handle_id = %id, connections = self.registry.len(), "Connection registered");
        Ok(evicted)
    }

    /// Remove a handle and close it. Returns false if it was not registered.
    pub async fn unregister(&self, id: HandleId) -> bool {
        match self.detach(id) {
            Some(handle) => {
                close_within(handle, self.config.send_timeout).await;
                true
            }
            None => false,
        }
    }

    /// Synchronous removal; the caller becomes responsible for closing.
    pub(crate) fn detach(&self, id: HandleId) -> Option<Arc<dyn ConnectionHandle>> {
        let handle = self.registry.remove(id)?;
        tracing::info!(handle_id = %id, connections = self.registry.len(), "Connection unregistered");
        Some(handle)
    }

    /// Enqueue a message for delivery to every registered connection
    pub fn publish(&self, message: Message) -> HubResult<()> {
        self.queue.send(message)?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Currently registered handles
    pub fn snapshot(&self) -> Vec<Arc<dyn ConnectionHandle>> {
        self.registry.snapshot()
    }

    /// Whether the hub has shut down
    pub fn is_closed(&self) -> bool {
        self.registry.is_closed()
    }

    pub fn is_registered(&self, id: HandleId) -> bool {
        self.registry.contains(id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.len(),
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            pruned: self.counters.pruned.load(Ordering::Relaxed),
        }
    }

    /// Send one message to every handle in a fresh snapshot
    async fn deliver(&self, message: Message) {
        let recipients = self.registry.snapshot();
        tracing::debug!(
            sender = %message.sender(),
            body = %message.body(),
            recipients = recipients.len(),
            "Broadcasting message"
        );
        if recipients.is_empty() {
            return;
        }

        let message = Arc::new(message);
        let send_timeout = self.config.send_timeout;

        let sends: Vec<_> = recipients
            .into_iter()
            .map(|handle| {
                let message = Arc::clone(&message);
                let task_handle = Arc::clone(&handle);
                let task = tokio::spawn(async move {
                    match tokio::time::timeout(send_timeout, task_handle.send(&message)).await {
                        Ok(result) => result,
                        Err(_) => Err(SendError::TimedOut(send_timeout)),
                    }
                });
                (handle, task)
            })
            .collect();

        // Tasks are already running; awaiting in order only collects results.
        for (handle, task) in sends {
            let result = task
                .await
                .unwrap_or_else(|e| Err(SendError::Transport(format!("send task failed: {}", e))));

            match result {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(handle_id = %handle.id(), error = %e, "Send failed, dropping connection");
                    self.prune(handle.id());
                }
            }
        }
    }

    fn prune(&self, id: HandleId) {
        // The reader side may have removed it already
        if let Some(handle) = self.detach(id) {
            self.counters.pruned.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(close_within(handle, self.config.send_timeout));
        }
    }

    async fn close_all(&self) {
        let handles = self.registry.close();
        let count = handles.len();
        let send_timeout = self.config.send_timeout;

        let closes = handles
            .into_iter()
            .map(|handle| close_within(handle, send_timeout));
        futures_util::future::join_all(closes).await;

        tracing::info!(closed = count, "Closed all connections");
    }
}

/// Close a handle, giving up after `limit`
pub(crate) async fn close_within(handle: Arc<dyn ConnectionHandle>, limit: Duration) {
    if tokio::time::timeout(limit, handle.close()).await.is_err() {
        tracing::warn!(handle_id = %handle.id(), "Close timed out");
    }
}

/// The hub's single delivery loop
pub struct Dispatcher {
    hub: Arc<BroadcastHub>,
    receiver: QueueReceiver,
}

impl Dispatcher {
    /// Deliver messages until `cancel` fires.
    ///
    /// On cancellation the inbound queue is closed (later `publish` calls get
    /// [`HubError::Closed`]), every message already queued is still
    /// delivered, then all registered connections are closed.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("Delivery loop started");

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = self.receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.hub.deliver(message).await;
        }

        self.receiver.close();
        let mut drained = 0usize;
        while let Some(message) = self.receiver.recv().await {
            self.hub.deliver(message).await;
            drained += 1;
        }
        tracing::info!(drained, "Delivery loop stopping");

        self.hub.close_all().await;
    }
}
