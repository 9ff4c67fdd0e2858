//! Ingress Adapter
//!
//! Per-connection read loop, independent of the transport. A transport turns
//! its read half into a stream of [`Inbound`] frames and calls
//! [`run_ingress`], which registers the connection, publishes every decoded
//! message and unregisters on every exit path.
//!
//! The loop also ends when the hub drops the handle on its own (a failed
//! delivery or shutdown): a client that can no longer receive does not get
//! to keep publishing.

use std::fmt::Display;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::broadcast::{close_within, BroadcastHub};
use super::error::{HubError, HubResult};
use super::handle::{ConnectionHandle, HandleId};
use super::message::Message;

/// One unit read from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text payload expected to hold an encoded [`Message`]
    Text(String),
    /// The client asked to close
    Close,
    /// Anything else (keepalives, binary frames); ignored
    Other,
}

/// What to do with a payload that does not decode into a [`Message`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// Drop the connection
    #[default]
    Disconnect,
    /// Drop the payload and keep reading
    Skip,
}

/// Why an ingress loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Stream ended or the client sent a close
    ClientClosed,
    /// The transport reported a read error
    ReadFailed(String),
    /// A payload failed to decode under [`DecodePolicy::Disconnect`]
    DecodeFailed,
    /// The hub shut down
    HubClosed,
    /// The hub dropped the handle after a failed delivery
    Evicted,
    /// The hub refused the registration
    Rejected(HubError),
}

/// Scoped registration of one handle with the hub.
///
/// Dropping it without calling [`Registration::release`] still removes the
/// handle and schedules its close, so an aborted or panicking reader never
/// leaves a stale registry entry.
pub struct Registration {
    hub: Arc<BroadcastHub>,
    id: HandleId,
    evicted: CancellationToken,
    released: bool,
}

impl Registration {
    pub fn new(hub: Arc<BroadcastHub>, handle: Arc<dyn ConnectionHandle>) -> HubResult<Self> {
        let id = handle.id();
        let evicted = hub.register(handle)?;
        Ok(Self {
            hub,
            id,
            evicted,
            released: false,
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Whether the hub has already removed the handle
    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Resolves once the hub removes the handle
    pub async fn evicted(&self) {
        self.evicted.cancelled().await
    }

    /// Unregister and wait for the handle to close
    pub async fn release(mut self) {
        self.released = true;
        self.hub.unregister(self.id).await;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(handle) = self.hub.detach(self.id) {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(close_within(handle, self.hub.config().send_timeout));
                }
                Err(_) => {
                    tracing::warn!(handle_id = %self.id, "No runtime to close connection on drop");
                }
            }
        }
    }
}

/// Run the read loop for one connection until it ends
pub async fn run_ingress<S, E>(
    hub: Arc<BroadcastHub>,
    handle: Arc<dyn ConnectionHandle>,
    mut inbound: S,
    policy: DecodePolicy,
) -> IngressOutcome
where
    S: Stream<Item = Result<Inbound, E>> + Unpin,
    E: Display,
{
    let registration = match Registration::new(Arc::clone(&hub), Arc::clone(&handle)) {
        Ok(registration) => registration,
        Err(e) => {
            tracing::warn!(handle_id = %handle.id(), error = %e, "Connection rejected");
            close_within(handle, hub.config().send_timeout).await;
            return IngressOutcome::Rejected(e);
        }
    };
    let id = registration.id();

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = registration.evicted() => None,
            next = inbound.next() => Some(next),
        };
        // A frame that raced with eviction is dropped as well
        let next = match next {
            Some(next) if !registration.is_evicted() => next,
            _ if hub.is_closed() => break IngressOutcome::HubClosed,
            _ => break IngressOutcome::Evicted,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::debug!(handle_id = %id, error = %e, "Read failed");
                break IngressOutcome::ReadFailed(e.to_string());
            }
            None => break IngressOutcome::ClientClosed,
        };

        match frame {
            Inbound::Text(text) => match Message::decode(&text) {
                Ok(message) => match hub.publish(message) {
                    Ok(()) => {}
                    Err(HubError::Closed) => break IngressOutcome::HubClosed,
                    Err(e) => {
                        tracing::warn!(handle_id = %id, error = %e, "Message rejected");
                    }
                },
                Err(e) => {
                    tracing::warn!(handle_id = %id, error = %e, "Invalid message");
                    if policy == DecodePolicy::Disconnect {
                        break IngressOutcome::DecodeFailed;
                    }
                }
            },
            Inbound::Close => break IngressOutcome::ClientClosed,
            Inbound::Other => {}
        }
    };

    tracing::debug!(handle_id = %id, outcome = ?outcome, "Ingress finished");
    registration.release().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::broadcast::HubConfig;
    use crate::hub::handle::ChannelHandle;
    use futures_util::stream::{self, BoxStream};
    use std::io;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn text(message: &Message) -> Result<Inbound, io::Error> {
        Ok(Inbound::Text(message.encode().unwrap()))
    }

    fn raw(payload: &str) -> Result<Inbound, io::Error> {
        Ok(Inbound::Text(payload.to_string()))
    }

    fn running_hub(config: HubConfig) -> (Arc<BroadcastHub>, CancellationToken) {
        let (hub, dispatcher) = BroadcastHub::new(config);
        let cancel = CancellationToken::new();
        tokio::spawn(dispatcher.run(cancel.clone()));
        (hub, cancel)
    }

    /// A second registered client that observes everything broadcast
    fn observer(hub: &BroadcastHub) -> tokio::sync::mpsc::Receiver<Message> {
        let (handle, rx) = ChannelHandle::new(64);
        hub.register(Arc::new(handle)).unwrap();
        rx
    }

    /// Inbound stream fed frame by frame from the test
    fn frame_feed() -> (
        mpsc::UnboundedSender<Result<Inbound, io::Error>>,
        BoxStream<'static, Result<Inbound, io::Error>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let frames = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        (tx, frames.boxed())
    }

    async fn recv(rx: &mut tokio::sync::mpsc::Receiver<Message>) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_messages_are_published_and_handle_released() {
        let (hub, cancel) = running_hub(HubConfig::default());
        let mut rx = observer(&hub);
        let (handle, _own_rx) = ChannelHandle::new(64);
        let handle = Arc::new(handle);

        let frames = stream::iter(vec![
            text(&Message::new("alice", "hi")),
            Ok(Inbound::Other),
            text(&Message::new("alice", "again")),
        ]);
        let outcome =
            run_ingress(Arc::clone(&hub), handle.clone(), frames, DecodePolicy::default()).await;

        assert_eq!(outcome, IngressOutcome::ClientClosed);
        assert_eq!(recv(&mut rx).await, Some(Message::new("alice", "hi")));
        assert_eq!(recv(&mut rx).await, Some(Message::new("alice", "again")));
        assert!(!hub.is_registered(handle.id()));
        assert!(handle.is_closed());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_close_frame_stops_reading() {
        let (hub, cancel) = running_hub(HubConfig::default());
        let mut rx = observer(&hub);
        let (handle, _own_rx) = ChannelHandle::new(64);

        let frames = stream::iter(vec![
            Ok(Inbound::Close),
            text(&Message::new("alice", "after close")),
        ]);
        let outcome =
            run_ingress(Arc::clone(&hub), Arc::new(handle), frames, DecodePolicy::default()).await;

        assert_eq!(outcome, IngressOutcome::ClientClosed);
        assert_eq!(hub.connection_count(), 1);
        assert!(rx.try_recv().is_err());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_read_error_unregisters() {
        let (hub, cancel) = running_hub(HubConfig::default());
        let (handle, _own_rx) = ChannelHandle::new(64);
        let handle = Arc::new(handle);

        let frames = stream::iter(vec![
            text(&Message::new("alice", "hi")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let outcome =
            run_ingress(Arc::clone(&hub), handle.clone(), frames, DecodePolicy::default()).await;

        assert!(matches!(outcome, IngressOutcome::ReadFailed(ref e) if e.contains("reset")));
        assert!(!hub.is_registered(handle.id()));
        assert!(handle.is_closed());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_decode_error_disconnects_by_default() {
        let (hub, cancel) = running_hub(HubConfig::default());
        let mut rx = observer(&hub);
        let (handle, _own_rx) = ChannelHandle::new(64);
        let handle = Arc::new(handle);

        let frames = stream::iter(vec![
            raw("not json"),
            text(&Message::new("alice", "never sent")),
        ]);
        let outcome =
            run_ingress(Arc::clone(&hub), handle.clone(), frames, DecodePolicy::Disconnect).await;

        assert_eq!(outcome, IngressOutcome::DecodeFailed);
        assert!(!hub.is_registered(handle.id()));
        assert_eq!(hub.stats().published, 0);
        assert!(rx.try_recv().is_err());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_decode_error_skipped_when_configured() {
        let (hub, cancel) = running_hub(HubConfig::default());
        let mut rx = observer(&hub);
        let (handle, _own_rx) = ChannelHandle::new(64);

        let frames = stream::iter(vec![
            raw(r#"{"username": "alice"}"#),
            text(&Message::new("alice", "valid")),
        ]);
        let outcome =
            run_ingress(Arc::clone(&hub), Arc::new(handle), frames, DecodePolicy::Skip).await;

        assert_eq!(outcome, IngressOutcome::ClientClosed);
        assert_eq!(recv(&mut rx).await, Some(Message::new("alice", "valid")));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_full_registry_rejects_and_closes() {
        let config = HubConfig {
            max_connections: Some(1),
            ..Default::default()
        };
        let (hub, cancel) = running_hub(config);
        let _rx = observer(&hub);
        let (handle, _own_rx) = ChannelHandle::new(64);
        let handle = Arc::new(handle);

        let frames = stream::iter(vec![text(&Message::new("alice", "hi"))]);
        let outcome =
            run_ingress(Arc::clone(&hub), handle.clone(), frames, DecodePolicy::default()).await;

        assert!(matches!(
            outcome,
            IngressOutcome::Rejected(HubError::CapacityExceeded(_))
        ));
        assert!(handle.is_closed());
        assert_eq!(hub.stats().published, 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_hub_shutdown_ends_ingress() {
        let (hub, dispatcher) = BroadcastHub::new(HubConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        dispatcher.run(cancel).await;

        let (handle, _own_rx) = ChannelHandle::new(64);
        let frames = stream::iter(vec![text(&Message::new("alice", "hi"))]);
        let outcome = run_ingress(hub, Arc::new(handle), frames, DecodePolicy::default()).await;

        assert_eq!(outcome, IngressOutcome::Rejected(HubError::Closed));
    }

    #[tokio::test]
    async fn test_failed_delivery_stops_reader() {
        let (hub, cancel) = running_hub(HubConfig::default());
        let mut rx = observer(&hub);
        let (handle, own_rx) = ChannelHandle::new(64);
        let handle = Arc::new(handle);
        drop(own_rx);

        let (feed, frames) = frame_feed();
        let task = tokio::spawn(run_ingress(
            Arc::clone(&hub),
            handle.clone(),
            frames,
            DecodePolicy::Skip,
        ));

        feed.send(text(&Message::new("alice", "one"))).unwrap();
        assert_eq!(recv(&mut rx).await, Some(Message::new("alice", "one")));

        // Delivery to alice failed, so the hub dropped her and her reader ends
        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("reader kept running after eviction")
            .unwrap();
        assert_eq!(outcome, IngressOutcome::Evicted);
        assert!(!hub.is_registered(handle.id()));
        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let _ = feed.send(text(&Message::new("alice", "two")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.stats().published, 1);
        assert_eq!(hub.stats().pruned, 1);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_hub_shutdown_stops_running_reader() {
        let (hub, dispatcher) = BroadcastHub::new(HubConfig::default());
        let cancel = CancellationToken::new();
        let delivery = tokio::spawn(dispatcher.run(cancel.clone()));
        let (handle, _own_rx) = ChannelHandle::new(64);
        let handle = Arc::new(handle);

        let (_feed, frames) = frame_feed();
        let task = tokio::spawn(run_ingress(
            Arc::clone(&hub),
            handle.clone(),
            frames,
            DecodePolicy::default(),
        ));
        tokio::time::timeout(Duration::from_secs(2), async {
            while !hub.is_registered(handle.id()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        delivery.await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("reader kept running after shutdown")
            .unwrap();
        assert_eq!(outcome, IngressOutcome::HubClosed);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_aborted_reader_does_not_leave_stale_entry() {
        let (hub, cancel) = running_hub(HubConfig::default());
        let (handle, _own_rx) = ChannelHandle::new(64);
        let handle = Arc::new(handle);

        let frames = stream::pending::<Result<Inbound, io::Error>>();
        let task = tokio::spawn(run_ingress(
            Arc::clone(&hub),
            handle.clone(),
            frames,
            DecodePolicy::default(),
        ));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !hub.is_registered(handle.id()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!hub.is_registered(handle.id()));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
    }
}
