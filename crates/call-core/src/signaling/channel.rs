//! Signaling channel.
//!
//! Owns one duplex stream to the call-control server, the outbound and
//! inbound [`MessageQueue`]s and the connect completion. Both queues start
//! suspended; the call orchestrator resumes them once the local side can
//! send (outbound) and react (inbound).

use async_trait::async_trait;
use common::secret::SecretString;
use common::sync::Completion;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::messages::{InboundMessage, OutboundMessage};
use super::queue::{Disposition, MessageQueue};
use crate::errors::{CallError, CallResult};

/// How long `disconnect` waits for queued outbound frames to be written.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Event produced by a stream opened through a [`SignalingConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// One text frame.
    Frame(String),
    /// The stream ended, with an optional reason.
    Closed(Option<String>),
}

/// Write half of an open signaling stream.
#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send(&self, frame: String) -> CallResult<()>;

    async fn close(&self);
}

/// Opens signaling streams.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        credential: &SecretString,
    ) -> CallResult<(Arc<dyn SignalingSink>, mpsc::Receiver<StreamEvent>)>;
}

/// Result of a successful connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectResult {
    pub connection_id: Option<String>,
}

/// Raised when the stream closes while the channel is connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelClosed {
    pub reason: Option<String>,
}

/// Receivers handed to the channel's owner.
#[derive(Debug)]
pub struct SignalingReceivers {
    /// Inbound messages released by the inbound queue.
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
    /// Stream closures while connected.
    pub closed: mpsc::UnboundedReceiver<ChannelClosed>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

struct Shared {
    state: Mutex<ChannelState>,
    sink: Mutex<Option<Arc<dyn SignalingSink>>>,
    outbound: MessageQueue<OutboundMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundMessage>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    inbound: MessageQueue<InboundMessage>,
    connected: Completion<ConnectResult, CallError>,
    closed_tx: mpsc::UnboundedSender<ChannelClosed>,
    cancel: CancellationToken,
    disconnected: AtomicBool,
}

/// Signaling channel. One connection per instance.
pub struct SignalingChannel {
    connector: Arc<dyn SignalingConnector>,
    connect_timeout: Duration,
    shared: Arc<Shared>,
}

impl SignalingChannel {
    /// Create an idle channel and the receivers its owner consumes.
    #[must_use]
    pub fn new(
        connector: Arc<dyn SignalingConnector>,
        connect_timeout: Duration,
    ) -> (Self, SignalingReceivers) {
        let (outbound, outbound_rx) = MessageQueue::new("outbound");
        let (inbound, inbound_rx) = MessageQueue::new("inbound");
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            state: Mutex::new(ChannelState::Idle),
            sink: Mutex::new(None),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            writer: Mutex::new(None),
            inbound,
            connected: Completion::new(),
            closed_tx,
            cancel: CancellationToken::new(),
            disconnected: AtomicBool::new(false),
        });

        let channel = Self {
            connector,
            connect_timeout,
            shared,
        };
        let receivers = SignalingReceivers {
            inbound: inbound_rx,
            closed: closed_rx,
        };
        (channel, receivers)
    }

    pub async fn state(&self) -> ChannelState {
        *self.shared.state.lock().await
    }

    /// Open the stream and wait (time-boxed) for the server's `connected`
    /// event.
    #[instrument(skip_all, name = "signaling.connect")]
    pub async fn connect(
        &self,
        credential: &SecretString,
        endpoint: &str,
    ) -> CallResult<ConnectResult> {
        {
            let mut state = self.shared.state.lock().await;
            if *state != ChannelState::Idle {
                return Err(CallError::InvalidState(format!(
                    "signaling channel cannot connect from {state:?}"
                )));
            }
            *state = ChannelState::Connecting;
        }

        // Armed before the stream opens so an early `connected` is not missed.
        self.shared.connected.reset();

        let (sink, events) = match self.connector.connect(endpoint, credential).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(target: "call.signaling", error = %e, "Failed to open signaling stream");
                self.shared.connected.fail(e.clone());
                *self.shared.state.lock().await = ChannelState::Disconnected;
                return Err(e);
            }
        };

        *self.shared.sink.lock().await = Some(Arc::clone(&sink));

        if let Some(outbound_rx) = self.shared.outbound_rx.lock().await.take() {
            let writer = tokio::spawn(write_loop(
                outbound_rx,
                sink,
                self.shared.cancel.clone(),
            ));
            *self.shared.writer.lock().await = Some(writer);
        }
        tokio::spawn(receive_loop(Arc::clone(&self.shared), events));

        match self.shared.connected.wait_timeout(self.connect_timeout).await {
            Ok(result) => {
                {
                    let mut state = self.shared.state.lock().await;
                    if *state != ChannelState::Connecting {
                        return Err(CallError::Disconnected(
                            "stream closed during connect".to_string(),
                        ));
                    }
                    *state = ChannelState::Connected;
                }
                info!(
                    target: "call.signaling",
                    connection_id = ?result.connection_id,
                    "Signaling channel connected"
                );
                Ok(result)
            }
            Err(e) => {
                warn!(
                    target: "call.signaling",
                    error = %e,
                    error_type = e.error_type(),
                    "Signaling connect failed"
                );
                self.disconnect().await;
                Err(e)
            }
        }
    }

    /// Send a message through the outbound queue.
    ///
    /// Fails with `InvalidState` unless the channel is connected.
    pub async fn send(&self, message: OutboundMessage) -> CallResult<Disposition> {
        if *self.shared.state.lock().await != ChannelState::Connected {
            return Err(CallError::InvalidState(format!(
                "cannot send {} while not connected",
                message.message_type()
            )));
        }
        Ok(self.shared.outbound.push(message).await)
    }

    pub async fn resume_outbound(&self) -> usize {
        self.shared.outbound.resume().await
    }

    pub async fn suspend_outbound(&self) {
        self.shared.outbound.suspend().await;
    }

    pub async fn resume_inbound(&self) -> usize {
        self.shared.inbound.resume().await
    }

    pub async fn suspend_inbound(&self) {
        self.shared.inbound.suspend().await;
    }

    /// Tear the connection down. Idempotent.
    pub async fn disconnect(&self) {
        if self.shared.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.cancel.cancel();
        *self.shared.state.lock().await = ChannelState::Disconnected;

        let writer = self.shared.writer.lock().await.take();
        if let Some(writer) = writer {
            if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
                debug!(target: "call.signaling", "Outbound flush timed out");
            }
        }

        if let Some(sink) = self.shared.sink.lock().await.take() {
            sink.close().await;
        }

        self.shared.outbound.suspend().await;
        self.shared.inbound.suspend().await;
        let discarded = self.shared.outbound.clear().await + self.shared.inbound.clear().await;
        if discarded > 0 {
            debug!(target: "call.signaling", discarded, "Discarded buffered messages");
        }

        self.shared
            .connected
            .fail(CallError::Disconnected("disconnected locally".to_string()));

        info!(target: "call.signaling", "Signaling channel disconnected");
    }
}

async fn write_loop(
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    sink: Arc<dyn SignalingSink>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                // Flush what was already accepted before the sink closes.
                while let Ok(message) = outbound.try_recv() {
                    write_frame(sink.as_ref(), message).await;
                }
                break;
            }
            message = outbound.recv() => {
                let Some(message) = message else { break };
                write_frame(sink.as_ref(), message).await;
            }
        }
    }
}

async fn write_frame(sink: &dyn SignalingSink, message: OutboundMessage) {
    let frame = match message.encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(target: "call.signaling", error = %e, "Failed to encode outbound message");
            return;
        }
    };
    if let Err(e) = sink.send(frame).await {
        warn!(
            target: "call.signaling",
            message_type = message.message_type(),
            error = %e,
            "Failed to write outbound frame"
        );
    }
}

#[instrument(skip_all, name = "signaling.receive")]
async fn receive_loop(shared: Arc<Shared>, mut events: mpsc::Receiver<StreamEvent>) {
    loop {
        let event = tokio::select! {
            () = shared.cancel.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Some(StreamEvent::Frame(frame)) => match InboundMessage::decode(&frame) {
                Ok(InboundMessage::Connected(payload)) => {
                    shared.connected.resume(ConnectResult {
                        connection_id: payload.connection_id,
                    });
                }
                Ok(InboundMessage::Unknown(kind)) => {
                    debug!(target: "call.signaling", message_type = %kind, "Ignoring unknown message");
                }
                Ok(message) => {
                    shared.inbound.push(message).await;
                }
                Err(e) => {
                    warn!(target: "call.signaling", error = %e, "Dropping malformed inbound frame");
                }
            },
            Some(StreamEvent::Closed(reason)) => {
                stream_ended(&shared, reason).await;
                return;
            }
            None => {
                stream_ended(&shared, None).await;
                return;
            }
        }
    }
}

async fn stream_ended(shared: &Shared, reason: Option<String>) {
    let reason_text = reason.clone().unwrap_or_else(|| "stream ended".to_string());
    shared
        .connected
        .fail(CallError::Disconnected(reason_text.clone()));

    let was_connected = {
        let mut state = shared.state.lock().await;
        let was_connected = *state == ChannelState::Connected;
        *state = ChannelState::Disconnected;
        was_connected
    };

    if was_connected {
        warn!(target: "call.signaling", reason = %reason_text, "Signaling stream closed");
        let _ = shared.closed_tx.send(ChannelClosed { reason });
    } else {
        debug!(target: "call.signaling", reason = %reason_text, "Signaling stream closed before connect");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::messages::{TrackState, WireTrackType};
    use crate::testing::fake_signaling::FakeSignalingConnector;

    fn credential() -> SecretString {
        SecretString::from("token-123")
    }

    fn channel_with(
        connector: &Arc<FakeSignalingConnector>,
    ) -> (SignalingChannel, SignalingReceivers) {
        let connector: Arc<dyn SignalingConnector> = connector.clone();
        SignalingChannel::new(connector, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_connect_resolves_on_connected_event() {
        let connector = Arc::new(FakeSignalingConnector::new());
        let (channel, _rx) = channel_with(&connector);

        let result = channel.connect(&credential(), "wss://example/ws").await.unwrap();

        assert_eq!(result.connection_id.as_deref(), Some("fake-connection"));
        assert_eq!(channel.state().await, ChannelState::Connected);
        assert_eq!(connector.endpoints(), vec!["wss://example/ws".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_without_connected_event() {
        let connector = Arc::new(FakeSignalingConnector::silent());
        let (channel, _rx) = channel_with(&connector);

        let result = channel.connect(&credential(), "wss://example/ws").await;

        assert_eq!(result, Err(CallError::Timeout));
        assert_eq!(channel.state().await, ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_fails_when_connector_fails() {
        let connector = Arc::new(FakeSignalingConnector::failing());
        let (channel, _rx) = channel_with(&connector);

        let result = channel.connect(&credential(), "wss://example/ws").await;

        assert!(matches!(result, Err(CallError::Disconnected(_))));
        assert_eq!(channel.state().await, ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let connector = Arc::new(FakeSignalingConnector::new());
        let (channel, _rx) = channel_with(&connector);

        let result = channel.send(OutboundMessage::Accept).await;

        assert!(matches!(result, Err(CallError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_outbound_buffered_until_resumed() {
        let connector = Arc::new(FakeSignalingConnector::new());
        let (channel, _rx) = channel_with(&connector);
        channel.connect(&credential(), "wss://example/ws").await.unwrap();

        let update = OutboundMessage::UpdateTracks(vec![TrackState {
            id: "mic".to_string(),
            track_type: WireTrackType::Audio,
            muted: false,
        }]);
        assert_eq!(channel.send(update).await.unwrap(), Disposition::Buffered);
        assert_eq!(
            channel.send(OutboundMessage::Accept).await.unwrap(),
            Disposition::Dropped
        );

        channel.resume_outbound().await;
        assert_eq!(
            channel.send(OutboundMessage::Accept).await.unwrap(),
            Disposition::Delivered
        );

        let sent = connector.wait_for_sent(2).await;
        assert_eq!(
            sent,
            vec![
                "call.participant.tracks.update".to_string(),
                "call.participant.accept".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_inbound_held_until_resumed() {
        let connector = Arc::new(FakeSignalingConnector::new());
        let (channel, mut rx) = channel_with(&connector);
        channel.connect(&credential(), "wss://example/ws").await.unwrap();

        connector
            .push_frame(r#"{"type":"call.ended","data":{"call_id":"6f1c2a4e-7d1b-4a59-9a57-0d2b1f0e5c11"}}"#)
            .await;
        connector.push_frame(r#"{"type":"mystery","data":{}}"#).await;
        tokio::task::yield_now().await;
        assert!(rx.inbound.try_recv().is_err());

        channel.resume_inbound().await;
        let message = rx.inbound.recv().await.unwrap();
        assert!(matches!(message, InboundMessage::CallEnded(_)));
        assert!(rx.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_close_while_connected_notifies_owner() {
        let connector = Arc::new(FakeSignalingConnector::new());
        let (channel, mut rx) = channel_with(&connector);
        channel.connect(&credential(), "wss://example/ws").await.unwrap();

        connector.close_stream(Some("server restart".to_string())).await;

        let closed = rx.closed.recv().await.unwrap();
        assert_eq!(closed.reason.as_deref(), Some("server restart"));
        assert_eq!(channel.state().await, ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let connector = Arc::new(FakeSignalingConnector::new());
        let (channel, mut rx) = channel_with(&connector);
        channel.connect(&credential(), "wss://example/ws").await.unwrap();

        channel.disconnect().await;
        channel.disconnect().await;

        assert_eq!(channel.state().await, ChannelState::Disconnected);
        assert_eq!(connector.sink_closes(), 1);
        assert!(rx.closed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_flushes_delivered_messages() {
        let connector = Arc::new(FakeSignalingConnector::new());
        let (channel, _rx) = channel_with(&connector);
        channel.connect(&credential(), "wss://example/ws").await.unwrap();
        channel.resume_outbound().await;

        assert_eq!(
            channel.send(OutboundMessage::End).await.unwrap(),
            Disposition::Delivered
        );
        channel.disconnect().await;

        assert_eq!(connector.sent_types(), vec!["call.participant.end".to_string()]);
    }
}
