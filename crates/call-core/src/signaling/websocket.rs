//! WebSocket signaling connector.
//!
//! Opens the signaling stream with `tokio-tungstenite`, presenting the call
//! credential as an `Authorization: Bearer` header on the upgrade request.

use async_trait::async_trait;
use common::secret::{bearer_header, SecretString};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::channel::{SignalingConnector, SignalingSink, StreamEvent};
use crate::errors::{CallError, CallResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the frame channel between the socket reader and the channel.
const EVENT_BUFFER: usize = 256;

/// Production connector over a WebSocket.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(
        &self,
        endpoint: &str,
        credential: &SecretString,
    ) -> CallResult<(Arc<dyn SignalingSink>, mpsc::Receiver<StreamEvent>)> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| CallError::InvalidState(format!("invalid signaling endpoint: {e}")))?;

        let authorization = HeaderValue::from_str(&bearer_header(credential))
            .map_err(|_| CallError::InvalidState("credential is not a valid header".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, authorization);

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| CallError::Disconnected(format!("websocket connect failed: {e}")))?;

        info!(target: "call.signaling", "WebSocket opened");

        let (write, read) = stream.split();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(read_pump(read, events_tx));

        let sink: Arc<dyn SignalingSink> = Arc::new(WebSocketSink {
            write: Mutex::new(Some(write)),
        });
        Ok((sink, events_rx))
    }
}

struct WebSocketSink {
    write: Mutex<Option<SplitSink<WsStream, Message>>>,
}

#[async_trait]
impl SignalingSink for WebSocketSink {
    async fn send(&self, frame: String) -> CallResult<()> {
        let mut write = self.write.lock().await;
        let Some(write) = write.as_mut() else {
            return Err(CallError::Disconnected("websocket closed".to_string()));
        };
        write
            .send(Message::Text(frame))
            .await
            .map_err(|e| CallError::Disconnected(format!("websocket send failed: {e}")))
    }

    async fn close(&self) {
        if let Some(mut write) = self.write.lock().await.take() {
            if let Err(e) = write.close().await {
                debug!(target: "call.signaling", error = %e, "WebSocket close failed");
            }
        }
    }
}

async fn read_pump(mut read: SplitStream<WsStream>, events: mpsc::Sender<StreamEvent>) {
    let closed_reason = loop {
        let event = match read.next().await {
            Some(Ok(Message::Text(text))) => StreamEvent::Frame(text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => StreamEvent::Frame(text),
                Err(_) => {
                    warn!(target: "call.signaling", "Ignoring non UTF-8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                break frame.map(|f| f.reason.to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        };

        if events.send(event).await.is_err() {
            // Channel side is gone; nobody cares about the close reason.
            return;
        }
    };

    debug!(target: "call.signaling", reason = ?closed_reason, "WebSocket read pump finished");
    let _ = events.send(StreamEvent::Closed(closed_reason)).await;
}
