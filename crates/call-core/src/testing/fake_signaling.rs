//! In-memory signaling connector.
//!
//! Every opened stream is scripted: by default the server side answers with
//! a `connected` event right away. Tests push inbound frames, close the
//! stream and inspect what the client wrote.

use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::errors::{CallError, CallResult};
use crate::signaling::{SignalingConnector, SignalingSink, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    AnswerConnected,
    Silent,
    Fail,
}

#[derive(Debug, Default)]
struct Recorded {
    endpoints: Vec<String>,
    credentials: Vec<String>,
    frames: Vec<String>,
    server: Option<mpsc::Sender<StreamEvent>>,
}

#[derive(Debug)]
struct Shared {
    recorded: Mutex<Recorded>,
    written: Notify,
    sink_closes: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scripted connector.
#[derive(Debug)]
pub struct FakeSignalingConnector {
    script: Script,
    shared: Arc<Shared>,
    connects: AtomicUsize,
}

impl Default for FakeSignalingConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSignalingConnector {
    /// Server answers every connect with `connected`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_script(Script::AnswerConnected)
    }

    /// Server accepts the stream but never says `connected`.
    #[must_use]
    pub fn silent() -> Self {
        Self::with_script(Script::Silent)
    }

    /// Opening the stream fails.
    #[must_use]
    pub fn failing() -> Self {
        Self::with_script(Script::Fail)
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            shared: Arc::new(Shared {
                recorded: Mutex::new(Recorded::default()),
                written: Notify::new(),
                sink_closes: AtomicUsize::new(0),
            }),
            connects: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        self.shared.lock().endpoints.clone()
    }

    /// Credentials presented on connect, exposed for assertions.
    #[must_use]
    pub fn credentials(&self) -> Vec<String> {
        self.shared.lock().credentials.clone()
    }

    #[must_use]
    pub fn sink_closes(&self) -> usize {
        self.shared.sink_closes.load(Ordering::SeqCst)
    }

    /// Raw frames written by the client so far.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<String> {
        self.shared.lock().frames.clone()
    }

    /// `type` of every frame written by the client so far.
    #[must_use]
    pub fn sent_types(&self) -> Vec<String> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| serde_json::from_str::<serde_json::Value>(frame).ok())
            .filter_map(|value| value.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .collect()
    }

    /// Wait until at least `count` frames were written (up to five seconds)
    /// and return their types.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let notified = self.shared.written.notified();
            let types = self.sent_types();
            if types.len() >= count || tokio::time::Instant::now() >= deadline {
                return types;
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    /// Deliver a frame from the server side.
    pub async fn push_frame(&self, frame: &str) {
        let server = self.shared.lock().server.clone();
        if let Some(server) = server {
            let _ = server.send(StreamEvent::Frame(frame.to_string())).await;
        }
    }

    /// Close the stream from the server side.
    pub async fn close_stream(&self, reason: Option<String>) {
        let server = self.shared.lock().server.take();
        if let Some(server) = server {
            let _ = server.send(StreamEvent::Closed(reason)).await;
        }
    }
}

#[async_trait]
impl SignalingConnector for FakeSignalingConnector {
    async fn connect(
        &self,
        endpoint: &str,
        credential: &SecretString,
    ) -> CallResult<(Arc<dyn SignalingSink>, mpsc::Receiver<StreamEvent>)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        {
            let mut recorded = self.shared.lock();
            recorded.endpoints.push(endpoint.to_string());
            recorded.credentials.push(credential.expose_secret().to_string());
        }

        if self.script == Script::Fail {
            return Err(CallError::Disconnected("connection refused".to_string()));
        }

        let (server, events) = mpsc::channel(64);
        if self.script == Script::AnswerConnected {
            let _ = server
                .send(StreamEvent::Frame(
                    r#"{"type":"connected","data":{"connection_id":"fake-connection"}}"#
                        .to_string(),
                ))
                .await;
        }
        self.shared.lock().server = Some(server);

        let sink: Arc<dyn SignalingSink> = Arc::new(FakeSink {
            shared: Arc::clone(&self.shared),
        });
        Ok((sink, events))
    }
}

#[derive(Debug)]
struct FakeSink {
    shared: Arc<Shared>,
}

#[async_trait]
impl SignalingSink for FakeSink {
    async fn send(&self, frame: String) -> CallResult<()> {
        self.shared.lock().frames.push(frame);
        self.shared.written.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        self.shared.sink_closes.fetch_add(1, Ordering::SeqCst);
        let server = self.shared.lock().server.take();
        if let Some(server) = server {
            let _ = server
                .send(StreamEvent::Closed(Some("closed by client".to_string())))
                .await;
        }
    }
}
