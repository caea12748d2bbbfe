//! Shared wiring for the call integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use call_core::api::InMemoryCredentialStore;
use call_core::call::CallDependencies;
use call_core::testing::{
    FakeCaptureDevices, FakeMediaEngine, FakeSignalingConnector, MockControlPlane,
    RecordingReporter,
};
use call_core::{Call, CallManager, Config};
use common::secret::SecretString;
use common::types::CallId;
use serde_json::json;

pub const SIGNALING_URL: &str = "wss://signal.example.com/calls";
pub const WAIT: Duration = Duration::from_secs(5);

/// Fakes for every collaborator of a call.
pub struct Harness {
    pub api: Arc<MockControlPlane>,
    pub connector: Arc<FakeSignalingConnector>,
    pub engine: Arc<FakeMediaEngine>,
    pub devices: Arc<FakeCaptureDevices>,
    pub reporter: Arc<RecordingReporter>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeSignalingConnector::new(), FakeMediaEngine::new())
    }

    pub fn with(connector: FakeSignalingConnector, engine: FakeMediaEngine) -> Self {
        let mut config = Config::new("http://control.example.com");
        config.connect_timeout = Duration::from_secs(2);
        config.transport_timeout = Duration::from_secs(2);

        Self {
            api: Arc::new(MockControlPlane::new()),
            connector: Arc::new(connector),
            engine: Arc::new(engine),
            devices: Arc::new(FakeCaptureDevices::new()),
            reporter: Arc::new(RecordingReporter::new()),
            config,
        }
    }

    pub fn deps(&self) -> CallDependencies {
        CallDependencies {
            api: self.api.clone(),
            connector: self.connector.clone(),
            engine: self.engine.clone(),
            devices: self.devices.clone(),
            reporter: self.reporter.clone(),
        }
    }

    pub fn call(&self) -> Call {
        Call::new(CallId::new(), &self.config, self.deps())
    }

    pub fn manager(&self, credential: Option<&str>) -> (CallManager, Arc<InMemoryCredentialStore>) {
        let credentials = Arc::new(InMemoryCredentialStore::new(
            credential.map(SecretString::from),
        ));
        let manager = CallManager::new(self.config.clone(), self.deps(), credentials.clone());
        (manager, credentials)
    }

    /// Connect, answer and join a fresh call.
    pub async fn joined_call(&self) -> Call {
        let call = self.call();
        call.connect(&credential(), "Support", SIGNALING_URL)
            .await
            .unwrap();
        call.answer();
        call.join().await.unwrap();
        call
    }

    /// Deliver a server event.
    pub async fn push(&self, message_type: &str, data: serde_json::Value) {
        let frame = json!({"type": message_type, "data": data}).to_string();
        self.connector.push_frame(&frame).await;
    }

    /// Wait until the client wrote a frame of `message_type`.
    pub async fn wait_for_frame(&self, message_type: &str) -> bool {
        let connector = Arc::clone(&self.connector);
        let message_type = message_type.to_string();
        wait_until(move || connector.sent_types().contains(&message_type)).await
    }
}

pub fn credential() -> SecretString {
    SecretString::from("user-token")
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
