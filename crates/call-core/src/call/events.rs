//! Call lifecycle types and the collaborators a call reports to.

use common::types::CallId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::ControlPlane;
use crate::errors::CallResult;
use crate::media::MediaEngine;
use crate::signaling::SignalingConnector;
use crate::tracks::CaptureDevices;

/// Connection state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Media transport dropped while connected; it may recover.
    Reconnecting,
    Connected,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The app user hung up.
    LocalHangup,
    /// The server ended the call.
    RemoteEnded,
    /// The media transport failed.
    Failed,
    /// The signaling stream closed under a live call.
    ConnectionLost,
    /// The call never finished connecting.
    ConnectFailed,
}

impl EndReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::LocalHangup => "local_hangup",
            EndReason::RemoteEnded => "remote_ended",
            EndReason::Failed => "failed",
            EndReason::ConnectionLost => "connection_lost",
            EndReason::ConnectFailed => "connect_failed",
        }
    }
}

/// Wake-up payload of an incoming call push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCall {
    pub uuid: CallId,
    /// Signaling endpoint of the call.
    pub url: String,
    pub caller_name: String,
    #[serde(default)]
    pub has_video: bool,
}

impl IncomingCall {
    /// Decode a raw push payload.
    ///
    /// # Errors
    ///
    /// `Serialization` if the payload is not a valid incoming call.
    pub fn from_payload(payload: &[u8]) -> CallResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// The host application's incoming-call UI.
pub trait CallReporter: Send + Sync {
    fn report_incoming_call(&self, call: &IncomingCall);

    fn report_call_connected(&self, call_id: CallId);

    fn report_call_ended(&self, call_id: CallId, reason: EndReason);
}

/// Everything a call talks to.
#[derive(Clone)]
pub struct CallDependencies {
    pub api: Arc<dyn ControlPlane>,
    pub connector: Arc<dyn SignalingConnector>,
    pub engine: Arc<dyn MediaEngine>,
    pub devices: Arc<dyn CaptureDevices>,
    pub reporter: Arc<dyn CallReporter>,
}

impl std::fmt::Debug for CallDependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallDependencies").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::errors::CallError;

    #[test]
    fn test_incoming_call_from_payload() {
        let payload = br#"{
            "uuid": "6f1c2a4e-7d1b-4a59-9a57-0d2b1f0e5c11",
            "url": "wss://signal.example.com/calls/1",
            "caller_name": "Support"
        }"#;
        let call = IncomingCall::from_payload(payload).unwrap();
        assert_eq!(call.uuid.to_string(), "6f1c2a4e-7d1b-4a59-9a57-0d2b1f0e5c11");
        assert_eq!(call.caller_name, "Support");
        assert!(!call.has_video);
    }

    #[test]
    fn test_malformed_payload_is_serialization_error() {
        let err = IncomingCall::from_payload(b"{\"uuid\": 5}").unwrap_err();
        assert!(matches!(err, CallError::Serialization(_)));
    }

    #[test]
    fn test_labels() {
        assert_eq!(EndReason::ConnectionLost.as_str(), "connection_lost");
        assert_eq!(ConnectionState::Reconnecting.as_str(), "reconnecting");
    }
}
