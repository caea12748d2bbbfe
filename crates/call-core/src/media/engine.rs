//! Media engine abstraction.
//!
//! The core never talks to a real-time media stack directly. It sees a
//! [`PeerConnection`] exposing offer/answer, description application,
//! transceivers, connection state and statistics, created per call by a
//! [`MediaEngine`]. Codecs, jitter buffers and ICE are the engine's business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::errors::CallResult;

/// SDP description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn rollback() -> Self {
        Self {
            kind: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

/// Offer/answer state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Aggregate connection state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Bounded label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        }
    }
}

/// One STUN/TURN server entry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl fmt::Debug for IceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceServer")
            .field("urls", &self.urls)
            .field("username", &self.username)
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// ICE configuration snapshot fetched from the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfiguration {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

/// Media kind of a track or transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// Direction of a transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendOnly,
    RecvOnly,
    SendRecv,
    Inactive,
}

/// Opaque handle to a transceiver living inside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverHandle {
    pub id: String,
    pub kind: TrackKind,
    pub direction: TransceiverDirection,
}

/// Counters for one transceiver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackStats {
    pub transceiver_id: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
}

/// Statistics sample for a peer connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub round_trip_time: Option<Duration>,
    pub tracks: Vec<TrackStats>,
}

impl StatsReport {
    /// Keep only the counters for one transceiver.
    #[must_use]
    pub fn narrowed_to(mut self, transceiver_id: &str) -> Self {
        self.tracks.retain(|t| t.transceiver_id == transceiver_id);
        self
    }
}

/// A peer connection as seen by the media transport.
///
/// Implementations must be safe to call from any task. Ordering of
/// description mutation is the caller's responsibility.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> CallResult<SessionDescription>;

    async fn create_answer(&self) -> CallResult<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> CallResult<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> CallResult<()>;

    fn signaling_state(&self) -> SignalingState;

    /// Connection state updates. The receiver starts at the current state.
    fn connection_state(&self) -> watch::Receiver<PeerConnectionState>;

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> CallResult<TransceiverHandle>;

    async fn remove_transceiver(&self, transceiver: &TransceiverHandle) -> CallResult<()>;

    /// Negotiated media id of a transceiver, once a local description exists.
    async fn transceiver_mid(&self, transceiver: &TransceiverHandle) -> Option<String>;

    async fn statistics(&self) -> CallResult<StatsReport>;

    async fn close(&self) -> CallResult<()>;
}

/// Factory for peer connections.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create(&self, ice: &IceConfiguration) -> CallResult<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_session_description_wire_format() {
        let offer = SessionDescription::offer("v=0");
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0"}));

        let parsed: SessionDescription =
            serde_json::from_str(r#"{"type":"answer","sdp":"v=0\r\n"}"#).unwrap();
        assert_eq!(parsed.kind, SdpType::Answer);
    }

    #[test]
    fn test_ice_configuration_optional_credentials() {
        let json = r#"{"ice_servers":[{"urls":["stun:stun.example.com"]},{"urls":["turn:turn.example.com"],"username":"u","credential":"c"}]}"#;
        let config: IceConfiguration = serde_json::from_str(json).unwrap();

        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers.first().unwrap().username.is_none());
        assert!(!format!("{config:?}").contains("\"c\""));
    }

    #[test]
    fn test_stats_report_narrowed_to_transceiver() {
        let report = StatsReport {
            round_trip_time: Some(Duration::from_millis(40)),
            tracks: vec![
                TrackStats {
                    transceiver_id: "t1".to_string(),
                    bytes_sent: 10,
                    ..TrackStats::default()
                },
                TrackStats {
                    transceiver_id: "t2".to_string(),
                    bytes_sent: 20,
                    ..TrackStats::default()
                },
            ],
        };

        let narrowed = report.narrowed_to("t2");
        assert_eq!(narrowed.tracks.len(), 1);
        assert_eq!(narrowed.tracks.first().unwrap().bytes_sent, 20);
        assert_eq!(narrowed.round_trip_time, Some(Duration::from_millis(40)));
    }
}
