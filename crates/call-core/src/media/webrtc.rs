//! [`MediaEngine`] over the `webrtc` crate.
//!
//! Capture and rendering stay with the host platform; this adapter only
//! drives negotiation, transceivers, connection state and statistics.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::stats::StatsReportType;

use super::engine::{
    IceConfiguration, MediaEngine, PeerConnection, PeerConnectionState, SdpType,
    SessionDescription, SignalingState, StatsReport, TrackKind, TrackStats, TransceiverDirection,
    TransceiverHandle,
};
use crate::errors::{CallError, CallResult};

fn engine_error(e: webrtc::Error) -> CallError {
    CallError::Transport(e.to_string())
}

/// Builds one `webrtc` API with the default codecs and interceptors and
/// creates peer connections from it.
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    /// # Errors
    ///
    /// `Transport` if codec or interceptor registration fails.
    pub fn new() -> CallResult<Self> {
        let mut codecs = CodecRegistry::default();
        codecs.register_default_codecs().map_err(engine_error)?;

        let registry = register_default_interceptors(Registry::new(), &mut codecs)
            .map_err(engine_error)?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create(&self, ice: &IceConfiguration) -> CallResult<Arc<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: ice
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(engine_error)?,
        );

        let (state_tx, state_rx) = watch::channel(PeerConnectionState::New);
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let mapped = map_connection_state(state);
            debug!(target: "call.transport", state = mapped.as_str(), "Peer connection state");
            let _ = state_tx.send(mapped);
            Box::pin(async {})
        }));

        info!(
            target: "call.transport",
            ice_servers = ice.ice_servers.len(),
            "Peer connection created"
        );
        Ok(Arc::new(WebRtcPeer {
            peer,
            state: state_rx,
            transceivers: Mutex::new(HashMap::new()),
        }))
    }
}

struct WebRtcPeer {
    peer: Arc<RTCPeerConnection>,
    state: watch::Receiver<PeerConnectionState>,
    transceivers: Mutex<HashMap<String, Arc<RTCRtpTransceiver>>>,
}

impl WebRtcPeer {
    fn transceiver(&self, handle: &TransceiverHandle) -> Option<Arc<RTCRtpTransceiver>> {
        self.transceivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.id)
            .cloned()
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> CallResult<SessionDescription> {
        let offer = self.peer.create_offer(None).await.map_err(engine_error)?;
        Ok(from_rtc(&offer))
    }

    async fn create_answer(&self) -> CallResult<SessionDescription> {
        let answer = self.peer.create_answer(None).await.map_err(engine_error)?;
        Ok(from_rtc(&answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> CallResult<()> {
        self.peer
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(engine_error)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> CallResult<()> {
        self.peer
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(engine_error)
    }

    fn signaling_state(&self) -> SignalingState {
        match self.peer.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> watch::Receiver<PeerConnectionState> {
        self.state.clone()
    }

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> CallResult<TransceiverHandle> {
        let codec = match kind {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        };
        let init = RTCRtpTransceiverInit {
            direction: match direction {
                TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
                TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
                TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
                TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
            },
            send_encodings: Vec::new(),
        };

        let transceiver = self
            .peer
            .add_transceiver_from_kind(codec, Some(init))
            .await
            .map_err(engine_error)?;

        let handle = TransceiverHandle {
            id: Uuid::new_v4().to_string(),
            kind,
            direction,
        };
        self.transceivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id.clone(), transceiver);
        Ok(handle)
    }

    async fn remove_transceiver(&self, handle: &TransceiverHandle) -> CallResult<()> {
        let transceiver = self
            .transceivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id);
        match transceiver {
            Some(transceiver) => transceiver.stop().await.map_err(engine_error),
            None => Err(CallError::InvalidState(format!(
                "unknown transceiver {}",
                handle.id
            ))),
        }
    }

    async fn transceiver_mid(&self, handle: &TransceiverHandle) -> Option<String> {
        self.transceiver(handle)?.mid().map(|mid| mid.to_string())
    }

    async fn statistics(&self) -> CallResult<StatsReport> {
        let stats = self.peer.get_stats().await;
        let mut report = StatsReport::default();

        for entry in stats.reports.into_values() {
            match entry {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    report.round_trip_time =
                        Duration::try_from_secs_f64(pair.current_round_trip_time).ok();
                }
                StatsReportType::OutboundRTP(outbound) => report.tracks.push(TrackStats {
                    transceiver_id: outbound.id,
                    bytes_sent: outbound.bytes_sent,
                    packets_sent: outbound.packets_sent,
                    ..TrackStats::default()
                }),
                StatsReportType::InboundRTP(inbound) => report.tracks.push(TrackStats {
                    transceiver_id: inbound.id,
                    bytes_received: inbound.bytes_received,
                    packets_received: inbound.packets_received,
                    ..TrackStats::default()
                }),
                _ => {}
            }
        }
        Ok(report)
    }

    async fn close(&self) -> CallResult<()> {
        self.peer.close().await.map_err(engine_error)
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn from_rtc(description: &RTCSessionDescription) -> SessionDescription {
    let kind = match description.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Offer,
    };
    SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    }
}

fn to_rtc(description: SessionDescription) -> CallResult<RTCSessionDescription> {
    match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp).map_err(engine_error),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp).map_err(engine_error),
        SdpType::Pranswer => {
            RTCSessionDescription::pranswer(description.sdp).map_err(engine_error)
        }
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    }
}
