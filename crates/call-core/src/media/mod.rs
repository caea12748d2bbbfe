//! Media engine abstraction and the media transport built on it.

mod engine;
mod transport;
#[cfg(feature = "webrtc-engine")]
pub mod webrtc;

pub use engine::{
    IceConfiguration, IceServer, MediaEngine, PeerConnection, PeerConnectionState, SdpType,
    SessionDescription, SignalingState, StatsReport, TrackKind, TrackStats, TransceiverDirection,
    TransceiverHandle,
};
pub use transport::{MediaTransport, RemoteDescriptionOutcome, TransportDelegate};
