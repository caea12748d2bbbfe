//! Tracks and publications.
//!
//! A local track wraps one capture pipeline and a transceiver; a remote track
//! wraps a negotiated media line from a host. Publications bind tracks to a
//! participant under a stable id.

mod capture;
mod publication;
mod track;

pub use crate::media::TrackKind;
pub use capture::{CaptureDevices, Capturer};
pub use publication::{LocalTrackPublication, RemoteTrackPublication, SubscriptionState};
pub use track::{LifecycleState, LocalTrack, MuteChanged, RemoteTrack};

use serde::{Deserialize, Serialize};

/// Role a track plays for its participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Camera,
    Microphone,
    ScreenVideo,
    ScreenAudio,
    Unknown,
}

impl TrackSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TrackSource::Camera => "camera",
            TrackSource::Microphone => "microphone",
            TrackSource::ScreenVideo => "screen_video",
            TrackSource::ScreenAudio => "screen_audio",
            TrackSource::Unknown => "unknown",
        }
    }

    /// Media kind a source produces, if it is known.
    #[must_use]
    pub fn kind(self) -> Option<TrackKind> {
        match self {
            TrackSource::Camera | TrackSource::ScreenVideo => Some(TrackKind::Video),
            TrackSource::Microphone | TrackSource::ScreenAudio => Some(TrackKind::Audio),
            TrackSource::Unknown => None,
        }
    }
}
