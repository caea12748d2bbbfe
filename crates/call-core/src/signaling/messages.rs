//! Signaling wire messages.
//!
//! Every frame is a JSON envelope `{"type": <string>, "data": <payload|null>}`.
//! Outbound intents and inbound events each carry an `enqueue` predicate
//! telling the queues whether the message may wait behind a suspended gate.

use common::types::CallId;
use serde::{Deserialize, Serialize};

use crate::errors::CallResult;
use crate::media::TrackKind;
use crate::tracks::TrackSource;

pub const TYPE_ACCEPT: &str = "call.participant.accept";
pub const TYPE_END: &str = "call.participant.end";
pub const TYPE_UPDATE_TRACK: &str = "call.participant.track.update";
pub const TYPE_UPDATE_TRACKS: &str = "call.participant.tracks.update";
pub const TYPE_UPDATE_PARTICIPANT: &str = "call.participant.update";
pub const TYPE_CONNECTED: &str = "connected";
pub const TYPE_CALL_UPDATED: &str = "call.updated";
pub const TYPE_CALL_ENDED: &str = "call.ended";

/// Decides whether a message may be buffered while its queue is suspended.
pub trait Enqueue {
    /// `true`: buffer while suspended. `false`: deliver now or drop.
    fn enqueue(&self) -> bool;

    /// Bounded label for logs and metrics.
    fn label(&self) -> &'static str;
}

/// Track type as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireTrackType {
    Audio,
    Video,
    ScreenAudio,
    ScreenVideo,
}

impl WireTrackType {
    /// Media kind and source role carried by this wire type.
    #[must_use]
    pub fn kind_and_source(self) -> (TrackKind, TrackSource) {
        match self {
            WireTrackType::Audio => (TrackKind::Audio, TrackSource::Microphone),
            WireTrackType::Video => (TrackKind::Video, TrackSource::Camera),
            WireTrackType::ScreenAudio => (TrackKind::Audio, TrackSource::ScreenAudio),
            WireTrackType::ScreenVideo => (TrackKind::Video, TrackSource::ScreenVideo),
        }
    }

    /// Wire type for a local track. Unknown sources fall back to their kind.
    #[must_use]
    pub fn from_source(kind: TrackKind, source: TrackSource) -> Self {
        match (source, kind) {
            (TrackSource::ScreenAudio, _) => WireTrackType::ScreenAudio,
            (TrackSource::ScreenVideo, _) => WireTrackType::ScreenVideo,
            (TrackSource::Microphone, _) | (TrackSource::Unknown, TrackKind::Audio) => {
                WireTrackType::Audio
            }
            (TrackSource::Camera, _) | (TrackSource::Unknown, TrackKind::Video) => {
                WireTrackType::Video
            }
        }
    }
}

/// Mute state of one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackState {
    pub id: String,
    #[serde(rename = "type")]
    pub track_type: WireTrackType,
    #[serde(default)]
    pub muted: bool,
}

/// Whether the app is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Foreground,
    Background,
}

/// Payload of `call.participant.update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantUpdate {
    pub app_state: AppState,
}

/// Outbound intents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Accept,
    End,
    UpdateTrack(TrackState),
    UpdateTracks(Vec<TrackState>),
    UpdateParticipant(ParticipantUpdate),
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: Option<T>,
}

impl OutboundMessage {
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            OutboundMessage::Accept => TYPE_ACCEPT,
            OutboundMessage::End => TYPE_END,
            OutboundMessage::UpdateTrack(_) => TYPE_UPDATE_TRACK,
            OutboundMessage::UpdateTracks(_) => TYPE_UPDATE_TRACKS,
            OutboundMessage::UpdateParticipant(_) => TYPE_UPDATE_PARTICIPANT,
        }
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> CallResult<String> {
        let kind = self.message_type();
        let frame = match self {
            OutboundMessage::Accept | OutboundMessage::End => {
                serde_json::to_string(&Envelope::<()> { kind, data: None })?
            }
            OutboundMessage::UpdateTrack(track) => serde_json::to_string(&Envelope {
                kind,
                data: Some(track),
            })?,
            OutboundMessage::UpdateTracks(tracks) => serde_json::to_string(&Envelope {
                kind,
                data: Some(tracks),
            })?,
            OutboundMessage::UpdateParticipant(update) => serde_json::to_string(&Envelope {
                kind,
                data: Some(update),
            })?,
        };
        Ok(frame)
    }
}

impl Enqueue for OutboundMessage {
    fn enqueue(&self) -> bool {
        match self {
            // Control messages never wait behind buffered track updates.
            OutboundMessage::Accept | OutboundMessage::End => false,
            OutboundMessage::UpdateTrack(_)
            | OutboundMessage::UpdateTracks(_)
            | OutboundMessage::UpdateParticipant(_) => true,
        }
    }

    fn label(&self) -> &'static str {
        self.message_type()
    }
}

/// Role of a participant in a `call.updated` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    User,
    Host,
}

/// One participant in a `call.updated` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantDescriptor {
    pub id: String,
    pub role: ParticipantRole,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub app_state: Option<AppState>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub tracks: Vec<TrackState>,
}

/// Payload of `call.updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUpdate {
    pub call_id: CallId,
    #[serde(default)]
    pub participants: Vec<ParticipantDescriptor>,
}

/// Payload of `call.ended`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEnded {
    pub call_id: CallId,
}

/// Payload of `connected`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    #[serde(default)]
    pub connection_id: Option<String>,
}

/// Inbound events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Connected(Connected),
    CallUpdated(CallUpdate),
    CallEnded(CallEnded),
    /// Unrecognized type. Logged, never propagated.
    Unknown(String),
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl InboundMessage {
    /// Decode a JSON text frame.
    ///
    /// Unrecognized types decode to [`InboundMessage::Unknown`]; a recognized
    /// type with a malformed payload is an error.
    pub fn decode(frame: &str) -> CallResult<Self> {
        let raw: RawEnvelope = serde_json::from_str(frame)?;
        let message = match raw.kind.as_str() {
            TYPE_CONNECTED => {
                if raw.data.is_null() {
                    InboundMessage::Connected(Connected::default())
                } else {
                    InboundMessage::Connected(serde_json::from_value(raw.data)?)
                }
            }
            TYPE_CALL_UPDATED => InboundMessage::CallUpdated(serde_json::from_value(raw.data)?),
            TYPE_CALL_ENDED => InboundMessage::CallEnded(serde_json::from_value(raw.data)?),
            _ => InboundMessage::Unknown(raw.kind),
        };
        Ok(message)
    }
}

impl Enqueue for InboundMessage {
    fn enqueue(&self) -> bool {
        match self {
            InboundMessage::CallUpdated(_) | InboundMessage::CallEnded(_) => true,
            InboundMessage::Connected(_) | InboundMessage::Unknown(_) => false,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            InboundMessage::Connected(_) => TYPE_CONNECTED,
            InboundMessage::CallUpdated(_) => TYPE_CALL_UPDATED,
            InboundMessage::CallEnded(_) => TYPE_CALL_ENDED,
            InboundMessage::Unknown(_) => "unknown",
        }
    }
}
