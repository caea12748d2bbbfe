//! Which publication fills which source role.
//!
//! Precedence, in order:
//!
//! 1. A publication whose source equals the requested source.
//! 2. A publication with an `unknown` source whose role inferred from its
//!    kind and name matches. A name containing `screen` is a screen share
//!    of its kind; anything else is the camera (video) or microphone (audio).
//!
//! Nothing else matches. In particular a known source is never reassigned to
//! another role.

use std::sync::Arc;

use crate::tracks::{LocalTrackPublication, RemoteTrackPublication, TrackKind, TrackSource};

/// A publication as seen by role resolution.
pub trait Resolvable {
    fn source(&self) -> TrackSource;
    fn kind(&self) -> TrackKind;
    fn name(&self) -> &str;
}

impl Resolvable for LocalTrackPublication {
    fn source(&self) -> TrackSource {
        LocalTrackPublication::source(self)
    }

    fn kind(&self) -> TrackKind {
        LocalTrackPublication::kind(self)
    }

    fn name(&self) -> &str {
        self.id()
    }
}

impl Resolvable for RemoteTrackPublication {
    fn source(&self) -> TrackSource {
        RemoteTrackPublication::source(self)
    }

    fn kind(&self) -> TrackKind {
        RemoteTrackPublication::kind(self)
    }

    fn name(&self) -> &str {
        self.id()
    }
}

impl<T: Resolvable + ?Sized> Resolvable for Arc<T> {
    fn source(&self) -> TrackSource {
        (**self).source()
    }

    fn kind(&self) -> TrackKind {
        (**self).kind()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Role of a track whose source is unknown.
#[must_use]
pub fn infer_source(kind: TrackKind, name: &str) -> TrackSource {
    let screen = name.to_ascii_lowercase().contains("screen");
    match (kind, screen) {
        (TrackKind::Video, true) => TrackSource::ScreenVideo,
        (TrackKind::Audio, true) => TrackSource::ScreenAudio,
        (TrackKind::Video, false) => TrackSource::Camera,
        (TrackKind::Audio, false) => TrackSource::Microphone,
    }
}

/// Pick the publication filling `source`.
pub fn resolve<'a, P, I>(candidates: I, source: TrackSource) -> Option<&'a P>
where
    P: Resolvable + ?Sized + 'a,
    I: IntoIterator<Item = &'a P>,
{
    let candidates: Vec<&P> = candidates.into_iter().collect();

    if let Some(exact) = candidates.iter().find(|p| p.source() == source) {
        return Some(*exact);
    }

    candidates
        .into_iter()
        .filter(|p| p.source() == TrackSource::Unknown)
        .find(|p| infer_source(p.kind(), p.name()) == source)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Candidate {
        source: TrackSource,
        kind: TrackKind,
        name: &'static str,
    }

    impl Resolvable for Candidate {
        fn source(&self) -> TrackSource {
            self.source
        }
        fn kind(&self) -> TrackKind {
            self.kind
        }
        fn name(&self) -> &str {
            self.name
        }
    }

    fn candidate(source: TrackSource, kind: TrackKind, name: &'static str) -> Candidate {
        Candidate { source, kind, name }
    }

    #[test]
    fn test_infer_source_by_kind_and_name() {
        assert_eq!(infer_source(TrackKind::Video, "host-screen"), TrackSource::ScreenVideo);
        assert_eq!(infer_source(TrackKind::Audio, "ScreenAudio"), TrackSource::ScreenAudio);
        assert_eq!(infer_source(TrackKind::Video, "front"), TrackSource::Camera);
        assert_eq!(infer_source(TrackKind::Audio, "mic"), TrackSource::Microphone);
    }

    #[test]
    fn test_exact_match_wins_over_inference() {
        let candidates = [
            candidate(TrackSource::Unknown, TrackKind::Video, "video-0"),
            candidate(TrackSource::Camera, TrackKind::Video, "cam"),
        ];
        let found = resolve(candidates.iter(), TrackSource::Camera).map(|c| c.name);
        assert_eq!(found, Some("cam"));
    }

    #[test]
    fn test_unknown_source_inferred() {
        let candidates = [
            candidate(TrackSource::Unknown, TrackKind::Video, "screen-share"),
            candidate(TrackSource::Unknown, TrackKind::Video, "video-0"),
        ];
        assert_eq!(
            resolve(candidates.iter(), TrackSource::ScreenVideo).map(|c| c.name),
            Some("screen-share")
        );
        assert_eq!(
            resolve(candidates.iter(), TrackSource::Camera).map(|c| c.name),
            Some("video-0")
        );
    }

    #[test]
    fn test_known_source_is_never_reassigned() {
        let candidates = [candidate(TrackSource::ScreenVideo, TrackKind::Video, "video")];
        assert!(resolve(candidates.iter(), TrackSource::Camera).is_none());
    }
}
