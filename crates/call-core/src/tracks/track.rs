//! Local and remote tracks.

use common::sync::SerialRunner;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Capturer, TrackKind, TrackSource};
use crate::errors::CallResult;
use crate::media::TransceiverHandle;
use crate::signaling::messages::{TrackState, WireTrackType};

/// Whether a local track's capture has been started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Started,
}

/// Emitted whenever a local track's mute flag actually changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteChanged(pub TrackState);

#[derive(Debug)]
struct LocalState {
    lifecycle: LifecycleState,
    muted: bool,
    capturing: bool,
    transceiver: Option<TransceiverHandle>,
}

/// A track fed by a local capture pipeline.
///
/// `start`, `stop`, `mute` and `unmute` are transitions; they run one at a
/// time through the track's serial runner. Muting a video track releases the
/// capture device, unmuting acquires it again before frames are let through.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    capturer: Arc<dyn Capturer>,
    runner: SerialRunner,
    state: Mutex<LocalState>,
    mute_observer: Option<mpsc::UnboundedSender<MuteChanged>>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl LocalTrack {
    /// Create a stopped track.
    pub fn new(
        id: impl Into<String>,
        kind: TrackKind,
        source: TrackSource,
        capturer: Arc<dyn Capturer>,
        muted: bool,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            source,
            capturer,
            runner: SerialRunner::new(),
            state: Mutex::new(LocalState {
                lifecycle: LifecycleState::Stopped,
                muted,
                capturing: false,
                transceiver: None,
            }),
            mute_observer: None,
        }
    }

    /// Report mute changes to `observer`.
    #[must_use]
    pub fn with_mute_observer(mut self, observer: mpsc::UnboundedSender<MuteChanged>) -> Self {
        self.mute_observer = Some(observer);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn is_muted(&self) -> bool {
        self.lock().muted
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lock().lifecycle
    }

    pub fn transceiver(&self) -> Option<TransceiverHandle> {
        self.lock().transceiver.clone()
    }

    pub fn bind_transceiver(&self, transceiver: TransceiverHandle) {
        self.lock().transceiver = Some(transceiver);
    }

    pub fn unbind_transceiver(&self) -> Option<TransceiverHandle> {
        self.lock().transceiver.take()
    }

    /// Current state as reported on the wire.
    pub fn track_state(&self) -> TrackState {
        TrackState {
            id: self.id.clone(),
            track_type: WireTrackType::from_source(self.kind, self.source),
            muted: self.is_muted(),
        }
    }

    /// Start capture. No-op when already started.
    ///
    /// A muted video track stays off the device until it is unmuted.
    pub async fn start(&self) -> CallResult<()> {
        self.runner
            .run(async {
                let (lifecycle, muted) = {
                    let state = self.lock();
                    (state.lifecycle, state.muted)
                };
                if lifecycle == LifecycleState::Started {
                    return Ok(());
                }

                let capture = !(muted && self.kind == TrackKind::Video);
                if capture {
                    self.capturer.start().await?;
                }
                self.capturer.set_enabled(!muted);

                let mut state = self.lock();
                state.lifecycle = LifecycleState::Started;
                state.capturing = capture;
                debug!(target: "call.track", track_id = %self.id, capture, "Track started");
                Ok(())
            })
            .await
    }

    /// Stop capture. No-op when already stopped.
    pub async fn stop(&self) -> CallResult<()> {
        self.runner
            .run(async {
                let (lifecycle, capturing) = {
                    let state = self.lock();
                    (state.lifecycle, state.capturing)
                };
                if lifecycle == LifecycleState::Stopped {
                    return Ok(());
                }

                self.capturer.set_enabled(false);
                if capturing {
                    self.capturer.stop().await?;
                }

                let mut state = self.lock();
                state.lifecycle = LifecycleState::Stopped;
                state.capturing = false;
                debug!(target: "call.track", track_id = %self.id, "Track stopped");
                Ok(())
            })
            .await
    }

    /// Stop frames reaching the sink. Video also releases the device.
    pub async fn mute(&self) -> CallResult<()> {
        self.runner
            .run(async {
                let (muted, capturing) = {
                    let state = self.lock();
                    (state.muted, state.capturing)
                };
                if muted {
                    return Ok(());
                }

                self.capturer.set_enabled(false);
                if self.kind == TrackKind::Video && capturing {
                    self.capturer.stop().await?;
                    self.lock().capturing = false;
                }

                self.lock().muted = true;
                self.notify_mute(true);
                Ok(())
            })
            .await
    }

    /// Let frames reach the sink again, starting video capture first.
    pub async fn unmute(&self) -> CallResult<()> {
        self.runner
            .run(async {
                let (muted, lifecycle, capturing) = {
                    let state = self.lock();
                    (state.muted, state.lifecycle, state.capturing)
                };
                if !muted {
                    return Ok(());
                }

                if lifecycle == LifecycleState::Started && !capturing {
                    self.capturer.start().await?;
                    self.lock().capturing = true;
                }
                if lifecycle == LifecycleState::Started {
                    self.capturer.set_enabled(true);
                }

                self.lock().muted = false;
                self.notify_mute(false);
                Ok(())
            })
            .await
    }

    fn notify_mute(&self, muted: bool) {
        info!(target: "call.track", track_id = %self.id, muted, "Track mute changed");
        if let Some(observer) = &self.mute_observer {
            if observer.send(MuteChanged(self.track_state())).is_err() {
                warn!(target: "call.track", track_id = %self.id, "Mute observer is gone");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A track received from a host over a negotiated media line.
#[derive(Debug)]
pub struct RemoteTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    mid: Option<String>,
    enabled: AtomicBool,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, source: TrackSource, mid: Option<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            source,
            mid,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn mid(&self) -> Option<&str> {
        self.mid.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}
