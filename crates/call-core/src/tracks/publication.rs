//! Track publications.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use super::{LocalTrack, RemoteTrack, TrackKind, TrackSource};
use crate::errors::CallResult;
use crate::signaling::messages::TrackState;

#[derive(Debug, Default)]
struct Suspension {
    suspended: bool,
    /// User's own mute choice, tracked while suspended.
    muted_by_user: bool,
}

/// A local track published by the user.
///
/// Suspension mutes the track temporarily (for example while the app is in
/// the background) without losing what the user asked for: mute and unmute
/// requests made while suspended are remembered and applied on resume.
#[derive(Debug)]
pub struct LocalTrackPublication {
    track: Arc<LocalTrack>,
    suspension: AsyncMutex<Suspension>,
}

impl LocalTrackPublication {
    pub fn new(track: Arc<LocalTrack>) -> Self {
        Self {
            track,
            suspension: AsyncMutex::new(Suspension::default()),
        }
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn track(&self) -> &Arc<LocalTrack> {
        &self.track
    }

    pub fn kind(&self) -> TrackKind {
        self.track.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.track.source()
    }

    pub fn track_state(&self) -> TrackState {
        self.track.track_state()
    }

    pub async fn is_suspended(&self) -> bool {
        self.suspension.lock().await.suspended
    }

    /// User asked to mute.
    pub async fn mute(&self) -> CallResult<()> {
        let mut suspension = self.suspension.lock().await;
        if suspension.suspended {
            suspension.muted_by_user = true;
            return Ok(());
        }
        self.track.mute().await
    }

    /// User asked to unmute. Deferred until resume while suspended.
    pub async fn unmute(&self) -> CallResult<()> {
        let mut suspension = self.suspension.lock().await;
        if suspension.suspended {
            suspension.muted_by_user = false;
            return Ok(());
        }
        self.track.unmute().await
    }

    /// Mute temporarily, remembering the user's choice.
    pub async fn suspend(&self) -> CallResult<()> {
        let mut suspension = self.suspension.lock().await;
        if suspension.suspended {
            return Ok(());
        }
        suspension.muted_by_user = self.track.is_muted();
        suspension.suspended = true;
        debug!(target: "call.track", track_id = %self.id(), "Publication suspended");
        if !suspension.muted_by_user {
            self.track.mute().await?;
        }
        Ok(())
    }

    /// Undo [`suspend`](Self::suspend). Unmutes only if the user had not muted.
    pub async fn resume(&self) -> CallResult<()> {
        let mut suspension = self.suspension.lock().await;
        if !suspension.suspended {
            return Ok(());
        }
        suspension.suspended = false;
        debug!(target: "call.track", track_id = %self.id(), "Publication resumed");
        if suspension.muted_by_user {
            self.track.mute().await
        } else {
            self.track.unmute().await
        }
    }
}

/// Whether a remote publication has a live track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribed,
}

#[derive(Debug)]
struct RemoteInner {
    track: Option<Arc<RemoteTrack>>,
    subscription: SubscriptionState,
    muted: bool,
}

/// A track a host advertised over signaling.
///
/// The bound track and the subscription state change together under one
/// lock, so a concurrent mute update never sees a track without its
/// subscription or the reverse.
#[derive(Debug)]
pub struct RemoteTrackPublication {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    inner: Mutex<RemoteInner>,
}

impl RemoteTrackPublication {
    pub fn new(id: impl Into<String>, kind: TrackKind, source: TrackSource, muted: bool) -> Self {
        Self {
            id: id.into(),
            kind,
            source,
            inner: Mutex::new(RemoteInner {
                track: None,
                subscription: SubscriptionState::Unsubscribed,
                muted,
            }),
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

    pub fn track(&self) -> Option<Arc<RemoteTrack>> {
        self.lock().track.clone()
    }

    pub fn subscription(&self) -> SubscriptionState {
        self.lock().subscription
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription() == SubscriptionState::Subscribed
    }

    pub fn is_muted(&self) -> bool {
        self.lock().muted
    }

    /// Apply the host's mute flag, enabling or disabling the bound track.
    pub fn set_muted(&self, muted: bool) {
        let mut inner = self.lock();
        inner.muted = muted;
        if let Some(track) = &inner.track {
            track.set_enabled(!muted);
        }
    }

    /// Bind a negotiated track and mark the publication subscribed.
    pub fn subscribe(&self, track: Arc<RemoteTrack>) {
        let mut inner = self.lock();
        track.set_enabled(!inner.muted);
        inner.track = Some(track);
        inner.subscription = SubscriptionState::Subscribed;
    }

    /// Drop the bound track.
    pub fn unsubscribe(&self) -> Option<Arc<RemoteTrack>> {
        let mut inner = self.lock();
        inner.subscription = SubscriptionState::Unsubscribed;
        inner.track.take()
    }

    /// Unsubscribed and unmuted: the next reconciliation should pull it.
    pub fn needs_pull(&self) -> bool {
        let inner = self.lock();
        inner.subscription == SubscriptionState::Unsubscribed && !inner.muted
    }

    fn lock(&self) -> MutexGuard<'_, RemoteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
