//! The local app user.

use common::sync::SerialRunner;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::resolution::resolve;
use crate::errors::{CallError, CallResult};
use crate::media::MediaTransport;
use crate::signaling::messages::TrackState;
use crate::tracks::{
    CaptureDevices, LocalTrack, LocalTrackPublication, MuteChanged, TrackKind, TrackSource,
};

/// Callee progress of the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    None,
    Answered,
    Joined,
}

/// What [`User::set`] needs to create a publication.
pub struct PublishContext<'a> {
    pub transport: &'a MediaTransport,
    pub devices: &'a dyn CaptureDevices,
    pub mute_observer: &'a mpsc::UnboundedSender<MuteChanged>,
}

/// The local participant and its published tracks.
#[derive(Debug)]
pub struct User {
    id: String,
    state: Mutex<ParticipantState>,
    publications: Mutex<BTreeMap<String, Arc<LocalTrackPublication>>>,
    runner: SerialRunner,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(ParticipantState::None),
            publications: Mutex::new(BTreeMap::new()),
            runner: SerialRunner::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ParticipantState {
        *self.state_lock()
    }

    /// `none -> answered`. Idempotent; returns whether the state changed.
    pub fn answer(&self) -> bool {
        let mut state = self.state_lock();
        if *state == ParticipantState::None {
            *state = ParticipantState::Answered;
            return true;
        }
        false
    }

    /// `answered -> joined`.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the user never answered.
    pub fn mark_joined(&self) -> CallResult<()> {
        let mut state = self.state_lock();
        match *state {
            ParticipantState::None => Err(CallError::InvalidState(
                "cannot join before answering".to_string(),
            )),
            ParticipantState::Answered | ParticipantState::Joined => {
                *state = ParticipantState::Joined;
                Ok(())
            }
        }
    }

    pub fn publications(&self) -> Vec<Arc<LocalTrackPublication>> {
        self.publications_lock().values().cloned().collect()
    }

    /// Publication filling `source`, see [`resolve`].
    pub fn publication(&self, source: TrackSource) -> Option<Arc<LocalTrackPublication>> {
        let publications = self.publications_lock();
        resolve(publications.values(), source).cloned()
    }

    /// Wire snapshot of every published track.
    pub fn track_states(&self) -> Vec<TrackState> {
        self.publications_lock()
            .values()
            .map(|p| p.track_state())
            .collect()
    }

    /// Add a send-only transceiver for `track`, register the publication and
    /// schedule renegotiation.
    pub async fn publish(
        &self,
        track: Arc<LocalTrack>,
        transport: &MediaTransport,
    ) -> CallResult<Arc<LocalTrackPublication>> {
        let transceiver = transport.add_transceiver(track.kind()).await?;
        track.bind_transceiver(transceiver);

        let publication = Arc::new(LocalTrackPublication::new(Arc::clone(&track)));
        self.publications_lock()
            .insert(track.id().to_string(), Arc::clone(&publication));
        transport.negotiate();

        info!(
            target: "call.participant",
            track_id = %track.id(),
            source = track.source().as_str(),
            "Track published"
        );
        Ok(publication)
    }

    /// Stop the track, remove its sender and schedule renegotiation.
    pub async fn unpublish(&self, track_id: &str, transport: &MediaTransport) -> CallResult<()> {
        let publication = self
            .publications_lock()
            .remove(track_id)
            .ok_or_else(|| CallError::InvalidState(format!("track {track_id} is not published")))?;

        // The sender comes off the peer connection even when capture refuses
        // to stop, so a later enable cannot add a second transceiver.
        let track = publication.track();
        let stopped = track.stop().await;
        if let Err(e) = &stopped {
            warn!(target: "call.participant", track_id, error = %e, "Capture stop failed while unpublishing");
        }
        let removed = match track.unbind_transceiver() {
            Some(transceiver) => transport.remove_track(&transceiver).await,
            None => Ok(()),
        };
        transport.negotiate();

        stopped?;
        removed?;
        info!(target: "call.participant", track_id, "Track unpublished");
        Ok(())
    }

    /// Enable or disable the track for `source`.
    ///
    /// Entry point for both user toggles and server requests. Calls are
    /// serialized per user so two toggles for a missing source cannot both
    /// create a publication. Enabling a missing source captures, publishes,
    /// starts muted and then unmutes, which forces the first negotiation.
    pub async fn set(
        &self,
        source: TrackSource,
        enabled: bool,
        ctx: &PublishContext<'_>,
    ) -> CallResult<()> {
        self.runner
            .run(async {
                match (self.publication(source), enabled) {
                    (Some(publication), true) => {
                        publication.track().start().await?;
                        publication.unmute().await
                    }
                    (Some(publication), false) => publication.mute().await,
                    (None, false) => {
                        debug!(target: "call.participant", source = source.as_str(), "Nothing to disable");
                        Ok(())
                    }
                    (None, true) => self.create_publication(source, ctx).await,
                }
            })
            .await
    }

    async fn create_publication(
        &self,
        source: TrackSource,
        ctx: &PublishContext<'_>,
    ) -> CallResult<()> {
        let kind: TrackKind = source.kind().ok_or_else(|| {
            CallError::InvalidState(format!("cannot capture source {}", source.as_str()))
        })?;
        let capturer = ctx.devices.capturer(source).await?;

        let track = Arc::new(
            LocalTrack::new(Uuid::new_v4().to_string(), kind, source, capturer, true)
                .with_mute_observer(ctx.mute_observer.clone()),
        );
        let publication = self.publish(Arc::clone(&track), ctx.transport).await?;

        let started: CallResult<()> = async {
            track.start().await?;
            publication.unmute().await
        }
        .await;

        if let Err(e) = started {
            warn!(
                target: "call.participant",
                source = source.as_str(),
                error = %e,
                "Track failed to start, unpublishing"
            );
            if let Err(unpublish_error) = self.unpublish(track.id(), ctx.transport).await {
                debug!(target: "call.participant", error = %unpublish_error, "Unpublish after failed start failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Temporarily mute every video publication.
    pub async fn suspend_video(&self) {
        for publication in self.video_publications() {
            if let Err(e) = publication.suspend().await {
                warn!(target: "call.participant", track_id = %publication.id(), error = %e, "Suspend failed");
            }
        }
    }

    /// Undo [`User::suspend_video`].
    pub async fn resume_video(&self) {
        for publication in self.video_publications() {
            if let Err(e) = publication.resume().await {
                warn!(target: "call.participant", track_id = %publication.id(), error = %e, "Resume failed");
            }
        }
    }

    /// Stop every track and drop all publications. Used at teardown, after
    /// the transport has been closed.
    pub async fn stop_all(&self) {
        let publications: Vec<_> = std::mem::take(&mut *self.publications_lock())
            .into_values()
            .collect();
        for publication in publications {
            let track = publication.track();
            if let Err(e) = track.stop().await {
                warn!(target: "call.participant", track_id = %track.id(), error = %e, "Track stop failed");
            }
            track.unbind_transceiver();
        }
    }

    fn video_publications(&self) -> Vec<Arc<LocalTrackPublication>> {
        self.publications_lock()
            .values()
            .filter(|p| p.kind() == TrackKind::Video)
            .cloned()
            .collect()
    }

    fn state_lock(&self) -> MutexGuard<'_, ParticipantState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publications_lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<LocalTrackPublication>>> {
        self.publications.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
