//! The call orchestrator.
//!
//! A [`Call`] owns one signaling channel, one media transport, the local
//! [`User`] and every remote [`Host`]. Its lifecycle is
//! `disconnected -> connecting -> connected -> disconnected`; an ended call
//! is never reused.
//!
//! # Readiness
//!
//! Three completions gate the callee path:
//!
//! - `socket_ready`: signaling connected, session created, ICE fetched
//! - `peer_connected`: the media transport reported `connected`
//! - `transport_ready`: the track snapshot went out and the outbound queue
//!   was resumed, so an `accept` can no longer be dropped
//!
//! `join` waits for `socket_ready` and `transport_ready`; a timeout is a
//! failure like any other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::secret::SecretString;
use common::sync::Completion;
use common::types::{CallId, SessionId};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::actor::{CallActor, CallEvent};
use super::events::{CallDependencies, ConnectionState, EndReason};
use crate::api::{PushTracksRequest, PushedTrack};
use crate::config::Config;
use crate::errors::{CallError, CallResult};
use crate::media::{
    MediaTransport, PeerConnectionState, SessionDescription, StatsReport, TransportDelegate,
};
use crate::observability::metrics;
use crate::participants::{Host, PublishContext, PullContext, User};
use crate::signaling::messages::{
    AppState, CallUpdate, ParticipantRole, ParticipantUpdate, TrackState,
};
use crate::signaling::{Disposition, InboundMessage, OutboundMessage, SignalingChannel};
use crate::tracks::{MuteChanged, TrackSource};

/// Handle to a call. Cloning shares the same call.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

pub(super) struct CallInner {
    id: CallId,
    connect_timeout: Duration,
    transport_timeout: Duration,
    negotiation_debounce: Duration,
    deps: CallDependencies,
    state: watch::Sender<ConnectionState>,
    signaling: SignalingChannel,
    session: Mutex<Option<SessionId>>,
    transport: Mutex<Option<MediaTransport>>,
    user: User,
    hosts: Mutex<BTreeMap<String, Arc<Host>>>,
    caller_name: Mutex<Option<String>>,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    socket_ready: Completion<(), CallError>,
    peer_connected: Completion<(), CallError>,
    transport_ready: Completion<(), CallError>,
    peer_tx: mpsc::UnboundedSender<PeerConnectionState>,
    mute_tx: mpsc::UnboundedSender<MuteChanged>,
    pending_actor: Mutex<Option<CallActor>>,
    ended: AtomicBool,
    cancel: CancellationToken,
}

impl Call {
    /// Create a disconnected call. Nothing is opened until [`Call::connect`].
    pub fn new(id: CallId, config: &Config, deps: CallDependencies) -> Self {
        let (signaling, receivers) =
            SignalingChannel::new(Arc::clone(&deps.connector), config.connect_timeout);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (mute_tx, mute_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new_cyclic(|weak: &Weak<CallInner>| {
            let actor = CallActor::new(
                weak.clone(),
                id,
                receivers,
                peer_rx,
                mute_rx,
                cancel.clone(),
            );
            CallInner {
                id,
                connect_timeout: config.connect_timeout,
                transport_timeout: config.transport_timeout,
                negotiation_debounce: config.negotiation_debounce,
                deps,
                state,
                signaling,
                session: Mutex::new(None),
                transport: Mutex::new(None),
                user: User::new(format!("user-{id}")),
                hosts: Mutex::new(BTreeMap::new()),
                caller_name: Mutex::new(None),
                connected_at: Mutex::new(None),
                socket_ready: Completion::new(),
                peer_connected: Completion::new(),
                transport_ready: Completion::new(),
                peer_tx,
                mute_tx,
                pending_actor: Mutex::new(Some(actor)),
                ended: AtomicBool::new(false),
                cancel,
            }
        });

        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> CallId {
        self.inner.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe connection state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// Cancelled once the call has ended.
    #[must_use]
    pub fn ended_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    #[must_use]
    pub fn user(&self) -> &User {
        &self.inner.user
    }

    #[must_use]
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.inner.hosts_lock().values().cloned().collect()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.session()
    }

    #[must_use]
    pub fn caller_name(&self) -> Option<String> {
        self.inner
            .caller_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .connected_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Establish signaling and media.
    ///
    /// No-op while already connecting or connected. Session creation, ICE
    /// fetch and the signaling connect run concurrently; any failure ends
    /// the call, which is then discarded.
    ///
    /// # Errors
    ///
    /// The first failure of any step, `Timeout` included. `InvalidState` if
    /// the call already ended.
    #[instrument(skip_all, name = "call.connect", fields(call_id = %self.inner.id))]
    pub async fn connect(
        &self,
        credential: &SecretString,
        caller_name: &str,
        url: &str,
    ) -> CallResult<()> {
        if self.is_ended() {
            return Err(CallError::InvalidState("call has ended".to_string()));
        }

        let claimed = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!(target: "call.orchestrator", state = self.state().as_str(), "Connect ignored");
            return Ok(());
        }

        *self
            .inner
            .caller_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(caller_name.to_string());
        info!(target: "call.orchestrator", call_id = %self.inner.id, "Connecting call");

        let start = Instant::now();
        match self.establish(credential, url).await {
            Ok(()) => {
                metrics::record_connect("success", None, start.elapsed());
                info!(
                    target: "call.orchestrator",
                    call_id = %self.inner.id,
                    duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Call connected"
                );
                Ok(())
            }
            Err(e) => {
                metrics::record_connect("error", Some(e.error_type()), start.elapsed());
                warn!(
                    target: "call.orchestrator",
                    call_id = %self.inner.id,
                    error = %e,
                    error_type = e.error_type(),
                    "Call failed to connect"
                );
                self.inner.socket_ready.fail(e.clone());
                self.inner.transport_ready.fail(e.clone());
                self.inner.shutdown(EndReason::ConnectFailed, false).await;
                // A concurrent end may have run before media was set up.
                self.inner.release_media().await;
                Err(e)
            }
        }
    }

    async fn establish(&self, credential: &SecretString, url: &str) -> CallResult<()> {
        let inner = &self.inner;

        let (session, ice, connected) = tokio::try_join!(
            inner.deps.api.create_session(),
            inner.deps.api.fetch_ice_configuration(),
            inner.signaling.connect(credential, url),
        )?;
        debug!(
            target: "call.orchestrator",
            session_id = %session,
            connection_id = ?connected.connection_id,
            ice_servers = ice.ice_servers.len(),
            "Session and signaling ready"
        );
        *inner.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        inner.socket_ready.resume(());

        let peer = inner.deps.engine.create(&ice).await?;
        let delegate: Weak<dyn TransportDelegate> =
            Arc::downgrade(&self.inner) as Weak<dyn TransportDelegate>;
        let transport = MediaTransport::new(peer, delegate, inner.negotiation_debounce);
        *inner.transport.lock().unwrap_or_else(PoisonError::into_inner) = Some(transport.clone());
        if self.is_ended() {
            return Err(CallError::InvalidState("call ended while connecting".to_string()));
        }

        let actor = inner
            .pending_actor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(actor) = actor {
            tokio::spawn(actor.run());
        }

        inner
            .user
            .set(TrackSource::Microphone, true, &inner.publish_context(&transport))
            .await?;

        inner.peer_connected.wait_timeout(inner.transport_timeout).await?;
        if self.is_ended() {
            return Err(CallError::InvalidState("call ended while connecting".to_string()));
        }

        let snapshot = inner.user.track_states();
        inner
            .signaling
            .send(OutboundMessage::UpdateTracks(snapshot))
            .await?;
        let flushed = inner.signaling.resume_outbound().await;
        debug!(target: "call.orchestrator", flushed, "Outbound queue resumed");

        *inner
            .connected_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        inner.set_state(ConnectionState::Connected);
        inner.transport_ready.resume(());
        inner.deps.reporter.report_call_connected(inner.id);
        Ok(())
    }

    /// Callee answered. Idempotent.
    pub fn answer(&self) {
        if self.inner.user.answer() {
            info!(target: "call.orchestrator", call_id = %self.inner.id, "Call answered");
        }
    }

    /// Join an answered call once signaling and media are ready.
    ///
    /// Sends `accept` (falling back to the REST accept when it could not be
    /// delivered), then releases buffered inbound events.
    ///
    /// # Errors
    ///
    /// `InvalidState` before [`Call::answer`]; `Timeout` or the connect
    /// failure if readiness never arrives.
    #[instrument(skip_all, name = "call.join", fields(call_id = %self.inner.id))]
    pub async fn join(&self) -> CallResult<()> {
        let inner = &self.inner;
        match inner.user.state() {
            crate::participants::ParticipantState::Joined => return Ok(()),
            crate::participants::ParticipantState::None => {
                return Err(CallError::InvalidState(
                    "call must be answered before joining".to_string(),
                ));
            }
            crate::participants::ParticipantState::Answered => {}
        }

        inner.socket_ready.wait_timeout(inner.connect_timeout).await?;
        inner
            .transport_ready
            .wait_timeout(inner.transport_timeout)
            .await?;

        match inner.signaling.send(OutboundMessage::Accept).await {
            Ok(Disposition::Delivered) => {}
            outcome => {
                warn!(
                    target: "call.orchestrator",
                    call_id = %inner.id,
                    outcome = ?outcome,
                    "Accept not delivered over signaling, using REST"
                );
                inner.deps.api.accept_call(inner.id).await?;
            }
        }

        let released = inner.signaling.resume_inbound().await;
        inner.user.mark_joined()?;
        info!(target: "call.orchestrator", call_id = %inner.id, released, "Call joined");
        Ok(())
    }

    /// End the call if `uuid` is this call. Idempotent.
    pub async fn end(&self, uuid: CallId) {
        if uuid != self.inner.id {
            debug!(
                target: "call.orchestrator",
                call_id = %self.inner.id,
                requested = %uuid,
                "End ignored for another call"
            );
            return;
        }
        self.inner.shutdown(EndReason::LocalHangup, true).await;
    }

    /// Report the app moving between foreground and background. Background
    /// suspends local video; foreground resumes it.
    ///
    /// # Errors
    ///
    /// `InvalidState` if signaling is not connected. Video is suspended or
    /// resumed regardless.
    pub async fn set_app_state(&self, app_state: AppState) -> CallResult<()> {
        let sent = self
            .inner
            .signaling
            .send(OutboundMessage::UpdateParticipant(ParticipantUpdate { app_state }))
            .await;

        match app_state {
            AppState::Background => self.inner.user.suspend_video().await,
            AppState::Foreground => self.inner.user.resume_video().await,
        }
        sent.map(|_| ())
    }

    /// Sample transport statistics. Failures are logged and yield `None`.
    pub async fn statistics(&self) -> Option<StatsReport> {
        let transport = self.inner.transport()?;
        match transport.statistics(None).await {
            Ok(report) => Some(report),
            Err(e) => {
                debug!(target: "call.orchestrator", error = %e, "Statistics unavailable");
                None
            }
        }
    }
}

impl CallInner {
    fn session(&self) -> Option<SessionId> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transport(&self) -> Option<MediaTransport> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn hosts_lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Host>>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(
                target: "call.orchestrator",
                call_id = %self.id,
                from = previous.as_str(),
                to = next.as_str(),
                "Connection state changed"
            );
        }
    }

    fn publish_context<'a>(&'a self, transport: &'a MediaTransport) -> PublishContext<'a> {
        PublishContext {
            transport,
            devices: self.deps.devices.as_ref(),
            mute_observer: &self.mute_tx,
        }
    }

    /// Close the transport and stop local tracks. Idempotent.
    async fn release_media(&self) {
        let transport = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.user.stop_all().await;
    }

    /// Tear everything down exactly once.
    pub(super) async fn shutdown(&self, reason: EndReason, notify_server: bool) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            target: "call.orchestrator",
            call_id = %self.id,
            reason = reason.as_str(),
            "Ending call"
        );
        self.deps.reporter.report_call_ended(self.id, reason);

        if notify_server {
            let delivered = matches!(
                self.signaling.send(OutboundMessage::End).await,
                Ok(Disposition::Delivered)
            );
            if !delivered {
                debug!(target: "call.orchestrator", call_id = %self.id, "End not delivered over signaling, using REST");
                if let Err(e) = self.deps.api.end_call(self.id).await {
                    warn!(target: "call.orchestrator", call_id = %self.id, error = %e, "REST end call failed");
                }
            }
        }

        self.signaling.disconnect().await;
        self.release_media().await;

        let hosts = std::mem::take(&mut *self.hosts_lock());
        for host in hosts.into_values() {
            host.clear();
        }

        self.set_state(ConnectionState::Disconnected);
        let ended = CallError::Disconnected(format!("call ended: {}", reason.as_str()));
        self.socket_ready.fail(ended.clone());
        self.peer_connected.fail(ended.clone());
        self.transport_ready.fail(ended);
        self.cancel.cancel();

        metrics::record_call_ended(reason.as_str());
        let connected_at = *self
            .connected_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        info!(
            target: "call.orchestrator",
            call_id = %self.id,
            reason = reason.as_str(),
            duration_secs = connected_at.map(|at| (Utc::now() - at).num_seconds()),
            "Call ended"
        );
    }

    /// Handle one event from the actor loop.
    pub(super) async fn handle_event(&self, event: CallEvent) {
        match event {
            CallEvent::Inbound(InboundMessage::CallUpdated(update)) => {
                self.handle_call_update(update).await;
            }
            CallEvent::Inbound(InboundMessage::CallEnded(ended)) => {
                if ended.call_id == self.id {
                    self.shutdown(EndReason::RemoteEnded, false).await;
                } else {
                    debug!(target: "call.orchestrator", other = %ended.call_id, "Ignoring call.ended for another call");
                }
            }
            CallEvent::Inbound(other) => {
                debug!(target: "call.orchestrator", message = ?other, "Ignoring inbound message");
            }
            CallEvent::ChannelClosed(closed) => {
                warn!(
                    target: "call.orchestrator",
                    call_id = %self.id,
                    reason = ?closed.reason,
                    "Signaling closed under a live call"
                );
                self.shutdown(EndReason::ConnectionLost, true).await;
            }
            CallEvent::PeerState(state) => self.handle_peer_state(state).await,
            CallEvent::MuteChanged(MuteChanged(track)) => self.send_track_update(track).await,
        }
    }

    async fn handle_peer_state(&self, peer_state: PeerConnectionState) {
        match (peer_state, self.current_state()) {
            (PeerConnectionState::Disconnected, ConnectionState::Connected) => {
                warn!(target: "call.orchestrator", call_id = %self.id, "Media transport interrupted");
                self.set_state(ConnectionState::Reconnecting);
            }
            (PeerConnectionState::Connected, ConnectionState::Reconnecting) => {
                info!(target: "call.orchestrator", call_id = %self.id, "Media transport recovered");
                self.set_state(ConnectionState::Connected);
            }
            (PeerConnectionState::Failed, _) => {
                warn!(target: "call.orchestrator", call_id = %self.id, "Media transport failed");
                self.shutdown(EndReason::Failed, true).await;
            }
            _ => {}
        }
    }

    async fn send_track_update(&self, track: TrackState) {
        match self.signaling.send(OutboundMessage::UpdateTrack(track)).await {
            Ok(disposition) => {
                debug!(target: "call.orchestrator", disposition = disposition.as_str(), "Track update sent");
            }
            Err(e) => {
                debug!(target: "call.orchestrator", error = %e, "Track update not sent");
            }
        }
    }

    /// Apply a `call.updated` event: the user's entries drive local track
    /// intent, host entries drive reconciliation and pulls. Hosts missing
    /// from the list are dropped.
    async fn handle_call_update(&self, update: CallUpdate) {
        if update.call_id != self.id {
            debug!(target: "call.orchestrator", other = %update.call_id, "Ignoring call.updated for another call");
            return;
        }
        let Some(transport) = self.transport() else {
            debug!(target: "call.orchestrator", "No transport yet, ignoring call.updated");
            return;
        };

        let mut listed = HashSet::new();
        for participant in &update.participants {
            match participant.role {
                ParticipantRole::User => {
                    let ctx = self.publish_context(&transport);
                    for track in &participant.tracks {
                        let (_, source) = track.track_type.kind_and_source();
                        if let Err(e) = self.user.set(source, !track.muted, &ctx).await {
                            warn!(
                                target: "call.orchestrator",
                                source = source.as_str(),
                                error = %e,
                                "Requested track change failed"
                            );
                        }
                    }
                }
                ParticipantRole::Host => {
                    listed.insert(participant.id.clone());
                    let host = Arc::clone(
                        self.hosts_lock()
                            .entry(participant.id.clone())
                            .or_insert_with(|| {
                                info!(target: "call.orchestrator", host_id = %participant.id, "Host joined");
                                Arc::new(Host::new(participant.id.clone()))
                            }),
                    );
                    let to_pull = host.update(participant);
                    if to_pull.is_empty() {
                        continue;
                    }
                    let Some(session) = self.session() else {
                        continue;
                    };
                    let ctx = PullContext {
                        api: self.deps.api.as_ref(),
                        transport: &transport,
                        session: &session,
                    };
                    // Failures are logged by `pull`; the call stays up.
                    let _ = host.pull(&to_pull, &ctx).await;
                }
            }
        }

        let departed: Vec<Arc<Host>> = {
            let mut hosts = self.hosts_lock();
            let gone: Vec<String> = hosts
                .keys()
                .filter(|id| !listed.contains(*id))
                .cloned()
                .collect();
            gone.iter().filter_map(|id| hosts.remove(id)).collect()
        };
        for host in departed {
            info!(target: "call.orchestrator", host_id = %host.id(), "Host left");
            host.clear();
        }
    }
}

#[async_trait]
impl TransportDelegate for CallInner {
    /// Push every local track with a negotiated mid together with the offer;
    /// the push response carries the answer.
    async fn on_offer(&self, offer: SessionDescription) -> CallResult<SessionDescription> {
        let session = self
            .session()
            .ok_or_else(|| CallError::InvalidState("no media session".to_string()))?;
        let transport = self
            .transport()
            .ok_or_else(|| CallError::InvalidState("no media transport".to_string()))?;

        let mut tracks = Vec::new();
        for publication in self.user.publications() {
            let Some(transceiver) = publication.track().transceiver() else {
                continue;
            };
            if let Some(mid) = transport.transceiver_mid(&transceiver).await {
                tracks.push(PushedTrack {
                    mid,
                    track_name: publication.id().to_string(),
                });
            }
        }

        let response = self
            .deps
            .api
            .push_tracks(
                &session,
                &PushTracksRequest {
                    session_description: offer,
                    tracks,
                },
            )
            .await?;

        for (name, description) in response.failed_tracks() {
            warn!(target: "call.orchestrator", track = %name, error = %description, "Control plane rejected pushed track");
        }

        response
            .session_description
            .ok_or_else(|| CallError::InvalidState("push response carried no answer".to_string()))
    }

    fn on_connection_state(&self, state: PeerConnectionState) {
        if state == PeerConnectionState::Connected {
            self.peer_connected.resume(());
        }
        let _ = self.peer_tx.send(state);
    }
}
