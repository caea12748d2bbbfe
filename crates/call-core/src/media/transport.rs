//! Media transport.
//!
//! Wraps one [`PeerConnection`] and is the only path through which session
//! descriptions are mutated. Exactly one task at a time owns description
//! mutation; everything else either waits for ownership
//! ([`MediaTransport::accept_remote_offer`]), defers
//! ([`MediaTransport::negotiate_now`] while busy), or buffers
//! ([`MediaTransport::set_remote_description`] while busy).
//!
//! # Glare
//!
//! An offer is only created from the `stable` state. When negotiation is
//! requested while the connection still has an unanswered local offer, the
//! request is recorded in a `renegotiate` flag. A buffered remote description
//! is applied first if one exists. After any remote description is applied
//! the flag is consumed and exactly one fresh offer is created.

use async_trait::async_trait;
use common::sync::Debouncer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::engine::{
    PeerConnection, PeerConnectionState, SessionDescription, SignalingState, StatsReport,
    TrackKind, TransceiverDirection, TransceiverHandle,
};
use crate::errors::{CallError, CallResult};
use crate::observability::metrics;

/// Owner-side callbacks of a media transport.
#[async_trait]
pub trait TransportDelegate: Send + Sync {
    /// Round-trip a local offer to the remote side and return its answer.
    async fn on_offer(&self, offer: SessionDescription) -> CallResult<SessionDescription>;

    /// Peer connection state changed.
    fn on_connection_state(&self, state: PeerConnectionState);
}

/// What happened to a remote description handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDescriptionOutcome {
    Applied,
    /// Another task owns description mutation; it will apply this one
    /// before releasing ownership. A later buffered description replaces it.
    Buffered,
}

/// How a releasing owner handles a renegotiation recorded while it owned
/// description mutation.
#[derive(Debug, Clone, Copy)]
enum Deferred {
    /// Keep ownership and run the offer round before releasing.
    RunInline,
    /// Release first and schedule through the debounce window.
    Debounce,
}

enum ReleaseStep {
    Apply(SessionDescription),
    Offer,
}

#[derive(Debug, Default)]
struct NegotiationState {
    busy: bool,
    renegotiate: bool,
    pending_remote: Option<SessionDescription>,
}

struct TransportInner {
    peer: Arc<dyn PeerConnection>,
    delegate: Weak<dyn TransportDelegate>,
    negotiation: Mutex<NegotiationState>,
    idle: Notify,
    debouncer: Debouncer,
    closed: AtomicBool,
    cancel: CancellationToken,
}

/// Handle to a media transport. Cloning shares the same transport.
#[derive(Clone)]
pub struct MediaTransport {
    inner: Arc<TransportInner>,
}

impl std::fmt::Debug for MediaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTransport")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MediaTransport {
    /// Wrap a peer connection and start forwarding its connection state to
    /// `delegate`. Must be called inside a tokio runtime.
    pub fn new(
        peer: Arc<dyn PeerConnection>,
        delegate: Weak<dyn TransportDelegate>,
        negotiation_debounce: Duration,
    ) -> Self {
        let inner = Arc::new(TransportInner {
            peer,
            delegate,
            negotiation: Mutex::new(NegotiationState::default()),
            idle: Notify::new(),
            debouncer: Debouncer::new(negotiation_debounce),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(watch_connection_state(Arc::downgrade(&inner)));

        Self { inner }
    }

    /// Whether [`MediaTransport::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Current offer/answer state of the peer connection.
    #[must_use]
    pub fn signaling_state(&self) -> SignalingState {
        self.inner.peer.signaling_state()
    }

    /// Request renegotiation. Bursts inside the debounce window coalesce
    /// into a single offer.
    pub fn negotiate(&self) {
        if self.is_closed() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.debouncer.call(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let transport = MediaTransport { inner };
            if let Err(e) = transport.negotiate_now().await {
                warn!(
                    target: "call.transport",
                    error = %e,
                    error_type = e.error_type(),
                    "Renegotiation failed"
                );
            }
        });
    }

    /// Run negotiation immediately, bypassing the debounce window.
    ///
    /// Defers (returns `Ok`) when another task owns description mutation or
    /// when a local offer is still waiting for its answer.
    #[instrument(skip_all, name = "transport.negotiate")]
    pub async fn negotiate_now(&self) -> CallResult<()> {
        self.ensure_open()?;

        {
            let mut state = self.inner.negotiation.lock().await;
            if state.busy {
                debug!(target: "call.transport", "Negotiation in progress, deferring");
                state.renegotiate = true;
                metrics::record_negotiation("deferred");
                return Ok(());
            }
            state.busy = true;
        }

        let result = self.offer_loop().await;
        self.release(Deferred::RunInline).await;
        result
    }

    /// Apply a local description.
    pub async fn set_local_description(&self, description: SessionDescription) -> CallResult<()> {
        self.ensure_open()?;
        self.claim().await;
        let result = self.inner.peer.set_local_description(description).await;
        self.release(Deferred::RunInline).await;
        result
    }

    /// Apply a remote description, or buffer it if another task currently
    /// owns description mutation.
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> CallResult<RemoteDescriptionOutcome> {
        self.ensure_open()?;

        {
            let mut state = self.inner.negotiation.lock().await;
            if state.busy {
                debug!(
                    target: "call.transport",
                    kind = ?description.kind,
                    "Description mutation busy, buffering remote description"
                );
                state.pending_remote = Some(description);
                return Ok(RemoteDescriptionOutcome::Buffered);
            }
            state.busy = true;
        }

        let result = self.apply_remote_owned(description).await;
        self.release(Deferred::RunInline).await;
        result.map(|()| RemoteDescriptionOutcome::Applied)
    }

    /// Answer a remote offer: set-remote, create-answer and set-local run as
    /// one owned sequence. Returns the local answer.
    ///
    /// Negotiation requested meanwhile is rescheduled through the debounce
    /// window so the caller can deliver the answer first.
    #[instrument(skip_all, name = "transport.accept_remote_offer")]
    pub async fn accept_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> CallResult<SessionDescription> {
        self.ensure_open()?;
        self.claim().await;

        let result: CallResult<SessionDescription> = async {
            self.inner.peer.set_remote_description(offer).await?;
            let answer = self.inner.peer.create_answer().await?;
            self.inner
                .peer
                .set_local_description(answer.clone())
                .await?;
            Ok(answer)
        }
        .await;

        self.release(Deferred::Debounce).await;
        result
    }

    /// Create an answer for the current remote offer.
    pub async fn create_answer(&self) -> CallResult<SessionDescription> {
        self.ensure_open()?;
        self.inner.peer.create_answer().await
    }

    /// Add a send-only transceiver for a local track.
    pub async fn add_transceiver(&self, kind: TrackKind) -> CallResult<TransceiverHandle> {
        self.ensure_open()?;
        let transceiver = self
            .inner
            .peer
            .add_transceiver(kind, TransceiverDirection::SendOnly)
            .await?;
        debug!(
            target: "call.transport",
            transceiver_id = %transceiver.id,
            kind = kind.as_str(),
            "Transceiver added"
        );
        Ok(transceiver)
    }

    /// Remove a local track's transceiver.
    pub async fn remove_track(&self, transceiver: &TransceiverHandle) -> CallResult<()> {
        self.ensure_open()?;
        self.inner.peer.remove_transceiver(transceiver).await
    }

    /// Negotiated media id of a transceiver.
    pub async fn transceiver_mid(&self, transceiver: &TransceiverHandle) -> Option<String> {
        self.inner.peer.transceiver_mid(transceiver).await
    }

    /// Sample statistics, optionally for one transceiver only.
    pub async fn statistics(
        &self,
        transceiver: Option<&TransceiverHandle>,
    ) -> CallResult<StatsReport> {
        self.ensure_open()?;
        let report = self.inner.peer.statistics().await?;
        Ok(match transceiver {
            Some(t) => report.narrowed_to(&t.id),
            None => report,
        })
    }

    /// Close the transport. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.debouncer.cancel();
        self.inner.cancel.cancel();

        if let Err(e) = self.inner.peer.close().await {
            warn!(target: "call.transport", error = %e, "Peer connection close failed");
        }
        info!(target: "call.transport", "Media transport closed");
    }

    fn ensure_open(&self) -> CallResult<()> {
        if self.is_closed() {
            return Err(CallError::InvalidState("media transport is closed".to_string()));
        }
        Ok(())
    }

    /// Wait until no other task owns description mutation, then take it.
    async fn claim(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.negotiation.lock().await;
                if !state.busy {
                    state.busy = true;
                    return;
                }
            }

            notified.await;
        }
    }

    /// Give up ownership, applying any buffered remote description and any
    /// renegotiation recorded while this task owned mutation.
    ///
    /// The `renegotiate` flag is read under the same lock that clears `busy`,
    /// so a request deferred by a concurrent [`MediaTransport::negotiate_now`]
    /// is always picked up by the releasing owner.
    async fn release(&self, deferred: Deferred) {
        let schedule = loop {
            let step = {
                let mut state = self.inner.negotiation.lock().await;
                if let Some(description) = state.pending_remote.take() {
                    ReleaseStep::Apply(description)
                } else if state.renegotiate
                    && !self.is_closed()
                    && self.inner.peer.signaling_state() != SignalingState::HaveLocalOffer
                {
                    state.renegotiate = false;
                    match deferred {
                        Deferred::RunInline => ReleaseStep::Offer,
                        Deferred::Debounce => {
                            state.busy = false;
                            break true;
                        }
                    }
                } else {
                    state.busy = false;
                    break false;
                }
            };

            let result = match step {
                ReleaseStep::Apply(description) => self.apply_remote_owned(description).await,
                ReleaseStep::Offer => {
                    debug!(target: "call.transport", "Running renegotiation deferred during release");
                    self.offer_loop().await
                }
            };
            if let Err(e) = result {
                warn!(
                    target: "call.transport",
                    error = %e,
                    error_type = e.error_type(),
                    "Deferred description work failed"
                );
            }
        };

        self.inner.idle.notify_waiters();

        if schedule {
            self.negotiate();
        }
    }

    /// Apply a remote description while owning mutation, then honor a
    /// deferred renegotiation.
    async fn apply_remote_owned(&self, description: SessionDescription) -> CallResult<()> {
        self.inner.peer.set_remote_description(description).await?;

        let renegotiate = std::mem::take(&mut self.inner.negotiation.lock().await.renegotiate);
        if renegotiate {
            debug!(target: "call.transport", "Running deferred renegotiation");
            self.offer_loop().await?;
        }
        Ok(())
    }

    /// Offer/answer rounds until no renegotiation is outstanding.
    /// Caller must own description mutation.
    async fn offer_loop(&self) -> CallResult<()> {
        loop {
            if self.inner.peer.signaling_state() == SignalingState::HaveLocalOffer {
                let pending = self.inner.negotiation.lock().await.pending_remote.take();
                if let Some(description) = pending {
                    debug!(
                        target: "call.transport",
                        "Applying buffered remote description before renegotiating"
                    );
                    self.inner.peer.set_remote_description(description).await?;
                    continue;
                }

                debug!(
                    target: "call.transport",
                    "Local offer still unanswered, deferring renegotiation"
                );
                self.inner.negotiation.lock().await.renegotiate = true;
                metrics::record_negotiation("deferred");
                return Ok(());
            }

            if let Err(e) = self.offer_round().await {
                metrics::record_negotiation("failed");
                return Err(e);
            }
            metrics::record_negotiation("offered");

            let again = std::mem::take(&mut self.inner.negotiation.lock().await.renegotiate);
            if !again {
                return Ok(());
            }
        }
    }

    async fn offer_round(&self) -> CallResult<()> {
        let delegate = self
            .inner
            .delegate
            .upgrade()
            .ok_or_else(|| CallError::InvalidState("transport owner is gone".to_string()))?;

        let offer = self.inner.peer.create_offer().await?;
        self.inner.peer.set_local_description(offer.clone()).await?;
        debug!(target: "call.transport", "Local offer set, awaiting answer");

        let answer = match delegate.on_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                // Return to stable so later negotiations are not deferred forever.
                if let Err(rollback_error) = self
                    .inner
                    .peer
                    .set_local_description(SessionDescription::rollback())
                    .await
                {
                    warn!(
                        target: "call.transport",
                        error = %rollback_error,
                        "Rollback after failed offer round trip failed"
                    );
                }
                return Err(e);
            }
        };

        self.inner.peer.set_remote_description(answer).await
    }
}

/// Forward peer connection state changes to the delegate until the
/// transport closes or is dropped.
async fn watch_connection_state(inner: Weak<TransportInner>) {
    let (mut states, cancel) = match inner.upgrade() {
        Some(inner) => (inner.peer.connection_state(), inner.cancel.clone()),
        None => return,
    };

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                let Some(delegate) = inner.upgrade().and_then(|i| i.delegate.upgrade()) else {
                    break;
                };
                debug!(target: "call.transport", state = state.as_str(), "Peer connection state changed");
                delegate.on_connection_state(state);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::engine::SdpType;
    use crate::testing::fake_engine::FakePeerConnection;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingDelegate {
        offers: AtomicUsize,
        states: StdMutex<Vec<PeerConnectionState>>,
    }

    #[async_trait]
    impl TransportDelegate for RecordingDelegate {
        async fn on_offer(&self, offer: SessionDescription) -> CallResult<SessionDescription> {
            self.offers.fetch_add(1, Ordering::SeqCst);
            Ok(SessionDescription::answer(format!("answer-to:{}", offer.sdp)))
        }

        fn on_connection_state(&self, state: PeerConnectionState) {
            self.states.lock().unwrap().push(state);
        }
    }

    fn transport_with(
        peer: &Arc<FakePeerConnection>,
        delegate: &Arc<RecordingDelegate>,
    ) -> MediaTransport {
        let peer: Arc<dyn PeerConnection> = peer.clone();
        let delegate: Weak<dyn TransportDelegate> = Arc::downgrade(delegate) as Weak<dyn TransportDelegate>;
        MediaTransport::new(peer, delegate, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_negotiate_now_runs_one_offer_round() {
        let peer = Arc::new(FakePeerConnection::new());
        let delegate = Arc::new(RecordingDelegate::default());
        let transport = transport_with(&peer, &delegate);

        transport.negotiate_now().await.unwrap();

        assert_eq!(delegate.offers.load(Ordering::SeqCst), 1);
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiate_burst_coalesces_into_one_offer() {
        let peer = Arc::new(FakePeerConnection::new());
        let delegate = Arc::new(RecordingDelegate::default());
        let transport = transport_with(&peer, &delegate);

        for _ in 0..5 {
            transport.negotiate();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(delegate.offers.load(Ordering::SeqCst), 1);
        assert_eq!(peer.offers_created(), 1);
    }

    #[tokio::test]
    async fn test_glare_defers_until_remote_answer_then_offers_once() {
        let peer = Arc::new(FakePeerConnection::new());
        let delegate = Arc::new(RecordingDelegate::default());
        let transport = transport_with(&peer, &delegate);

        // An outstanding local offer with no answer yet.
        transport
            .set_local_description(SessionDescription::offer("outstanding"))
            .await
            .unwrap();
        assert_eq!(transport.signaling_state(), SignalingState::HaveLocalOffer);

        transport.negotiate_now().await.unwrap();
        assert_eq!(peer.offers_created(), 0, "negotiation must defer");

        let outcome = transport
            .set_remote_description(SessionDescription::answer("late-answer"))
            .await
            .unwrap();

        assert_eq!(outcome, RemoteDescriptionOutcome::Applied);
        assert_eq!(peer.offers_created(), 1, "exactly one fresh offer");
        assert_eq!(delegate.offers.load(Ordering::SeqCst), 1);
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
    }

    /// Delegate whose first offer round lets a second `negotiate_now` land
    /// after the owner's last look at the renegotiate flag but before it
    /// releases ownership.
    #[derive(Default)]
    struct LateRequestDelegate {
        transport: std::sync::OnceLock<MediaTransport>,
        offers: AtomicUsize,
        late: StdMutex<Option<tokio::task::JoinHandle<CallResult<()>>>>,
    }

    #[async_trait]
    impl TransportDelegate for LateRequestDelegate {
        async fn on_offer(&self, offer: SessionDescription) -> CallResult<SessionDescription> {
            if self.offers.fetch_add(1, Ordering::SeqCst) == 0 {
                let transport = self.transport.get().cloned().unwrap();
                let (held_tx, held_rx) = tokio::sync::oneshot::channel();
                let late = tokio::spawn(async move {
                    let guard = transport.inner.negotiation.lock().await;
                    held_tx.send(()).unwrap();
                    // The owner finishes its round and queues behind the guard.
                    for _ in 0..20 {
                        tokio::task::yield_now().await;
                    }
                    let requester = transport.clone();
                    let request = tokio::spawn(async move { requester.negotiate_now().await });
                    for _ in 0..20 {
                        tokio::task::yield_now().await;
                    }
                    drop(guard);
                    request.await.unwrap()
                });
                held_rx.await.unwrap();
                *self.late.lock().unwrap() = Some(late);
            }
            Ok(SessionDescription::answer(format!("answer-to:{}", offer.sdp)))
        }

        fn on_connection_state(&self, _: PeerConnectionState) {}
    }

    #[tokio::test]
    async fn test_request_during_release_is_not_lost() {
        let peer = Arc::new(FakePeerConnection::new());
        let delegate = Arc::new(LateRequestDelegate::default());
        let peer_dyn: Arc<dyn PeerConnection> = peer.clone();
        let weak: Weak<dyn TransportDelegate> =
            Arc::downgrade(&delegate) as Weak<dyn TransportDelegate>;
        let transport = MediaTransport::new(peer_dyn, weak, Duration::from_millis(20));
        assert!(delegate.transport.set(transport.clone()).is_ok());

        transport.negotiate_now().await.unwrap();
        let late = delegate.late.lock().unwrap().take().unwrap();
        late.await.unwrap().unwrap();

        assert_eq!(peer.offers_created(), 2);
        assert_eq!(delegate.offers.load(Ordering::SeqCst), 2);
        assert!(!transport.inner.negotiation.lock().await.renegotiate);
        assert!(!transport.inner.negotiation.lock().await.busy);
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_accept_remote_offer_returns_local_answer() {
        let peer = Arc::new(FakePeerConnection::new());
        let delegate = Arc::new(RecordingDelegate::default());
        let transport = transport_with(&peer, &delegate);

        let answer = transport
            .accept_remote_offer(SessionDescription::offer("remote"))
            .await
            .unwrap();

        assert_eq!(answer.kind, SdpType::Answer);
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
        assert_eq!(delegate.offers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_offer_round_rolls_back() {
        struct FailingDelegate;

        #[async_trait]
        impl TransportDelegate for FailingDelegate {
            async fn on_offer(&self, _: SessionDescription) -> CallResult<SessionDescription> {
                Err(CallError::Http("push failed".to_string()))
            }

            fn on_connection_state(&self, _: PeerConnectionState) {}
        }

        let peer = Arc::new(FakePeerConnection::new());
        let delegate = Arc::new(FailingDelegate);
        let peer_dyn: Arc<dyn PeerConnection> = peer.clone();
        let weak: Weak<dyn TransportDelegate> = Arc::downgrade(&delegate) as Weak<dyn TransportDelegate>;
        let transport = MediaTransport::new(peer_dyn, weak, Duration::from_millis(20));

        let result = transport.negotiate_now().await;

        assert!(matches!(result, Err(CallError::Http(_))));
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_connection_state_reaches_delegate() {
        let peer = Arc::new(FakePeerConnection::new());
        let delegate = Arc::new(RecordingDelegate::default());
        let _transport = transport_with(&peer, &delegate);
        tokio::task::yield_now().await;

        peer.set_connection_state(PeerConnectionState::Disconnected);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            *delegate.states.lock().unwrap(),
            vec![PeerConnectionState::Disconnected]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_mutation() {
        let peer = Arc::new(FakePeerConnection::new());
        let delegate = Arc::new(RecordingDelegate::default());
        let transport = transport_with(&peer, &delegate);

        transport.close().await;
        transport.close().await;

        assert!(transport.is_closed());
        assert_eq!(peer.close_calls(), 1);
        assert!(matches!(
            transport.negotiate_now().await,
            Err(CallError::InvalidState(_))
        ));
    }
}
