//! In-memory peer connection that follows the offer/answer state machine.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::errors::{CallError, CallResult};
use crate::media::{
    IceConfiguration, MediaEngine, PeerConnection, PeerConnectionState, SdpType,
    SessionDescription, SignalingState, StatsReport, TrackKind, TrackStats, TransceiverDirection,
    TransceiverHandle,
};

#[derive(Debug)]
struct FakeTransceiver {
    handle: TransceiverHandle,
    mid: Option<String>,
}

#[derive(Debug)]
struct PeerState {
    signaling: SignalingState,
    transceivers: Vec<FakeTransceiver>,
    next_transceiver: usize,
    next_mid: usize,
    local_descriptions: Vec<SessionDescription>,
    remote_descriptions: Vec<SessionDescription>,
}

/// Fake peer connection.
///
/// The first completed offer/answer exchange moves the connection state to
/// `connected` unless auto-connect is disabled.
#[derive(Debug)]
pub struct FakePeerConnection {
    state: Mutex<PeerState>,
    connection: watch::Sender<PeerConnectionState>,
    auto_connect: AtomicBool,
    offers_created: AtomicUsize,
    answers_created: AtomicUsize,
    close_calls: AtomicUsize,
}

impl Default for FakePeerConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePeerConnection {
    #[must_use]
    pub fn new() -> Self {
        let (connection, _) = watch::channel(PeerConnectionState::New);
        Self {
            state: Mutex::new(PeerState {
                signaling: SignalingState::Stable,
                transceivers: Vec::new(),
                next_transceiver: 0,
                next_mid: 0,
                local_descriptions: Vec::new(),
                remote_descriptions: Vec::new(),
            }),
            connection,
            auto_connect: AtomicBool::new(true),
            offers_created: AtomicUsize::new(0),
            answers_created: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Disable the automatic move to `connected`.
    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::SeqCst);
    }

    /// Force a connection state change.
    pub fn set_connection_state(&self, state: PeerConnectionState) {
        self.connection.send_replace(state);
    }

    #[must_use]
    pub fn current_connection_state(&self) -> PeerConnectionState {
        *self.connection.borrow()
    }

    #[must_use]
    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn answers_created(&self) -> usize {
        self.answers_created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn transceiver_count(&self) -> usize {
        self.lock().transceivers.len()
    }

    #[must_use]
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.lock().remote_descriptions.clone()
    }

    #[must_use]
    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.lock().local_descriptions.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exchange_completed(&self) {
        if self.auto_connect.load(Ordering::SeqCst) {
            self.connection.send_if_modified(|state| {
                if *state == PeerConnectionState::Connected {
                    return false;
                }
                *state = PeerConnectionState::Connected;
                true
            });
        }
    }

    fn illegal(state: SignalingState, what: &str) -> CallError {
        CallError::Transport(format!("cannot {what} in state {state:?}"))
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self) -> CallResult<SessionDescription> {
        let state = self.lock();
        if state.signaling != SignalingState::Stable {
            return Err(Self::illegal(state.signaling, "create offer"));
        }
        let n = self.offers_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!("fake-offer-{n}")))
    }

    async fn create_answer(&self) -> CallResult<SessionDescription> {
        let state = self.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Self::illegal(state.signaling, "create answer"));
        }
        let n = self.answers_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::answer(format!("fake-answer-{n}")))
    }

    async fn set_local_description(&self, description: SessionDescription) -> CallResult<()> {
        let completed = {
            let mut state = self.lock();
            let completed = match (description.kind, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                    let mut next_mid = state.next_mid;
                    for transceiver in &mut state.transceivers {
                        if transceiver.mid.is_none() {
                            transceiver.mid = Some(next_mid.to_string());
                            next_mid += 1;
                        }
                    }
                    state.next_mid = next_mid;
                    false
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                    true
                }
                (SdpType::Pranswer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::HaveLocalPranswer;
                    false
                }
                (SdpType::Rollback, _) => {
                    state.signaling = SignalingState::Stable;
                    false
                }
                (_, current) => return Err(Self::illegal(current, "set local description")),
            };
            state.local_descriptions.push(description);
            completed
        };

        if completed {
            self.exchange_completed();
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> CallResult<()> {
        let completed = {
            let mut state = self.lock();
            let completed = match (description.kind, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                    false
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    true
                }
                (SdpType::Pranswer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::HaveRemotePranswer;
                    false
                }
                (SdpType::Rollback, _) => {
                    state.signaling = SignalingState::Stable;
                    false
                }
                (_, current) => return Err(Self::illegal(current, "set remote description")),
            };
            state.remote_descriptions.push(description);
            completed
        };

        if completed {
            self.exchange_completed();
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.lock().signaling
    }

    fn connection_state(&self) -> watch::Receiver<PeerConnectionState> {
        self.connection.subscribe()
    }

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> CallResult<TransceiverHandle> {
        let mut state = self.lock();
        if state.signaling == SignalingState::Closed {
            return Err(Self::illegal(state.signaling, "add transceiver"));
        }
        let handle = TransceiverHandle {
            id: format!("tx-{}", state.next_transceiver),
            kind,
            direction,
        };
        state.next_transceiver += 1;
        state.transceivers.push(FakeTransceiver {
            handle: handle.clone(),
            mid: None,
        });
        Ok(handle)
    }

    async fn remove_transceiver(&self, transceiver: &TransceiverHandle) -> CallResult<()> {
        self.lock()
            .transceivers
            .retain(|t| t.handle.id != transceiver.id);
        Ok(())
    }

    async fn transceiver_mid(&self, transceiver: &TransceiverHandle) -> Option<String> {
        self.lock()
            .transceivers
            .iter()
            .find(|t| t.handle.id == transceiver.id)
            .and_then(|t| t.mid.clone())
    }

    async fn statistics(&self) -> CallResult<StatsReport> {
        let state = self.lock();
        Ok(StatsReport {
            round_trip_time: Some(Duration::from_millis(25)),
            tracks: state
                .transceivers
                .iter()
                .map(|t| TrackStats {
                    transceiver_id: t.handle.id.clone(),
                    bytes_sent: 1_000,
                    packets_sent: 10,
                    ..TrackStats::default()
                })
                .collect(),
        })
    }

    async fn close(&self) -> CallResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.lock().signaling = SignalingState::Closed;
        self.connection.send_replace(PeerConnectionState::Closed);
        Ok(())
    }
}

/// Engine handing out [`FakePeerConnection`]s and remembering them.
#[derive(Debug, Default)]
pub struct FakeMediaEngine {
    peers: Mutex<Vec<Arc<FakePeerConnection>>>,
    ice_configurations: Mutex<Vec<IceConfiguration>>,
    auto_connect: Option<bool>,
}

impl FakeMediaEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose peers never reach `connected` on their own.
    #[must_use]
    pub fn without_auto_connect() -> Self {
        Self {
            auto_connect: Some(false),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn peers(&self) -> Vec<Arc<FakePeerConnection>> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn last_peer(&self) -> Option<Arc<FakePeerConnection>> {
        self.peers().last().cloned()
    }

    #[must_use]
    pub fn ice_configurations(&self) -> Vec<IceConfiguration> {
        self.ice_configurations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn create(&self, ice: &IceConfiguration) -> CallResult<Arc<dyn PeerConnection>> {
        let peer = Arc::new(FakePeerConnection::new());
        if let Some(auto_connect) = self.auto_connect {
            peer.set_auto_connect(auto_connect);
        }
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&peer));
        self.ice_configurations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ice.clone());
        Ok(peer)
    }
}
