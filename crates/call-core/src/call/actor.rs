//! `CallActor` - per-call event loop.
//!
//! Serializes everything that happens *to* a call: inbound signaling
//! events, signaling closure, media transport state and local mute
//! changes. Each event is handled to completion before the next one is
//! taken, so reconciliation and pulls never interleave.
//!
//! The actor holds a weak reference; once every [`super::Call`] handle is
//! dropped it exits on the next event.

use common::types::CallId;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::orchestrator::CallInner;
use crate::media::PeerConnectionState;
use crate::signaling::{ChannelClosed, InboundMessage, SignalingReceivers};
use crate::tracks::MuteChanged;

/// Events the actor feeds into the call.
#[derive(Debug)]
pub(super) enum CallEvent {
    Inbound(InboundMessage),
    ChannelClosed(ChannelClosed),
    PeerState(PeerConnectionState),
    MuteChanged(MuteChanged),
}

pub(super) struct CallActor {
    call: Weak<CallInner>,
    call_id: CallId,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
    closed: mpsc::UnboundedReceiver<ChannelClosed>,
    peer_events: mpsc::UnboundedReceiver<PeerConnectionState>,
    mute_events: mpsc::UnboundedReceiver<MuteChanged>,
    cancel: CancellationToken,
}

impl CallActor {
    pub(super) fn new(
        call: Weak<CallInner>,
        call_id: CallId,
        receivers: SignalingReceivers,
        peer_events: mpsc::UnboundedReceiver<PeerConnectionState>,
        mute_events: mpsc::UnboundedReceiver<MuteChanged>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            call,
            call_id,
            inbound: receivers.inbound,
            closed: receivers.closed,
            peer_events,
            mute_events,
            cancel,
        }
    }

    #[instrument(skip_all, name = "call.actor", fields(call_id = %self.call_id))]
    pub(super) async fn run(mut self) {
        debug!(target: "call.orchestrator", call_id = %self.call_id, "CallActor started");

        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,

                Some(message) = self.inbound.recv() => CallEvent::Inbound(message),

                Some(closed) = self.closed.recv() => CallEvent::ChannelClosed(closed),

                Some(state) = self.peer_events.recv() => CallEvent::PeerState(state),

                Some(changed) = self.mute_events.recv() => CallEvent::MuteChanged(changed),

                else => break,
            };

            let Some(call) = self.call.upgrade() else {
                break;
            };
            call.handle_event(event).await;
        }

        debug!(target: "call.orchestrator", call_id = %self.call_id, "CallActor stopped");
    }
}
