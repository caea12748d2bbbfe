//! Recording [`CallReporter`].

use common::types::CallId;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use crate::call::{CallReporter, EndReason, IncomingCall};

#[derive(Debug, Default)]
struct Reports {
    incoming: Vec<IncomingCall>,
    connected: Vec<CallId>,
    ended: Vec<(CallId, EndReason)>,
}

/// Records every report; tests can wait for a call to end.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Reports>,
    changed: Notify,
}

impl RecordingReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn incoming(&self) -> Vec<IncomingCall> {
        self.reports().incoming.clone()
    }

    #[must_use]
    pub fn connected(&self) -> Vec<CallId> {
        self.reports().connected.clone()
    }

    #[must_use]
    pub fn ended(&self) -> Vec<(CallId, EndReason)> {
        self.reports().ended.clone()
    }

    /// Wait until `call_id` has been reported ended. Returns its reason, or
    /// `None` on timeout.
    pub async fn wait_for_end(&self, call_id: CallId, timeout: Duration) -> Option<EndReason> {
        tokio::time::timeout(timeout, async {
            loop {
                let changed = self.changed.notified();
                let reason = self
                    .reports()
                    .ended
                    .iter()
                    .find(|(id, _)| *id == call_id)
                    .map(|(_, reason)| *reason);
                if let Some(reason) = reason {
                    return reason;
                }
                changed.await;
            }
        })
        .await
        .ok()
    }

    /// Wait until `call_id` has been reported connected.
    pub async fn wait_for_connected(&self, call_id: CallId, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let changed = self.changed.notified();
                if self.reports().connected.contains(&call_id) {
                    return;
                }
                changed.await;
            }
        })
        .await
        .is_ok()
    }

    fn reports(&self) -> MutexGuard<'_, Reports> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CallReporter for RecordingReporter {
    fn report_incoming_call(&self, call: &IncomingCall) {
        self.reports().incoming.push(call.clone());
        self.changed.notify_waiters();
    }

    fn report_call_connected(&self, call_id: CallId) {
        self.reports().connected.push(call_id);
        self.changed.notify_waiters();
    }

    fn report_call_ended(&self, call_id: CallId, reason: EndReason) {
        self.reports().ended.push((call_id, reason));
        self.changed.notify_waiters();
    }
}
