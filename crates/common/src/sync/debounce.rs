//! Cancel-and-replace debouncer.
//!
//! Each [`Debouncer::call`] schedules a task after the configured delay and
//! cancels the one still waiting from the previous call, so a burst of calls
//! runs the work once. Only the waiting phase is cancellable: once the delay
//! has elapsed the work runs to completion even if a new call arrives.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Debounces async work behind a fixed delay.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<CancellationToken>>,
}

impl Debouncer {
    /// Create a debouncer with the given delay.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Configured delay.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule `work`, replacing any call still waiting for its delay.
    pub fn call<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());

        if let Some(previous) = previous {
            previous.cancel();
        }

        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    trace!(target: "common.sync", "Debounced call replaced");
                }
                () = tokio::time::sleep(delay) => {
                    work.await;
                }
            }
        });
    }

    /// Cancel the call still waiting for its delay, if any.
    pub fn cancel(&self) {
        if let Some(token) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
