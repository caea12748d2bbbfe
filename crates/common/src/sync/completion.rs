//! Single-resolution completion with reset and timeouts.
//!
//! A `Completion` starts pending and is resolved at most once per
//! generation, either with a value ([`Completion::resume`]) or an error
//! ([`Completion::fail`]). Waiters observe the first resolution; later ones
//! are ignored until [`Completion::reset`] starts a new generation.
//!
//! Time-boxed waits resolve the completion with [`TimedOut`] when they expire,
//! so every waiter sees the same outcome. Callers treat a timeout exactly like
//! an explicit failure.

use std::future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

/// Marker error produced when a time-boxed wait expires unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("completion timed out")]
pub struct TimedOut;

#[derive(Debug, Clone)]
struct Slot<T, E> {
    generation: u64,
    result: Option<Result<T, E>>,
}

/// Single-resolution promise supporting resume, fail and reset.
#[derive(Debug)]
pub struct Completion<T, E> {
    tx: watch::Sender<Slot<T, E>>,
}

impl<T, E> Default for Completion<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<TimedOut> + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Completion<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<TimedOut> + 'static,
{
    /// Create a pending completion.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Slot {
            generation: 0,
            result: None,
        });
        Self { tx }
    }

    /// Resolve with a value. Returns `false` if already resolved.
    pub fn resume(&self, value: T) -> bool {
        self.resolve(Ok(value), None)
    }

    /// Resolve with an error. Returns `false` if already resolved.
    pub fn fail(&self, error: E) -> bool {
        self.resolve(Err(error), None)
    }

    /// Return to the pending state, starting a new generation.
    ///
    /// Idempotent, and safe to call before the completion was ever used.
    /// Timers armed for an earlier generation no longer affect it.
    pub fn reset(&self) {
        self.tx.send_if_modified(|slot| {
            slot.generation = slot.generation.wrapping_add(1);
            let was_resolved = slot.result.is_some();
            slot.result = None;
            was_resolved
        });
    }

    /// Whether the current generation has been resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().result.is_some()
    }

    /// The current resolution, if any.
    #[must_use]
    pub fn peek(&self) -> Option<Result<T, E>> {
        self.tx.borrow().result.clone()
    }

    /// Wait for the current generation to resolve.
    pub async fn wait(&self) -> Result<T, E> {
        let mut rx = self.tx.subscribe();
        let resolved = rx
            .wait_for(|slot| slot.result.is_some())
            .await
            .ok()
            .and_then(|slot| slot.result.clone());

        match resolved {
            Some(result) => result,
            // The sender lives in `self`, so the channel cannot close while
            // we hold a reference; park instead of inventing an outcome.
            None => future::pending().await,
        }
    }

    /// Wait up to `timeout`, failing the completion with [`TimedOut`] if it is
    /// still pending when the deadline passes.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<T, E> {
        if let Ok(result) = tokio::time::timeout(timeout, self.wait()).await {
            return result;
        }

        self.fail(TimedOut.into());
        self.peek().unwrap_or_else(|| Err(TimedOut.into()))
    }

    /// Arm a timer task that fails the current generation with [`TimedOut`]
    /// after `timeout` unless it was resolved or reset in the meantime.
    pub fn arm_timeout(self: &Arc<Self>, timeout: Duration) -> JoinHandle<()> {
        let generation = self.tx.borrow().generation;
        let completion = Arc::downgrade(self);

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(completion) = completion.upgrade() {
                if completion.resolve(Err(TimedOut.into()), Some(generation)) {
                    trace!(target: "common.sync", generation, "Completion timed out");
                }
            }
        })
    }

    fn resolve(&self, result: Result<T, E>, generation: Option<u64>) -> bool {
        let mut result = Some(result);
        self.tx.send_if_modified(|slot| {
            if slot.result.is_some() || generation.is_some_and(|g| g != slot.generation) {
                return false;
            }
            slot.result = result.take();
            true
        })
    }
}
