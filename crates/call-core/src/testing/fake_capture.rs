//! Fake capture pipelines.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::errors::{CallError, CallResult};
use crate::tracks::{CaptureDevices, Capturer, TrackSource};

/// Device-level transitions seen by a [`FakeCapturer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    Started,
    Stopped,
}

/// Capturer recording every device transition.
#[derive(Debug)]
pub struct FakeCapturer {
    events: Mutex<Vec<CaptureEvent>>,
    enabled: AtomicBool,
    in_flight: AtomicUsize,
    overlaps: AtomicUsize,
    start_error: Option<CallError>,
    stop_error: Mutex<Option<CallError>>,
}

impl Default for FakeCapturer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCapturer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            start_error: None,
            stop_error: Mutex::new(None),
        }
    }

    /// Capturer whose `start` always fails with `error`.
    #[must_use]
    pub fn failing(error: CallError) -> Self {
        Self {
            start_error: Some(error),
            ..Self::new()
        }
    }

    /// Make every later `stop` fail with `error`.
    pub fn fail_stop(&self, error: CallError) {
        *self
            .stop_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    #[must_use]
    pub fn device_events(&self) -> Vec<CaptureEvent> {
        self.lock().clone()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// How often a transition began while another was still running.
    #[must_use]
    pub fn overlapping_transitions(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    async fn transition(&self, event: CaptureEvent) {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::task::yield_now().await;
        self.lock().push(event);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CaptureEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Capturer for FakeCapturer {
    async fn start(&self) -> CallResult<()> {
        if let Some(error) = &self.start_error {
            return Err(error.clone());
        }
        self.transition(CaptureEvent::Started).await;
        Ok(())
    }

    async fn stop(&self) -> CallResult<()> {
        let error = self
            .stop_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(error) = error {
            return Err(error);
        }
        self.transition(CaptureEvent::Stopped).await;
        Ok(())
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Hands out one shared [`FakeCapturer`] per source.
#[derive(Debug, Default)]
pub struct FakeCaptureDevices {
    capturers: Mutex<HashMap<TrackSource, Arc<FakeCapturer>>>,
    missing: Mutex<Vec<TrackSource>>,
    requests: AtomicUsize,
}

impl FakeCaptureDevices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `source` report `DeviceNotFound`.
    pub fn remove_device(&self, source: TrackSource) {
        self.missing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(source);
    }

    /// Capturer handed out for `source`, if any was requested.
    #[must_use]
    pub fn capturer_for(&self, source: TrackSource) -> Option<Arc<FakeCapturer>> {
        self.capturers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&source)
            .cloned()
    }

    #[must_use]
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevices for FakeCaptureDevices {
    async fn capturer(&self, source: TrackSource) -> CallResult<Arc<dyn Capturer>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self
            .missing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&source)
        {
            return Err(CallError::DeviceNotFound(source.as_str().to_string()));
        }

        let capturer = self
            .capturers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(source)
            .or_insert_with(|| Arc::new(FakeCapturer::new()))
            .clone();
        Ok(capturer)
    }
}
