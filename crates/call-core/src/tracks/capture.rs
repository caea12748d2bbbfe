//! Capture collaborators.
//!
//! Camera, microphone and screen pipelines live outside the core and feed
//! their frames straight to the media engine. A track only needs to start
//! and stop its capturer and gate whether frames reach the sink.

use async_trait::async_trait;
use std::sync::Arc;

use super::TrackSource;
use crate::errors::CallResult;

/// One capture pipeline.
#[async_trait]
pub trait Capturer: Send + Sync {
    /// Acquire the device and begin producing frames.
    ///
    /// Fails with `DeviceNotFound` or `CaptureFormatNotFound`.
    async fn start(&self) -> CallResult<()>;

    /// Stop producing frames and release the device.
    async fn stop(&self) -> CallResult<()>;

    /// Gate whether frames reach the sink without touching the device.
    fn set_enabled(&self, enabled: bool);
}

/// Hands out a capturer per source role.
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    async fn capturer(&self, source: TrackSource) -> CallResult<Arc<dyn Capturer>>;
}
