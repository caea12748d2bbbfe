//! Call probe
//!
//! Places one call against a live deployment and holds it until Ctrl-C or
//! until the server ends it. Useful for checking signaling, negotiation and
//! track pulls end to end without a device.
//!
//! # Environment
//!
//! - `CALL_API_BASE_URL`, `CALL_API_TOKEN` and the other `CALL_*` settings
//!   read by [`Config::from_env`]
//! - `CALL_PROBE_SIGNALING_URL` - signaling endpoint to join (required)
//! - `CALL_PROBE_CALLER_NAME` - display name (default `call-probe`)
//!
//! Capture is not available here; the probe publishes tracks backed by an
//! inert capturer.

#![warn(clippy::pedantic)]

use anyhow::Context;
use async_trait::async_trait;
use call_core::api::{ApiClient, InMemoryCredentialStore};
use call_core::call::{CallDependencies, CallReporter, IncomingCall};
use call_core::media::webrtc::WebRtcEngine;
use call_core::signaling::WebSocketConnector;
use call_core::tracks::{CaptureDevices, Capturer, TrackSource};
use call_core::{CallManager, CallResult, Config, EndReason};
use common::types::CallId;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Logs every report instead of showing call UI.
struct LoggingReporter;

impl CallReporter for LoggingReporter {
    fn report_incoming_call(&self, call: &IncomingCall) {
        info!(call_id = %call.uuid, caller = %call.caller_name, "Incoming call");
    }

    fn report_call_connected(&self, call_id: CallId) {
        info!(call_id = %call_id, "Call connected");
    }

    fn report_call_ended(&self, call_id: CallId, reason: EndReason) {
        info!(call_id = %call_id, reason = reason.as_str(), "Call ended");
    }
}

struct InertCapturer;

#[async_trait]
impl Capturer for InertCapturer {
    async fn start(&self) -> CallResult<()> {
        Ok(())
    }

    async fn stop(&self) -> CallResult<()> {
        Ok(())
    }

    fn set_enabled(&self, _enabled: bool) {}
}

struct InertDevices;

#[async_trait]
impl CaptureDevices for InertDevices {
    async fn capturer(&self, source: TrackSource) -> CallResult<Arc<dyn Capturer>> {
        info!(source = source.as_str(), "Using inert capturer");
        Ok(Arc::new(InertCapturer))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_core=debug,call=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    let signaling_url = std::env::var("CALL_PROBE_SIGNALING_URL")
        .context("CALL_PROBE_SIGNALING_URL is required")?;
    let caller_name =
        std::env::var("CALL_PROBE_CALLER_NAME").unwrap_or_else(|_| "call-probe".to_string());

    info!(api_base_url = %config.api_base_url, "Starting call probe");

    let credentials = Arc::new(InMemoryCredentialStore::new(config.api_token.clone()));
    let api = ApiClient::new(&config, credentials.clone()).context("failed to build API client")?;
    let deps = CallDependencies {
        api: Arc::new(api),
        connector: Arc::new(WebSocketConnector::new()),
        engine: Arc::new(WebRtcEngine::new().context("failed to build media engine")?),
        devices: Arc::new(InertDevices),
        reporter: Arc::new(LoggingReporter),
    };
    let manager = CallManager::new(config, deps, credentials);

    let call = manager
        .start_call(&caller_name, &signaling_url)
        .await
        .context("call failed to start")?;
    info!(call_id = %call.id(), session_id = ?call.session_id(), "Call joined");

    let ended = call.ended_token();
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            if let Some(report) = call.statistics().await {
                info!(
                    round_trip_time = ?report.round_trip_time,
                    tracks = report.tracks.len(),
                    "Final statistics"
                );
            }
            info!("Hanging up");
            call.end(call.id()).await;
        }
        () = ended.cancelled() => {
            info!("Call ended by the server");
        }
    }
    Ok(())
}
