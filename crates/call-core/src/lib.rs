//! Operator Call core.
//!
//! Call-session orchestration and signaling for the mobile SDK:
//!
//! - Signaling over a duplex stream with gated inbound/outbound queues
//! - Offer/answer negotiation over a pluggable media engine
//! - Local track lifecycle (start/stop/mute) and remote track pulls
//! - Participant reconciliation from server call updates
//! - REST control-plane client for sessions, tracks, calls and devices
//!
//! # Architecture
//!
//! ```text
//! CallManager (one per process)
//! └── Call (one per call session)
//!     ├── SignalingChannel ── outbound / inbound MessageQueue
//!     ├── MediaTransport ──── PeerConnection (MediaEngine)
//!     ├── User ────────────── LocalTrackPublication -> LocalTrack -> Capturer
//!     ├── Host (per remote) ─ RemoteTrackPublication -> RemoteTrack
//!     └── CallActor ───────── serializes inbound events, transport state, mutes
//! ```
//!
//! # Modules
//!
//! - [`api`] - control-plane REST client and its models
//! - [`call`] - call orchestrator and call manager
//! - [`config`] - configuration from environment
//! - [`errors`] - error types
//! - [`media`] - media engine abstraction and media transport
//! - [`observability`] - metrics
//! - [`participants`] - local user and remote hosts
//! - [`signaling`] - signaling channel
//! - [`tracks`] - local/remote tracks and publications

pub mod api;
pub mod call;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod participants;
pub mod signaling;
pub mod tracks;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use call::{Call, CallIntent, CallManager, ConnectionState, EndReason};
pub use config::Config;
pub use errors::{CallError, CallResult};
