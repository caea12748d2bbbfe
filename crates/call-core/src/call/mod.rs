//! Call orchestration.
//!
//! - [`Call`] - one call session: signaling, media, local user and hosts
//! - [`CallManager`] - per-process owner of the active call
//! - [`events`] - lifecycle types and the host-application collaborators

mod actor;
pub mod events;
mod manager;
mod orchestrator;

pub use events::{CallDependencies, CallReporter, ConnectionState, EndReason, IncomingCall};
pub use manager::{CallIntent, CallManager};
pub use orchestrator::Call;
