//! Call parties.
//!
//! The local [`User`] publishes tracks; each remote [`Host`] advertises
//! tracks over signaling that we pull from the control plane.

mod host;
pub mod resolution;
mod user;

pub use host::{Host, PullContext, PullOutcome};
pub use user::{ParticipantState, PublishContext, User};
