//! Observability for the call core.
//!
//! Structured logging goes through `tracing` with per-component targets
//! (`call.signaling`, `call.transport`, `call.track`, `call.participant`,
//! `call.orchestrator`, `call.api`, `call.manager`). Metrics go through the
//! `metrics` facade; see [`metrics`].

pub mod metrics;
