//! Common utilities and types shared across Operator Call components.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for async coordination primitives (completion, debounce, serial runner)
pub mod sync;
