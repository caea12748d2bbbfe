//! Async coordination primitives shared by the call components.
//!
//! - [`Completion`] - single-resolution promise with reset and time-boxed waits
//! - [`Debouncer`] - cancel-and-replace delayed execution
//! - [`SerialRunner`] - queue-and-await-previous execution per resource

mod completion;
mod debounce;
mod serial;

pub use completion::{Completion, TimedOut};
pub use debounce::Debouncer;
pub use serial::SerialRunner;
