//! In-crate fakes for the collaborators of a call.
//!
//! Compiled for unit tests and, behind the `test-utils` feature, for
//! integration tests.

pub mod fake_capture;
pub mod fake_engine;
pub mod fake_signaling;
pub mod mock_api;
pub mod reporter;

pub use fake_capture::{CaptureEvent, FakeCaptureDevices, FakeCapturer};
pub use fake_engine::{FakeMediaEngine, FakePeerConnection};
pub use fake_signaling::FakeSignalingConnector;
pub use mock_api::MockControlPlane;
pub use reporter::RecordingReporter;
