//! Call core error types.
//!
//! One error enum covers every fallible operation of the core. It is `Clone`
//! so a single failure can be handed to every waiter of a completion.

use common::sync::TimedOut;
use thiserror::Error;

use crate::config::ConfigError;

/// Call core error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Operation attempted outside its legal state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A time-boxed wait expired before it was resumed.
    #[error("Operation timed out")]
    Timeout,

    /// No capture device exists for the requested source.
    #[error("Capture device not found: {0}")]
    DeviceNotFound(String),

    /// The capture device offers no usable format.
    #[error("Capture format not found: {0}")]
    CaptureFormatNotFound(String),

    /// The control plane rejected the credential (HTTP 401).
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The signaling stream closed or was never established.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Opaque failure reported by the media engine.
    #[error("Media transport error: {0}")]
    Transport(String),

    /// Non-success response from the control plane. The body is sanitized.
    #[error("API request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    /// The HTTP request itself failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias used throughout the crate.
pub type CallResult<T> = Result<T, CallError>;

impl CallError {
    /// Returns a bounded label string for the error variant (for logs and metrics).
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            CallError::InvalidState(_) => "invalid_state",
            CallError::Timeout => "timeout",
            CallError::DeviceNotFound(_) => "device_not_found",
            CallError::CaptureFormatNotFound(_) => "capture_format_not_found",
            CallError::NotAuthenticated => "not_authenticated",
            CallError::Disconnected(_) => "disconnected",
            CallError::Transport(_) => "transport",
            CallError::Api { .. } => "api",
            CallError::Http(_) => "http",
            CallError::Serialization(_) => "serialization",
            CallError::Config(_) => "config",
            CallError::Internal(_) => "internal",
        }
    }

    /// Whether the error came from a time-boxed wait.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout)
    }
}

impl From<TimedOut> for CallError {
    fn from(_: TimedOut) -> Self {
        CallError::Timeout
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Serialization(err.to_string())
    }
}

impl From<ConfigError> for CallError {
    fn from(err: ConfigError) -> Self {
        CallError::Config(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_labels_are_bounded() {
        let cases = [
            (CallError::InvalidState("x".to_string()), "invalid_state"),
            (CallError::Timeout, "timeout"),
            (CallError::DeviceNotFound("camera".to_string()), "device_not_found"),
            (
                CallError::CaptureFormatNotFound("camera".to_string()),
                "capture_format_not_found",
            ),
            (CallError::NotAuthenticated, "not_authenticated"),
            (CallError::Disconnected("eof".to_string()), "disconnected"),
            (CallError::Transport("sdp".to_string()), "transport"),
            (
                CallError::Api {
                    status: 500,
                    body: String::new(),
                },
                "api",
            ),
            (CallError::Http("dns".to_string()), "http"),
            (CallError::Serialization("eof".to_string()), "serialization"),
            (CallError::Config("missing".to_string()), "config"),
            (CallError::Internal("bug".to_string()), "internal"),
        ];

        for (error, label) in cases {
            assert_eq!(error.error_type(), label, "{error:?}");
        }
    }

    #[test]
    fn test_timed_out_converts_to_timeout() {
        let error: CallError = TimedOut.into();
        assert!(error.is_timeout());
    }

    #[test]
    fn test_json_error_converts_to_serialization() {
        let json_error = serde_json::from_str::<u32>("nope").unwrap_err();
        let error: CallError = json_error.into();
        assert_eq!(error.error_type(), "serialization");
    }

    #[test]
    fn test_api_error_display_includes_status() {
        let error = CallError::Api {
            status: 503,
            body: "unavailable".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "API request failed with status 503: unavailable"
        );
    }
}
