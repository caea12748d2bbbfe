//! Secret types for keeping credentials out of logs.
//!
//! Re-exports the [`secrecy`] types used for every credential the SDK
//! handles: the user bearer token, the signaling credential and the raw push
//! token before it is hex-encoded.
//!
//! `SecretString` implements `Debug` with redaction, so a struct that derives
//! `Debug` over a credential stays safe to pass to `tracing`.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct Session {
//!     user_id: String,
//!     token: SecretString,
//! }
//!
//! let session = Session {
//!     user_id: "user-1".to_string(),
//!     token: SecretString::from("eyJhbGciOi..."),
//! };
//!
//! assert!(!format!("{session:?}").contains("eyJhbGciOi"));
//! let header = format!("Bearer {}", session.token.expose_secret());
//! assert!(header.starts_with("Bearer "));
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Render a bearer `Authorization` header value for a credential.
///
/// The returned string contains the raw token, so it must only be handed to
/// the HTTP or socket layer, never logged.
#[must_use]
pub fn bearer_header(credential: &SecretString) -> String {
    format!("Bearer {}", credential.expose_secret())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("user-token-123");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("user-token-123"));
    }

    #[test]
    fn test_bearer_header() {
        let secret = SecretString::from("abc.def.ghi");
        assert_eq!(bearer_header(&secret), "Bearer abc.def.ghi");
    }

    #[test]
    fn test_deserialized_credential_is_redacted() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct CreateUserResponse {
            user_id: String,
            token: SecretString,
        }

        let json = r#"{"user_id": "u-1", "token": "super-secret"}"#;
        let response: CreateUserResponse = serde_json::from_str(json).expect("deserialize");

        assert_eq!(response.token.expose_secret(), "super-secret");
        let debug = format!("{response:?}");
        assert!(debug.contains("u-1"));
        assert!(!debug.contains("super-secret"));
    }
}
