//! Control-plane REST API.
//!
//! The orchestrator only sees the [`ControlPlane`] trait. [`ApiClient`] is
//! the `reqwest` implementation; tests substitute an in-memory mock.

mod client;

pub use client::ApiClient;

use async_trait::async_trait;
use common::secret::SecretString;
use common::types::{CallId, SessionId};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

use crate::errors::CallResult;
use crate::media::{IceConfiguration, SessionDescription};

/// Request body for `POST /v1/users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateUserRequest {
    pub first_name: String,
    pub last_name: String,
}

/// A freshly created app user and its call credential.
#[derive(Debug, Deserialize)]
pub struct CreateUserResponse {
    pub user_id: String,
    pub token: SecretString,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateDeviceRequest {
    /// Hex-encoded push token.
    pub push_token: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateDeviceResponse {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
}

/// One remote track to pull, addressed by its owner's media session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackLocator {
    pub session_id: String,
    pub track_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullTracksRequest {
    pub tracks: Vec<TrackLocator>,
}

/// One local track offered in a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushedTrack {
    pub mid: String,
    pub track_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushTracksRequest {
    pub session_description: SessionDescription,
    pub tracks: Vec<PushedTrack>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenegotiateRequest {
    pub session_description: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupportEntryRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
}

/// Per-track outcome of a pull or push.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrackResult {
    pub name: String,
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Response of the pull and push endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TracksResponse {
    #[serde(default)]
    pub requires_immediate_renegotiation: bool,
    #[serde(default)]
    pub session_description: Option<SessionDescription>,
    #[serde(default)]
    pub tracks: Vec<TrackResult>,
}

impl TracksResponse {
    /// `(name, error_description)` of every track that carries an error code.
    #[must_use]
    pub fn failed_tracks(&self) -> Vec<(String, String)> {
        self.tracks
            .iter()
            .filter(|t| t.error_code.is_some())
            .map(|t| {
                (
                    t.name.clone(),
                    t.error_description.clone().unwrap_or_default(),
                )
            })
            .collect()
    }

    /// Every track without an error code.
    #[must_use]
    pub fn successful_tracks(&self) -> Vec<&TrackResult> {
        self.tracks.iter().filter(|t| t.error_code.is_none()).collect()
    }
}

/// The REST control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_user(&self, request: &CreateUserRequest) -> CallResult<CreateUserResponse>;

    async fn create_device(&self, request: &CreateDeviceRequest)
        -> CallResult<CreateDeviceResponse>;

    async fn reset_device(&self, device_id: &str) -> CallResult<()>;

    async fn create_session(&self) -> CallResult<SessionId>;

    async fn fetch_ice_configuration(&self) -> CallResult<IceConfiguration>;

    async fn pull_tracks(
        &self,
        session: &SessionId,
        request: &PullTracksRequest,
    ) -> CallResult<TracksResponse>;

    async fn push_tracks(
        &self,
        session: &SessionId,
        request: &PushTracksRequest,
    ) -> CallResult<TracksResponse>;

    async fn renegotiate(&self, session: &SessionId, answer: &SessionDescription)
        -> CallResult<()>;

    async fn accept_call(&self, call_id: CallId) -> CallResult<()>;

    async fn end_call(&self, call_id: CallId) -> CallResult<()>;

    async fn create_support_entry(&self, request: &SupportEntryRequest) -> CallResult<()>;
}

/// Persistence for the app user's call credential.
pub trait CredentialStore: Send + Sync {
    fn credential(&self) -> Option<SecretString>;

    fn set_credential(&self, credential: Option<SecretString>);
}

/// Process-local credential store.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    credential: Mutex<Option<SecretString>>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new(credential: Option<SecretString>) -> Self {
        Self {
            credential: Mutex::new(credential),
        }
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn credential(&self) -> Option<SecretString> {
        self.credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_credential(&self, credential: Option<SecretString>) {
        *self.credential.lock().unwrap_or_else(PoisonError::into_inner) = credential;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    #[test]
    fn test_failed_and_successful_tracks() {
        let json = r#"{
            "requires_immediate_renegotiation": false,
            "tracks": [
                {"name": "audio", "error_code": "404", "error_description": "Track not found"},
                {"name": "video", "error_code": null}
            ]
        }"#;
        let response: TracksResponse = serde_json::from_str(json).unwrap();

        assert_eq!(
            response.failed_tracks(),
            vec![("audio".to_string(), "Track not found".to_string())]
        );
        let successful: Vec<&str> = response
            .successful_tracks()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(successful, vec!["video"]);
    }

    #[test]
    fn test_tracks_response_with_offer() {
        let json = r#"{
            "requires_immediate_renegotiation": true,
            "session_description": {"type": "offer", "sdp": "v=0"},
            "tracks": [{"name": "video", "mid": "2"}]
        }"#;
        let response: TracksResponse = serde_json::from_str(json).unwrap();
        assert!(response.requires_immediate_renegotiation);
        assert_eq!(response.session_description, Some(SessionDescription::offer("v=0")));
        assert_eq!(response.tracks.first().unwrap().mid.as_deref(), Some("2"));
    }

    #[test]
    fn test_support_entry_omits_missing_call_id() {
        let request = SupportEntryRequest {
            message: "no audio".to_string(),
            call_id: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"message":"no audio"}"#);
    }

    #[test]
    fn test_create_user_response_redacts_token() {
        let json = r#"{"user_id": "u-1", "token": "secret-token"}"#;
        let response: CreateUserResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.token.expose_secret(), "secret-token");
        assert!(!format!("{response:?}").contains("secret-token"));
    }

    #[test]
    fn test_in_memory_credential_store() {
        let store = InMemoryCredentialStore::default();
        assert!(store.credential().is_none());
        store.set_credential(Some(SecretString::from("tok")));
        assert_eq!(store.credential().unwrap().expose_secret(), "tok");
    }
}
