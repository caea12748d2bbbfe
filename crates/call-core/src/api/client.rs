//! `reqwest` implementation of the control plane.
//!
//! Every request carries the app user's credential as a bearer token. Error
//! bodies are sanitized before they end up in a `CallError`, since the
//! control plane echoes request headers back on some failures.

use async_trait::async_trait;
use common::secret::{bearer_header, SecretString};
use common::types::{CallId, SessionId};
use regex::Regex;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tracing::{debug, error, instrument, warn};

use super::{
    ControlPlane, CreateDeviceRequest, CreateDeviceResponse, CreateSessionResponse,
    CreateUserRequest, CreateUserResponse, CredentialStore, PullTracksRequest, PushTracksRequest,
    RenegotiateRequest, SupportEntryRequest, TracksResponse,
};
use crate::config::Config;
use crate::errors::{CallError, CallResult};
use crate::media::{IceConfiguration, SessionDescription};
use crate::observability::metrics;

/// Maximum length for an error body kept in a `CallError`.
const MAX_ERROR_BODY_LEN: usize = 256;

/// JWT-shaped tokens (header.payload.signature).
static JWT_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+(?:\.[A-Za-z0-9_-]*)?").ok()
});

/// `Bearer <token>` in free text.
static BEARER_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").ok());

/// Redact credentials from an error body and cap its length.
///
/// Bearer patterns go first so `Bearer <JWT>` is redacted as a whole.
pub(crate) fn sanitize_error_body(body: &str) -> String {
    let mut sanitized = body.to_string();
    if let Some(pattern) = BEARER_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "[BEARER_REDACTED]")
            .into_owned();
    }
    if let Some(pattern) = JWT_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "[JWT_REDACTED]").into_owned();
    }

    if sanitized.chars().count() > MAX_ERROR_BODY_LEN {
        let truncated: String = sanitized.chars().take(MAX_ERROR_BODY_LEN).collect();
        format!("{truncated}...[truncated]")
    } else {
        sanitized
    }
}

/// HTTP client for the control plane.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    fallback_token: Option<SecretString>,
    credentials: Arc<dyn CredentialStore>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Build a client for `config.api_base_url`.
    ///
    /// The credential store is consulted on every request; `CALL_API_TOKEN`
    /// is used when the store is empty.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Internal` if the HTTP client cannot be built.
    pub fn new(config: &Config, credentials: Arc<dyn CredentialStore>) -> CallResult<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .connect_timeout(config.http_timeout)
            .build()
            .map_err(|e| {
                error!(target: "call.api", error = %e, "Failed to build HTTP client");
                CallError::Internal(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: config.api_base_url.clone(),
            fallback_token: config.api_token.clone(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn credential(&self) -> Option<SecretString> {
        self.credentials
            .credential()
            .or_else(|| self.fallback_token.clone())
    }

    /// Authenticate, send and map the status. Records one metric per request.
    async fn execute(&self, operation: &'static str, request: RequestBuilder) -> CallResult<Response> {
        let request = match self.credential() {
            Some(credential) => request.header(AUTHORIZATION, bearer_header(&credential)),
            None => request,
        };

        let start = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                metrics::record_api_request(operation, "error", start.elapsed());
                warn!(target: "call.api", operation, error = %e, "Control-plane request failed");
                return Err(CallError::Http(e.to_string()));
            }
        };

        let status = response.status();
        metrics::record_api_request(operation, metrics::status_class(status.as_u16()), start.elapsed());

        if status.is_success() {
            debug!(target: "call.api", operation, status = status.as_u16(), "Control-plane request succeeded");
            return Ok(response);
        }

        if status == StatusCode::UNAUTHORIZED {
            warn!(target: "call.api", operation, "Control plane rejected the credential");
            return Err(CallError::NotAuthenticated);
        }

        let body = sanitize_error_body(&response.text().await.unwrap_or_default());
        warn!(
            target: "call.api",
            operation,
            status = status.as_u16(),
            body = %body,
            "Control plane returned an error"
        );
        Err(CallError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn json<T: DeserializeOwned>(operation: &'static str, response: Response) -> CallResult<T> {
        response.json().await.map_err(|e| {
            error!(target: "call.api", operation, error = %e, "Failed to parse control-plane response");
            CallError::Serialization(e.to_string())
        })
    }
}

#[async_trait]
impl ControlPlane for ApiClient {
    #[instrument(skip_all)]
    async fn create_user(&self, request: &CreateUserRequest) -> CallResult<CreateUserResponse> {
        let response = self
            .execute("create_user", self.client.post(self.url("/v1/users")).json(request))
            .await?;
        Self::json("create_user", response).await
    }

    #[instrument(skip_all, fields(platform = %request.platform))]
    async fn create_device(
        &self,
        request: &CreateDeviceRequest,
    ) -> CallResult<CreateDeviceResponse> {
        let response = self
            .execute("create_device", self.client.post(self.url("/v1/devices")).json(request))
            .await?;
        Self::json("create_device", response).await
    }

    #[instrument(skip_all, fields(device_id = %device_id))]
    async fn reset_device(&self, device_id: &str) -> CallResult<()> {
        self.execute(
            "reset_device",
            self.client.delete(self.url(&format!("/v1/devices/{device_id}"))),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn create_session(&self) -> CallResult<SessionId> {
        let response = self
            .execute("create_session", self.client.post(self.url("/v1/sessions")))
            .await?;
        let created: CreateSessionResponse = Self::json("create_session", response).await?;
        Ok(created.session_id)
    }

    #[instrument(skip_all)]
    async fn fetch_ice_configuration(&self) -> CallResult<IceConfiguration> {
        let response = self
            .execute("fetch_ice_configuration", self.client.get(self.url("/v1/ice-servers")))
            .await?;
        Self::json("fetch_ice_configuration", response).await
    }

    #[instrument(skip_all, fields(session_id = %session, tracks = request.tracks.len()))]
    async fn pull_tracks(
        &self,
        session: &SessionId,
        request: &PullTracksRequest,
    ) -> CallResult<TracksResponse> {
        let url = self.url(&format!("/v1/sessions/{session}/tracks/pull"));
        let response = self
            .execute("pull_tracks", self.client.post(url).json(request))
            .await?;
        Self::json("pull_tracks", response).await
    }

    #[instrument(skip_all, fields(session_id = %session, tracks = request.tracks.len()))]
    async fn push_tracks(
        &self,
        session: &SessionId,
        request: &PushTracksRequest,
    ) -> CallResult<TracksResponse> {
        let url = self.url(&format!("/v1/sessions/{session}/tracks/push"));
        let response = self
            .execute("push_tracks", self.client.post(url).json(request))
            .await?;
        Self::json("push_tracks", response).await
    }

    #[instrument(skip_all, fields(session_id = %session))]
    async fn renegotiate(
        &self,
        session: &SessionId,
        answer: &SessionDescription,
    ) -> CallResult<()> {
        let url = self.url(&format!("/v1/sessions/{session}/renegotiate"));
        let body = RenegotiateRequest {
            session_description: answer.clone(),
        };
        self.execute("renegotiate", self.client.put(url).json(&body))
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(call_id = %call_id))]
    async fn accept_call(&self, call_id: CallId) -> CallResult<()> {
        let url = self.url(&format!("/v1/calls/{call_id}/accept"));
        self.execute("accept_call", self.client.post(url)).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(call_id = %call_id))]
    async fn end_call(&self, call_id: CallId) -> CallResult<()> {
        let url = self.url(&format!("/v1/calls/{call_id}/end"));
        self.execute("end_call", self.client.post(url)).await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn create_support_entry(&self, request: &SupportEntryRequest) -> CallResult<()> {
        self.execute(
            "create_support_entry",
            self.client.post(self.url("/v1/support")).json(request),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::api::{InMemoryCredentialStore, PullTracksRequest, TrackLocator};
    use crate::media::SdpType;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, credential: Option<&str>) -> ApiClient {
        let config = Config::new(server.uri());
        let store = Arc::new(InMemoryCredentialStore::new(
            credential.map(SecretString::from),
        ));
        ApiClient::new(&config, store).unwrap()
    }

    #[test]
    fn test_sanitize_redacts_bearer_and_jwt() {
        let body = "denied for Bearer abc.def.ghi and eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiIxIn0.sig";
        let sanitized = sanitize_error_body(body);
        assert!(sanitized.contains("[BEARER_REDACTED]"));
        assert!(sanitized.contains("[JWT_REDACTED]"));
        assert!(!sanitized.contains("abc.def.ghi"));
        assert!(!sanitized.contains("eyJhbGci"));
    }

    #[test]
    fn test_sanitize_truncates_long_bodies() {
        let body = "x".repeat(1000);
        let sanitized = sanitize_error_body(&body);
        assert!(sanitized.ends_with("...[truncated]"));
        assert_eq!(sanitized.len(), MAX_ERROR_BODY_LEN + "...[truncated]".len());
    }

    #[tokio::test]
    async fn test_create_session_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sessions"))
            .and(header("authorization", "Bearer user-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"session_id": "sess-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let session = client(&server, Some("user-token")).create_session().await.unwrap();
        assert_eq!(session, SessionId::from("sess-1"));
    }

    #[tokio::test]
    async fn test_fallback_token_used_when_store_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/ice-servers"))
            .and(header("authorization", "Bearer env-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ice_servers": [{"urls": ["stun:stun.example.com:3478"]}]
            })))
            .mount(&server)
            .await;

        let mut config = Config::new(server.uri());
        config.api_token = Some(SecretString::from("env-token"));
        let api = ApiClient::new(&config, Arc::new(InMemoryCredentialStore::default())).unwrap();

        let ice = api.fetch_ice_configuration().await.unwrap();
        assert_eq!(ice.ice_servers.len(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_not_authenticated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sessions"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server, Some("expired")).create_session().await.unwrap_err();
        assert_eq!(err, CallError::NotAuthenticated);
    }

    #[tokio::test]
    async fn test_error_body_is_sanitized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/support"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string("upstream saw Bearer leaked.token.value"),
            )
            .mount(&server)
            .await;

        let err = client(&server, Some("tok"))
            .create_support_entry(&SupportEntryRequest {
                message: "help".to_string(),
                call_id: None,
            })
            .await
            .unwrap_err();

        assert!(
            matches!(
                &err,
                CallError::Api { status: 500, body } if !body.contains("leaked.token.value")
            ),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn test_pull_tracks_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sessions/local-sess/tracks/pull"))
            .and(body_json(serde_json::json!({
                "tracks": [{"session_id": "host-sess", "track_name": "video"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "requires_immediate_renegotiation": true,
                "session_description": {"type": "offer", "sdp": "v=0"},
                "tracks": [{"name": "video", "mid": "1"}]
            })))
            .mount(&server)
            .await;

        let response = client(&server, Some("tok"))
            .pull_tracks(
                &SessionId::from("local-sess"),
                &PullTracksRequest {
                    tracks: vec![TrackLocator {
                        session_id: "host-sess".to_string(),
                        track_name: "video".to_string(),
                    }],
                },
            )
            .await
            .unwrap();

        assert_eq!(
            response.session_description.as_ref().map(|d| d.kind),
            Some(SdpType::Offer)
        );
        assert_eq!(response.successful_tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_renegotiate_puts_answer() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/sessions/s1/renegotiate"))
            .and(body_json(serde_json::json!({
                "session_description": {"type": "answer", "sdp": "v=0 answer"}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, Some("tok"))
            .renegotiate(&SessionId::from("s1"), &SessionDescription::answer("v=0 answer"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_call_routes_use_call_id() {
        let server = MockServer::start().await;
        let call_id = CallId::new();
        Mock::given(method("POST"))
            .and(path(format!("/v1/calls/{call_id}/accept")))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/v1/calls/{call_id}/end")))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server, Some("tok"));
        api.accept_call(call_id).await.unwrap();
        api.end_call(call_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_device_lifecycle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/devices"))
            .and(body_json(serde_json::json!({"push_token": "0aff", "platform": "ios"})))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"device_id": "d-9"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/devices/d-9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server, Some("tok"));
        let device = api
            .create_device(&CreateDeviceRequest {
                push_token: "0aff".to_string(),
                platform: "ios".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(device.device_id, "d-9");
        api.reset_device(&device.device_id).await.unwrap();
    }
}
