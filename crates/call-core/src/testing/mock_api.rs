//! In-memory control plane.
//!
//! Records every request and answers with configurable responses. Any
//! operation can be made to fail by name.

use async_trait::async_trait;
use common::secret::SecretString;
use common::types::{CallId, SessionId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::api::{
    ControlPlane, CreateDeviceRequest, CreateDeviceResponse, CreateUserRequest,
    CreateUserResponse, PullTracksRequest, PushTracksRequest, SupportEntryRequest, TracksResponse,
};
use crate::errors::{CallError, CallResult};
use crate::media::{IceConfiguration, IceServer, SessionDescription};

#[derive(Debug, Default)]
struct Recorded {
    sessions_created: usize,
    ice_fetches: usize,
    users: Vec<CreateUserRequest>,
    devices: Vec<CreateDeviceRequest>,
    reset_devices: Vec<String>,
    pulls: Vec<(SessionId, PullTracksRequest)>,
    pushes: Vec<(SessionId, PushTracksRequest)>,
    renegotiations: Vec<(SessionId, SessionDescription)>,
    accepted: Vec<CallId>,
    ended: Vec<CallId>,
    support_entries: Vec<SupportEntryRequest>,
}

#[derive(Debug)]
struct Responses {
    session_id: SessionId,
    ice: IceConfiguration,
    pull: TracksResponse,
    failures: HashMap<&'static str, CallError>,
}

/// Mock [`ControlPlane`].
#[derive(Debug)]
pub struct MockControlPlane {
    recorded: Mutex<Recorded>,
    responses: Mutex<Responses>,
}

impl Default for MockControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl MockControlPlane {
    #[must_use]
    pub fn new() -> Self {
        Self {
            recorded: Mutex::new(Recorded::default()),
            responses: Mutex::new(Responses {
                session_id: SessionId::from("mock-session"),
                ice: IceConfiguration {
                    ice_servers: vec![IceServer {
                        urls: vec!["stun:stun.example.com:3478".to_string()],
                        username: None,
                        credential: None,
                    }],
                },
                pull: TracksResponse {
                    requires_immediate_renegotiation: false,
                    session_description: None,
                    tracks: Vec::new(),
                },
                failures: HashMap::new(),
            }),
        }
    }

    /// Make `operation` (the trait method name) fail with `error`.
    pub fn fail(&self, operation: &'static str, error: CallError) {
        self.responses().failures.insert(operation, error);
    }

    pub fn set_session_id(&self, session_id: &str) {
        self.responses().session_id = SessionId::from(session_id);
    }

    pub fn set_pull_response(&self, response: TracksResponse) {
        self.responses().pull = response;
    }

    #[must_use]
    pub fn sessions_created(&self) -> usize {
        self.recorded().sessions_created
    }

    #[must_use]
    pub fn ice_fetches(&self) -> usize {
        self.recorded().ice_fetches
    }

    #[must_use]
    pub fn users(&self) -> Vec<CreateUserRequest> {
        self.recorded().users.clone()
    }

    #[must_use]
    pub fn devices(&self) -> Vec<CreateDeviceRequest> {
        self.recorded().devices.clone()
    }

    #[must_use]
    pub fn reset_devices(&self) -> Vec<String> {
        self.recorded().reset_devices.clone()
    }

    #[must_use]
    pub fn pull_requests(&self) -> Vec<(SessionId, PullTracksRequest)> {
        self.recorded().pulls.clone()
    }

    #[must_use]
    pub fn push_requests(&self) -> Vec<(SessionId, PushTracksRequest)> {
        self.recorded().pushes.clone()
    }

    #[must_use]
    pub fn renegotiations(&self) -> Vec<(SessionId, SessionDescription)> {
        self.recorded().renegotiations.clone()
    }

    #[must_use]
    pub fn accepted_calls(&self) -> Vec<CallId> {
        self.recorded().accepted.clone()
    }

    #[must_use]
    pub fn ended_calls(&self) -> Vec<CallId> {
        self.recorded().ended.clone()
    }

    #[must_use]
    pub fn support_entries(&self) -> Vec<SupportEntryRequest> {
        self.recorded().support_entries.clone()
    }

    fn check(&self, operation: &'static str) -> CallResult<()> {
        match self.responses().failures.get(operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn responses(&self) -> MutexGuard<'_, Responses> {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn create_user(&self, request: &CreateUserRequest) -> CallResult<CreateUserResponse> {
        self.recorded().users.push(request.clone());
        self.check("create_user")?;
        Ok(CreateUserResponse {
            user_id: "mock-user".to_string(),
            token: SecretString::from("mock-user-token"),
        })
    }

    async fn create_device(
        &self,
        request: &CreateDeviceRequest,
    ) -> CallResult<CreateDeviceResponse> {
        self.recorded().devices.push(request.clone());
        self.check("create_device")?;
        Ok(CreateDeviceResponse {
            device_id: "mock-device".to_string(),
        })
    }

    async fn reset_device(&self, device_id: &str) -> CallResult<()> {
        self.recorded().reset_devices.push(device_id.to_string());
        self.check("reset_device")
    }

    async fn create_session(&self) -> CallResult<SessionId> {
        self.recorded().sessions_created += 1;
        self.check("create_session")?;
        Ok(self.responses().session_id.clone())
    }

    async fn fetch_ice_configuration(&self) -> CallResult<IceConfiguration> {
        self.recorded().ice_fetches += 1;
        self.check("fetch_ice_configuration")?;
        Ok(self.responses().ice.clone())
    }

    async fn pull_tracks(
        &self,
        session: &SessionId,
        request: &PullTracksRequest,
    ) -> CallResult<TracksResponse> {
        self.recorded().pulls.push((session.clone(), request.clone()));
        self.check("pull_tracks")?;
        Ok(self.responses().pull.clone())
    }

    /// Answers the pushed offer and reports every pushed track as accepted.
    async fn push_tracks(
        &self,
        session: &SessionId,
        request: &PushTracksRequest,
    ) -> CallResult<TracksResponse> {
        self.recorded().pushes.push((session.clone(), request.clone()));
        self.check("push_tracks")?;
        Ok(TracksResponse {
            requires_immediate_renegotiation: false,
            session_description: Some(SessionDescription::answer(format!(
                "answer to {}",
                request.session_description.sdp
            ))),
            tracks: request
                .tracks
                .iter()
                .map(|t| crate::api::TrackResult {
                    name: t.track_name.clone(),
                    mid: Some(t.mid.clone()),
                    error_code: None,
                    error_description: None,
                })
                .collect(),
        })
    }

    async fn renegotiate(
        &self,
        session: &SessionId,
        answer: &SessionDescription,
    ) -> CallResult<()> {
        self.recorded()
            .renegotiations
            .push((session.clone(), answer.clone()));
        self.check("renegotiate")
    }

    async fn accept_call(&self, call_id: CallId) -> CallResult<()> {
        self.recorded().accepted.push(call_id);
        self.check("accept_call")
    }

    async fn end_call(&self, call_id: CallId) -> CallResult<()> {
        self.recorded().ended.push(call_id);
        self.check("end_call")
    }

    async fn create_support_entry(&self, request: &SupportEntryRequest) -> CallResult<()> {
        self.recorded().support_entries.push(request.clone());
        self.check("create_support_entry")
    }
}
