//! Per-process owner of the active call.
//!
//! The manager is what the host application talks to: push payloads, UI
//! intents, app lifecycle and account setup all come through here. At most
//! one call is active; the slot frees itself when that call ends.

use common::secret::SecretString;
use common::types::CallId;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

use super::events::{CallDependencies, IncomingCall};
use super::orchestrator::Call;
use crate::api::{CreateDeviceRequest, CreateUserRequest, CredentialStore, SupportEntryRequest};
use crate::config::Config;
use crate::errors::{CallError, CallResult};
use crate::signaling::messages::AppState;

/// A user action from the incoming-call UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallIntent {
    Answer(CallId),
    End(CallId),
}

/// Owner of the active call and the OS-facing collaborators.
pub struct CallManager {
    config: Config,
    deps: CallDependencies,
    credentials: Arc<dyn CredentialStore>,
    active: Arc<Mutex<Option<Call>>>,
    device_id: Mutex<Option<String>>,
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("active", &self.active_call().map(|call| call.id()))
            .finish_non_exhaustive()
    }
}

impl CallManager {
    pub fn new(
        config: Config,
        deps: CallDependencies,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            config,
            deps,
            credentials,
            active: Arc::new(Mutex::new(None)),
            device_id: Mutex::new(None),
        }
    }

    /// The active call, if any and not yet ended.
    #[must_use]
    pub fn active_call(&self) -> Option<Call> {
        self.active_slot()
            .as_ref()
            .filter(|call| !call.is_ended())
            .cloned()
    }

    /// Handle an incoming-call push: create the call, show it, and connect
    /// in the background so the call is ready by the time the user answers.
    ///
    /// # Errors
    ///
    /// `Serialization` for a malformed payload, `NotAuthenticated` without
    /// a stored credential, `InvalidState` while another call is active.
    #[instrument(skip_all, name = "manager.incoming_call")]
    pub fn report_incoming_call(&self, payload: &[u8]) -> CallResult<Call> {
        let incoming = IncomingCall::from_payload(payload)?;
        let credential = self.require_credential()?;
        let call = self.install(incoming.uuid)?;

        info!(
            target: "call.manager",
            call_id = %incoming.uuid,
            has_video = incoming.has_video,
            "Incoming call"
        );
        self.deps.reporter.report_incoming_call(&incoming);

        let background = call.clone();
        tokio::spawn(async move {
            if let Err(e) = background
                .connect(&credential, &incoming.caller_name, &incoming.url)
                .await
            {
                warn!(
                    target: "call.manager",
                    call_id = %incoming.uuid,
                    error = %e,
                    "Background connect failed"
                );
            }
        });

        Ok(call)
    }

    /// Place a call: connect, answer and join.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` without a stored credential, `InvalidState` while
    /// another call is active, otherwise the failing step's error.
    #[instrument(skip_all, name = "manager.start_call")]
    pub async fn start_call(&self, caller_name: &str, url: &str) -> CallResult<Call> {
        let credential = self.require_credential()?;
        let call = self.install(CallId::new())?;
        info!(target: "call.manager", call_id = %call.id(), "Starting call");

        call.connect(&credential, caller_name, url).await?;
        call.answer();
        call.join().await?;
        Ok(call)
    }

    /// Apply a UI intent.
    ///
    /// Ending a call that is not active here declines it through the REST
    /// end call so the caller stops ringing.
    ///
    /// # Errors
    ///
    /// `InvalidState` when answering a call that is not active, otherwise
    /// whatever joining or declining reports.
    pub async fn handle_intent(&self, intent: CallIntent) -> CallResult<()> {
        debug!(target: "call.manager", intent = ?intent, "Handling intent");
        match intent {
            CallIntent::Answer(uuid) => {
                let call = self.matching_call(uuid).ok_or_else(|| {
                    CallError::InvalidState(format!("no active call {uuid} to answer"))
                })?;
                call.answer();
                call.join().await
            }
            CallIntent::End(uuid) => match self.matching_call(uuid) {
                Some(call) => {
                    call.end(uuid).await;
                    Ok(())
                }
                None => {
                    info!(target: "call.manager", call_id = %uuid, "Declining call that is not active");
                    self.deps.api.end_call(uuid).await
                }
            },
        }
    }

    /// Register this device for call pushes. Returns the device id.
    ///
    /// # Errors
    ///
    /// Whatever the control plane reports.
    pub async fn register_push_token(&self, token: &[u8]) -> CallResult<String> {
        let request = CreateDeviceRequest {
            push_token: hex::encode(token),
            platform: self.config.device_platform.clone(),
        };
        let device = self.deps.api.create_device(&request).await?;
        info!(target: "call.manager", device_id = %device.device_id, "Push token registered");

        *self
            .device_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(device.device_id.clone());
        Ok(device.device_id)
    }

    /// Forget the registered push token. No-op when none was registered.
    ///
    /// # Errors
    ///
    /// Whatever the control plane reports; the device id is kept so the
    /// reset can be retried.
    pub async fn invalidate_push_token(&self) -> CallResult<()> {
        let device_id = self
            .device_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(device_id) = device_id else {
            debug!(target: "call.manager", "No push token registered");
            return Ok(());
        };

        self.deps.api.reset_device(&device_id).await?;
        self.device_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(target: "call.manager", device_id = %device_id, "Push token invalidated");
        Ok(())
    }

    /// Forward an app lifecycle change to the active call. No-op without one.
    ///
    /// # Errors
    ///
    /// See [`Call::set_app_state`].
    pub async fn set_app_state(&self, state: AppState) -> CallResult<()> {
        match self.active_call() {
            Some(call) => call.set_app_state(state).await,
            None => Ok(()),
        }
    }

    /// Create the app user and keep its credential. Returns the user id.
    ///
    /// # Errors
    ///
    /// Whatever the control plane reports.
    pub async fn create_user(&self, first_name: &str, last_name: &str) -> CallResult<String> {
        let response = self
            .deps
            .api
            .create_user(&CreateUserRequest {
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
            })
            .await?;
        self.credentials.set_credential(Some(response.token));
        info!(target: "call.manager", user_id = %response.user_id, "User created");
        Ok(response.user_id)
    }

    /// File a support entry, tagged with the active call when there is one.
    ///
    /// # Errors
    ///
    /// Whatever the control plane reports.
    pub async fn create_support_entry(&self, message: &str) -> CallResult<()> {
        let request = SupportEntryRequest {
            message: message.to_string(),
            call_id: self.active_call().map(|call| call.id()),
        };
        self.deps.api.create_support_entry(&request).await
    }

    fn require_credential(&self) -> CallResult<SecretString> {
        self.credentials.credential().ok_or(CallError::NotAuthenticated)
    }

    fn matching_call(&self, uuid: CallId) -> Option<Call> {
        self.active_call().filter(|call| call.id() == uuid)
    }

    fn active_slot(&self) -> MutexGuard<'_, Option<Call>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the active slot for a new call and release it when that call
    /// ends.
    fn install(&self, id: CallId) -> CallResult<Call> {
        let call = {
            let mut slot = self.active_slot();
            if let Some(existing) = slot.as_ref().filter(|call| !call.is_ended()) {
                return Err(CallError::InvalidState(format!(
                    "call {} is already active",
                    existing.id()
                )));
            }
            let call = Call::new(id, &self.config, self.deps.clone());
            *slot = Some(call.clone());
            call
        };

        let ended = call.ended_token();
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            ended.cancelled().await;
            let mut slot = active.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().is_some_and(|call| call.id() == id) {
                *slot = None;
                debug!(target: "call.manager", call_id = %id, "Active call cleared");
            }
        });

        Ok(call)
    }
}
