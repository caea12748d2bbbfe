//! Remote hosts and pulling their tracks.

use common::types::SessionId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

use super::resolution::resolve;
use crate::api::{ControlPlane, PullTracksRequest, TrackLocator};
use crate::errors::{CallError, CallResult};
use crate::media::MediaTransport;
use crate::observability::metrics;
use crate::signaling::messages::{ParticipantDescriptor, TrackState};
use crate::tracks::{RemoteTrack, RemoteTrackPublication, TrackSource};

/// Collaborators needed to pull remote tracks.
pub struct PullContext<'a> {
    pub api: &'a dyn ControlPlane,
    pub transport: &'a MediaTransport,
    /// Our own media session.
    pub session: &'a SessionId,
}

/// Result of one pull batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PullOutcome {
    /// Publication ids now subscribed.
    pub subscribed: Vec<String>,
    /// `(track name, error description)` reported by the control plane.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Default, Clone)]
struct Names {
    first: Option<String>,
    last: Option<String>,
}

/// A remote operator in the call.
#[derive(Debug)]
pub struct Host {
    id: String,
    names: Mutex<Names>,
    publications: Mutex<BTreeMap<String, Arc<RemoteTrackPublication>>>,
}

/// Split a composite `<session id>/<track name>` publication id.
fn split_track_id(id: &str) -> CallResult<TrackLocator> {
    match id.split_once('/') {
        Some((session, track)) if !session.is_empty() && !track.is_empty() => Ok(TrackLocator {
            session_id: session.to_string(),
            track_name: track.to_string(),
        }),
        _ => Err(CallError::InvalidState(format!(
            "malformed remote track id: {id}"
        ))),
    }
}

impl Host {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            names: Mutex::new(Names::default()),
            publications: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn first_name(&self) -> Option<String> {
        self.names_lock().first.clone()
    }

    pub fn last_name(&self) -> Option<String> {
        self.names_lock().last.clone()
    }

    /// Apply a `call.updated` descriptor. Returns publications to pull.
    pub fn update(&self, descriptor: &ParticipantDescriptor) -> Vec<Arc<RemoteTrackPublication>> {
        {
            let mut names = self.names_lock();
            names.first.clone_from(&descriptor.first_name);
            names.last.clone_from(&descriptor.last_name);
        }
        self.set_tracks(&descriptor.tracks)
    }

    pub fn publications(&self) -> Vec<Arc<RemoteTrackPublication>> {
        self.publications_lock().values().cloned().collect()
    }

    /// Publication filling `source`, see [`resolve`].
    pub fn publication(&self, source: TrackSource) -> Option<Arc<RemoteTrackPublication>> {
        let publications = self.publications_lock();
        resolve(publications.values(), source).cloned()
    }

    /// Reconcile the host's advertised tracks with our publications.
    ///
    /// Unseen ids become unsubscribed publications, known ids get their mute
    /// flag updated and ids no longer advertised are dropped. Returns every
    /// unsubscribed, unmuted publication.
    pub fn set_tracks(&self, tracks: &[TrackState]) -> Vec<Arc<RemoteTrackPublication>> {
        let mut publications = self.publications_lock();

        for track in tracks {
            match publications.get(&track.id) {
                Some(publication) => publication.set_muted(track.muted),
                None => {
                    let (kind, source) = track.track_type.kind_and_source();
                    debug!(
                        target: "call.participant",
                        host_id = %self.id,
                        track_id = %track.id,
                        source = source.as_str(),
                        "Remote track advertised"
                    );
                    publications.insert(
                        track.id.clone(),
                        Arc::new(RemoteTrackPublication::new(
                            track.id.clone(),
                            kind,
                            source,
                            track.muted,
                        )),
                    );
                }
            }
        }

        publications.retain(|id, publication| {
            let advertised = tracks.iter().any(|t| &t.id == id);
            if !advertised {
                publication.unsubscribe();
                debug!(target: "call.participant", host_id = %self.id, track_id = %id, "Remote track withdrawn");
            }
            advertised
        });

        publications
            .values()
            .filter(|p| p.needs_pull())
            .cloned()
            .collect()
    }

    /// Drop every publication. Used when the host leaves.
    pub fn clear(&self) {
        for publication in std::mem::take(&mut *self.publications_lock()).into_values() {
            publication.unsubscribe();
        }
    }

    /// Pull `publications` in one batch.
    ///
    /// Pull, answer the returned offer, then renegotiate with that answer.
    /// Tracks the control plane rejected stay unsubscribed so the next
    /// reconciliation retries them.
    ///
    /// # Errors
    ///
    /// `InvalidState` for a malformed composite id (nothing is requested),
    /// otherwise whatever the control plane or the transport report.
    #[instrument(skip_all, name = "participant.pull", fields(host_id = %self.id, tracks = publications.len()))]
    pub async fn pull(
        &self,
        publications: &[Arc<RemoteTrackPublication>],
        ctx: &PullContext<'_>,
    ) -> CallResult<PullOutcome> {
        if publications.is_empty() {
            return Ok(PullOutcome::default());
        }

        let result = self.pull_batch(publications, ctx).await;
        match &result {
            Ok(outcome) => {
                metrics::record_pull("success", outcome.subscribed.len(), outcome.failed.len());
            }
            Err(e) => {
                metrics::record_pull("error", 0, 0);
                warn!(target: "call.participant", host_id = %self.id, error = %e, "Pull failed");
            }
        }
        result
    }

    async fn pull_batch(
        &self,
        publications: &[Arc<RemoteTrackPublication>],
        ctx: &PullContext<'_>,
    ) -> CallResult<PullOutcome> {
        let mut by_name: HashMap<String, Arc<RemoteTrackPublication>> = HashMap::new();
        let mut locators = Vec::with_capacity(publications.len());
        for publication in publications {
            let locator = split_track_id(publication.id())?;
            by_name.insert(locator.track_name.clone(), Arc::clone(publication));
            locators.push(locator);
        }

        let response = ctx
            .api
            .pull_tracks(ctx.session, &PullTracksRequest { tracks: locators })
            .await?;

        if let Some(offer) = response.session_description.clone() {
            let answer = ctx.transport.accept_remote_offer(offer).await?;
            ctx.api.renegotiate(ctx.session, &answer).await?;
        } else if response.requires_immediate_renegotiation {
            warn!(target: "call.participant", host_id = %self.id, "Renegotiation required but no offer returned");
        }

        let failed = response.failed_tracks();
        for (name, description) in &failed {
            warn!(
                target: "call.participant",
                host_id = %self.id,
                track = %name,
                error = %description,
                "Control plane could not pull track"
            );
        }

        let mut subscribed = Vec::new();
        for result in response.successful_tracks() {
            let Some(publication) = by_name.get(&result.name) else {
                debug!(target: "call.participant", track = %result.name, "Pull returned an unrequested track");
                continue;
            };
            publication.subscribe(Arc::new(RemoteTrack::new(
                publication.id(),
                publication.kind(),
                publication.source(),
                result.mid.clone(),
            )));
            subscribed.push(publication.id().to_string());
        }

        info!(
            target: "call.participant",
            host_id = %self.id,
            subscribed = subscribed.len(),
            failed = failed.len(),
            "Remote tracks pulled"
        );
        Ok(PullOutcome { subscribed, failed })
    }

    fn names_lock(&self) -> MutexGuard<'_, Names> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publications_lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<RemoteTrackPublication>>> {
        self.publications.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
