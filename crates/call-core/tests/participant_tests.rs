//! `call.updated` handling: local track intent, host reconciliation and
//! remote track pulls.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use call_core::api::{TrackResult, TracksResponse};
use call_core::media::{SdpType, SessionDescription};
use call_core::signaling::messages::AppState;
use call_core::tracks::TrackSource;
use call_core::Call;
use serde_json::{json, Value};
use support::{wait_until, Harness};

async fn push_update(harness: &Harness, call: &Call, participants: Value) {
    harness
        .push(
            "call.updated",
            json!({"call_id": call.id(), "participants": participants}),
        )
        .await;
}

fn host_with_camera(muted: bool) -> Value {
    json!({
        "id": "host-1",
        "role": "host",
        "first_name": "Ada",
        "last_name": "Lovelace",
        "tracks": [
            {"id": "sid-1/cam", "type": "video", "muted": muted},
            {"id": "sid-1/mic", "type": "audio", "muted": true}
        ]
    })
}

fn camera_subscribed(call: &Call) -> bool {
    call.hosts()
        .first()
        .and_then(|host| host.publication(TrackSource::Camera))
        .is_some_and(|publication| publication.is_subscribed())
}

// ============================================================================
// Hosts
// ============================================================================

#[tokio::test]
async fn test_host_tracks_are_pulled_and_renegotiated() {
    let harness = Harness::new();
    harness.api.set_pull_response(TracksResponse {
        requires_immediate_renegotiation: true,
        session_description: Some(SessionDescription::offer("remote-offer")),
        tracks: vec![TrackResult {
            name: "cam".to_string(),
            mid: Some("7".to_string()),
            error_code: None,
            error_description: None,
        }],
    });
    let call = harness.joined_call().await;

    push_update(&harness, &call, json!([host_with_camera(false)])).await;
    assert!(wait_until(|| camera_subscribed(&call)).await);

    let hosts = call.hosts();
    let host = hosts.first().unwrap();
    assert_eq!(host.id(), "host-1");
    assert_eq!(host.first_name().as_deref(), Some("Ada"));

    // Only the unmuted camera is requested, addressed by its owner's session.
    let pulls = harness.api.pull_requests();
    let (session, request) = pulls.first().unwrap();
    assert_eq!(session.to_string(), "mock-session");
    assert_eq!(request.tracks.len(), 1);
    let locator = request.tracks.first().unwrap();
    assert_eq!(locator.session_id, "sid-1");
    assert_eq!(locator.track_name, "cam");

    let camera = host.publication(TrackSource::Camera).unwrap();
    assert_eq!(camera.track().unwrap().mid(), Some("7"));
    assert!(!host.publication(TrackSource::Microphone).unwrap().is_subscribed());

    // The remote offer was answered locally and the answer sent back.
    let renegotiations = harness.api.renegotiations();
    let (_, answer) = renegotiations.first().unwrap();
    assert_eq!(answer.kind, SdpType::Answer);
    let peer = harness.engine.last_peer().unwrap();
    assert!(peer
        .remote_descriptions()
        .iter()
        .any(|description| description.sdp == "remote-offer"));
}

#[tokio::test]
async fn test_rejected_track_is_retried_on_next_update() {
    let harness = Harness::new();
    harness.api.set_pull_response(TracksResponse {
        requires_immediate_renegotiation: false,
        session_description: None,
        tracks: vec![TrackResult {
            name: "cam".to_string(),
            mid: None,
            error_code: Some("not_found".to_string()),
            error_description: Some("track not published yet".to_string()),
        }],
    });
    let call = harness.joined_call().await;

    push_update(&harness, &call, json!([host_with_camera(false)])).await;
    let api = harness.api.clone();
    assert!(wait_until(|| api.pull_requests().len() == 1).await);
    assert!(!camera_subscribed(&call));

    push_update(&harness, &call, json!([host_with_camera(false)])).await;
    assert!(wait_until(|| api.pull_requests().len() == 2).await);
    assert!(api.renegotiations().is_empty());
}

#[tokio::test]
async fn test_muted_host_track_is_pulled_once_unmuted() {
    let harness = Harness::new();
    harness.api.set_pull_response(TracksResponse {
        requires_immediate_renegotiation: false,
        session_description: None,
        tracks: vec![TrackResult {
            name: "cam".to_string(),
            mid: Some("3".to_string()),
            error_code: None,
            error_description: None,
        }],
    });
    let call = harness.joined_call().await;

    push_update(&harness, &call, json!([host_with_camera(true)])).await;
    assert!(wait_until(|| !call.hosts().is_empty()).await);
    assert!(harness.api.pull_requests().is_empty());

    push_update(&harness, &call, json!([host_with_camera(false)])).await;
    assert!(wait_until(|| camera_subscribed(&call)).await);
}

#[tokio::test]
async fn test_departed_host_is_removed() {
    let harness = Harness::new();
    harness.api.set_pull_response(TracksResponse {
        requires_immediate_renegotiation: false,
        session_description: None,
        tracks: vec![TrackResult {
            name: "cam".to_string(),
            mid: Some("3".to_string()),
            error_code: None,
            error_description: None,
        }],
    });
    let call = harness.joined_call().await;

    push_update(&harness, &call, json!([host_with_camera(false)])).await;
    assert!(wait_until(|| camera_subscribed(&call)).await);
    let camera = call
        .hosts()
        .first()
        .and_then(|host| host.publication(TrackSource::Camera))
        .unwrap();

    push_update(&harness, &call, json!([])).await;
    assert!(wait_until(|| call.hosts().is_empty()).await);
    assert!(!camera.is_subscribed());
}

#[tokio::test]
async fn test_updates_for_other_calls_are_ignored() {
    let harness = Harness::new();
    let call = harness.joined_call().await;

    harness
        .push(
            "call.updated",
            json!({
                "call_id": common::types::CallId::new(),
                "participants": [host_with_camera(false)]
            }),
        )
        .await;
    // Events are handled in order: once host-2 shows up the foreign update
    // has already been handled.
    push_update(&harness, &call, json!([{"id": "host-2", "role": "host"}])).await;

    assert!(wait_until(|| !call.hosts().is_empty()).await);
    let ids: Vec<String> = call.hosts().iter().map(|h| h.id().to_string()).collect();
    assert_eq!(ids, vec!["host-2".to_string()]);
}

// ============================================================================
// Local user intent
// ============================================================================

#[tokio::test]
async fn test_server_can_enable_screen_share() {
    let harness = Harness::new();
    let call = harness.joined_call().await;

    push_update(
        &harness,
        &call,
        json!([{
            "id": "user-1",
            "role": "user",
            "tracks": [{"id": "ignored", "type": "screen_video", "muted": false}]
        }]),
    )
    .await;

    assert!(wait_until(|| call.user().publication(TrackSource::ScreenVideo).is_some()).await);
    let screen = call.user().publication(TrackSource::ScreenVideo).unwrap();
    assert!(wait_until(|| !screen.track().is_muted()).await);
    assert!(harness.devices.capturer_for(TrackSource::ScreenVideo).is_some());
}

#[tokio::test]
async fn test_server_mute_sends_track_update() {
    let harness = Harness::new();
    let call = harness.joined_call().await;
    let microphone = call.user().publication(TrackSource::Microphone).unwrap();

    push_update(
        &harness,
        &call,
        json!([{
            "id": "user-1",
            "role": "user",
            "tracks": [{"id": microphone.id(), "type": "audio", "muted": true}]
        }]),
    )
    .await;

    assert!(wait_until(|| microphone.track().is_muted()).await);
    let connector = harness.connector.clone();
    let expected = json!({
        "type": "call.participant.track.update",
        "data": {"id": microphone.id(), "type": "audio", "muted": true}
    });
    assert!(
        wait_until(|| connector
            .sent_frames()
            .iter()
            .filter_map(|frame| serde_json::from_str::<Value>(frame).ok())
            .any(|frame| frame == expected))
        .await
    );
}

#[tokio::test]
async fn test_missing_device_keeps_call_up() {
    let harness = Harness::new();
    harness.devices.remove_device(TrackSource::Camera);
    let call = harness.joined_call().await;

    push_update(
        &harness,
        &call,
        json!([
            {
                "id": "user-1",
                "role": "user",
                "tracks": [{"id": "cam", "type": "video", "muted": false}]
            },
            {"id": "host-2", "role": "host"}
        ]),
    )
    .await;

    // The host entry after the failed camera request is still applied.
    assert!(wait_until(|| !call.hosts().is_empty()).await);
    assert!(call.user().publication(TrackSource::Camera).is_none());
    assert!(!call.is_ended());
}

#[tokio::test]
async fn test_background_suspends_local_video() {
    let harness = Harness::new();
    let call = harness.joined_call().await;

    push_update(
        &harness,
        &call,
        json!([{
            "id": "user-1",
            "role": "user",
            "tracks": [{"id": "cam", "type": "video", "muted": false}]
        }]),
    )
    .await;
    assert!(wait_until(|| call
        .user()
        .publication(TrackSource::Camera)
        .is_some_and(|camera| !camera.track().is_muted()))
    .await);
    let camera = call.user().publication(TrackSource::Camera).unwrap();

    call.set_app_state(AppState::Background).await.unwrap();
    assert!(camera.is_suspended().await);
    assert!(camera.track().is_muted());
    assert!(harness.wait_for_frame("call.participant.update").await);

    call.set_app_state(AppState::Foreground).await.unwrap();
    assert!(!camera.is_suspended().await);
    assert!(!camera.track().is_muted());

    // Audio is never suspended.
    let microphone = call.user().publication(TrackSource::Microphone).unwrap();
    assert!(!microphone.track().is_muted());
}
