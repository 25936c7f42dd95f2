//! End-to-end tests: broadcasters and viewers negotiating with loopback
//! peers, over the in-process mailbox and over a WebSocket relay

use matchcast::{
    BroadcasterConnectionManager, BroadcasterEvent, BroadcasterStatus, CameraKey, CaptureError,
    ConnectionState, EventStream, FixtureId, HeadlessSurface, IceCandidate, LoopbackFailure,
    LoopbackNetwork, Matchcast, MemoryBackend, MessageKind, PeerConnection, PlaybackEvent,
    RelayClient, RelayConfig, RelayServer, RoomStore, Signal, SignalingChannel,
    StaticCameraSource, ViewerConnectionManager, ViewerDisplay, ViewerEvent, ViewerId,
    WriteLimit,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn fixture() -> FixtureId {
    FixtureId::new("fixture-42")
}

struct Harness {
    backend: MemoryBackend,
    network: LoopbackNetwork,
    matchcast: Matchcast,
}

impl Harness {
    fn new() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    fn with_backend(backend: MemoryBackend) -> Self {
        let network = LoopbackNetwork::new();
        let matchcast = Matchcast::builder()
            .backend(backend.clone())
            .peers(network.clone())
            .build()
            .unwrap();
        Self {
            backend,
            network,
            matchcast,
        }
    }

    async fn camera(&self, id: u8) -> BroadcasterConnectionManager {
        start_camera(&self.matchcast, id).await
    }

    async fn viewer(&self) -> ViewerConnectionManager {
        start_viewer(&self.matchcast).await
    }

    /// Viewer-side peers that are still open
    fn open_viewer_peers(&self) -> usize {
        self.network
            .peers()
            .iter()
            .filter(|p| p.remote().starts_with("camera") && !p.is_closed())
            .count()
    }

    async fn wait_for_empty_mailbox(&self) {
        wait_for_empty_mailbox(&self.backend).await;
    }
}

async fn start_camera(matchcast: &Matchcast, id: u8) -> BroadcasterConnectionManager {
    matchcast
        .broadcaster(fixture(), id)
        .camera_source(Arc::new(StaticCameraSource::default()))
        .heartbeat(Duration::from_secs(60), Duration::from_secs(120))
        .start()
        .await
        .unwrap()
}

async fn start_viewer(matchcast: &Matchcast) -> ViewerConnectionManager {
    matchcast
        .viewer(fixture())
        .request_delay(Duration::from_millis(10))
        .start()
        .await
        .unwrap()
}

async fn wait_for_empty_mailbox(backend: &MemoryBackend) {
    within(async {
        while !backend.pending(&fixture()).is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

/// Relay server on an ephemeral port; returns the server and its URL
async fn start_relay() -> (RelayServer, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(addr, MemoryBackend::new());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, format!("ws://{}", addr))
}

async fn over_relay(url: &str, network: &LoopbackNetwork) -> Matchcast {
    let client = within(RelayClient::connect(RelayConfig::new(url)))
        .await
        .unwrap();
    Matchcast::builder()
        .relay(client)
        .peers(network.clone())
        .build()
        .unwrap()
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(WAIT, future).await.expect("timed out")
}

async fn next_matching<E>(events: &mut EventStream<E>, predicate: impl Fn(&E) -> bool) -> E {
    within(async {
        loop {
            let event = events.next().await.expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
}

async fn camera_status(
    camera: &BroadcasterConnectionManager,
    predicate: impl FnMut(&BroadcasterStatus) -> bool,
) -> BroadcasterStatus {
    let mut status = camera.watch();
    let current = within(status.wait_for(predicate)).await.unwrap().clone();
    current
}

async fn connected(viewer: &ViewerConnectionManager) -> ViewerId {
    let snapshot = within(viewer.wait_for_state(ConnectionState::Connected))
        .await
        .unwrap();
    snapshot.viewer_id.unwrap()
}

#[tokio::test]
async fn test_viewer_connects_to_live_camera() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    camera.go_live().await.unwrap();

    let viewer = harness.viewer().await;
    let viewer_id = connected(&viewer).await;

    let snapshot = within(viewer.wait_for(|s| {
        matches!(&s.display, ViewerDisplay::Live { tracks } if tracks.len() == 2)
    }))
    .await
    .unwrap();
    assert_eq!(snapshot.camera, Some(CameraKey::from_id(1)));
    assert_eq!(snapshot.attempts, 1);
    assert!(viewer_id.as_str().starts_with("viewer-"));

    camera_status(&camera, |s| s.connected_viewers == 1).await;
    assert_eq!(harness.open_viewer_peers(), 1);
}

#[tokio::test]
async fn test_every_message_is_deleted_exactly_once() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    camera.go_live().await.unwrap();
    let viewer = harness.viewer().await;
    connected(&viewer).await;

    harness.wait_for_empty_mailbox().await;
    let stats = harness.backend.stats(&fixture());
    // request, offer, answer and one candidate from each side
    assert!(stats.published >= 5);
    assert_eq!(stats.deleted, stats.published);
    assert_eq!(stats.missed_deletes, 0);
}

#[tokio::test]
async fn test_camera_switch_tears_down_before_new_request() {
    let harness = Harness::new();
    let camera1 = harness.camera(1).await;
    let _camera2 = harness.camera(2).await;
    camera1.go_live().await.unwrap();

    let viewer = harness.viewer().await;
    let first_id = connected(&viewer).await;
    let mut events = viewer.events();

    camera1.set_active_camera(2).await.unwrap();

    let closed = next_matching(&mut events, |e| {
        matches!(e, ViewerEvent::AttemptClosed { .. } | ViewerEvent::RequestSent { .. })
    })
    .await;
    assert!(
        matches!(&closed, ViewerEvent::AttemptClosed { viewer_id, .. } if *viewer_id == first_id),
        "expected teardown first, got {:?}",
        closed
    );
    let request =
        next_matching(&mut events, |e| matches!(e, ViewerEvent::RequestSent { .. })).await;
    match request {
        ViewerEvent::RequestSent { viewer_id, camera } => {
            assert_ne!(viewer_id, first_id);
            assert_eq!(camera, CameraKey::from_id(2));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let snapshot = within(viewer.wait_for(|s| {
        s.state == ConnectionState::Connected && s.camera == Some(CameraKey::from_id(2))
    }))
    .await
    .unwrap();
    assert_eq!(snapshot.attempts, 2);
    assert!(harness.network.open_peers_to("camera1").is_empty());
    assert_eq!(harness.network.open_peers_to("camera2").len(), 1);
}

#[tokio::test]
async fn test_switched_away_camera_drops_its_viewer() {
    let harness = Harness::new();
    let camera1 = harness.camera(1).await;
    let _camera2 = harness.camera(2).await;
    camera1.go_live().await.unwrap();

    let viewer = harness.viewer().await;
    let first_id = connected(&viewer).await;
    camera_status(&camera1, |s| s.connected_viewers == 1).await;
    let mut camera_events = camera1.events();

    camera1.set_active_camera(2).await.unwrap();

    let dropped = next_matching(&mut camera_events, |e| {
        matches!(e, BroadcasterEvent::ViewerDropped { .. })
    })
    .await;
    assert!(
        matches!(&dropped, BroadcasterEvent::ViewerDropped { viewer_id, .. } if *viewer_id == first_id)
    );
    let status = camera_status(&camera1, |s| s.viewers == 0).await;
    assert_eq!(status.connected_viewers, 0);

    within(viewer.wait_for(|s| {
        s.state == ConnectionState::Connected && s.camera == Some(CameraKey::from_id(2))
    }))
    .await
    .unwrap();
}

#[tokio::test]
async fn test_camera_switch_over_relay() {
    let (server, url) = start_relay().await;
    let network = LoopbackNetwork::new();

    let stadium = over_relay(&url, &network).await;
    let camera1 = start_camera(&stadium, 1).await;
    let camera2 = start_camera(&stadium, 2).await;
    camera1.go_live().await.unwrap();

    let home = over_relay(&url, &network).await;
    let viewer = start_viewer(&home).await;
    let first_id = connected(&viewer).await;
    camera_status(&camera1, |s| s.connected_viewers == 1).await;
    wait_for_empty_mailbox(server.backend()).await;

    camera1.set_active_camera(2).await.unwrap();
    let snapshot = within(viewer.wait_for(|s| {
        s.state == ConnectionState::Connected && s.camera == Some(CameraKey::from_id(2))
    }))
    .await
    .unwrap();
    assert_ne!(snapshot.viewer_id, Some(first_id));
    assert_eq!(snapshot.attempts, 2);
    camera_status(&camera2, |s| s.connected_viewers == 1).await;
    camera_status(&camera1, |s| s.viewers == 0).await;

    // Both cameras wrote the shared room without undoing each other
    let room = server.backend().get(&fixture()).await.unwrap().unwrap();
    assert!(room.is_live);
    assert_eq!(room.active_camera_id, 2);
    assert_eq!(room.cameras.len(), 2);

    wait_for_empty_mailbox(server.backend()).await;
    let stats = server.backend().stats(&fixture());
    assert_eq!(stats.deleted, stats.published);
    assert_eq!(stats.missed_deletes, 0);

    viewer.shutdown().await.unwrap();
    camera1.shutdown().await.unwrap();
    camera2.shutdown().await.unwrap();
    server.stop();
}

#[tokio::test]
async fn test_fallback_never_requests_a_stream() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    camera.go_live().await.unwrap();
    camera
        .enable_fallback(Some("https://cdn.example/halftime.jpg".to_string()))
        .await
        .unwrap();

    let viewer = harness.viewer().await;
    let snapshot = within(viewer.wait_for_state(ConnectionState::Fallback))
        .await
        .unwrap();
    assert_eq!(
        snapshot.display,
        ViewerDisplay::Fallback {
            image_url: Some("https://cdn.example/halftime.jpg".to_string())
        }
    );

    // Several request delays pass without any negotiation
    sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.backend.stats(&fixture()).published, 0);
    assert_eq!(viewer.state(), ConnectionState::Fallback);
    assert_eq!(harness.open_viewer_peers(), 0);

    camera.disable_fallback().await.unwrap();
    connected(&viewer).await;
}

#[tokio::test]
async fn test_fallback_while_connected_closes_the_stream() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    camera.go_live().await.unwrap();
    let viewer = harness.viewer().await;
    connected(&viewer).await;

    let mut events = viewer.events();
    camera.enable_fallback(None).await.unwrap();

    within(viewer.wait_for_state(ConnectionState::Fallback))
        .await
        .unwrap();
    next_matching(&mut events, |e| matches!(e, ViewerEvent::FallbackShown { .. })).await;
    assert_eq!(harness.open_viewer_peers(), 0);
    camera_status(&camera, |s| s.viewers == 0 && s.using_fallback).await;

    sleep(Duration::from_millis(100)).await;
    while let Ok(Some(event)) = events.try_next() {
        assert!(
            !matches!(event, ViewerEvent::RequestSent { .. }),
            "request sent while in fallback"
        );
    }
}

#[tokio::test]
async fn test_end_of_broadcast_returns_to_idle() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    camera.go_live().await.unwrap();
    let viewer = harness.viewer().await;
    connected(&viewer).await;

    camera.end_broadcast().await.unwrap();

    let snapshot = within(viewer.wait_for_state(ConnectionState::Idle))
        .await
        .unwrap();
    assert_eq!(snapshot.display, ViewerDisplay::Offline);
    assert_eq!(harness.open_viewer_peers(), 0);
    camera_status(&camera, |s| !s.is_live && s.viewers == 0).await;
}

#[tokio::test]
async fn test_room_update_without_target_change_keeps_connection() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    camera.go_live().await.unwrap();
    let viewer = harness.viewer().await;
    let viewer_id = connected(&viewer).await;

    camera.set_active_camera(1).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let snapshot = viewer.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.viewer_id, Some(viewer_id));
    assert_eq!(snapshot.attempts, 1);
}

#[tokio::test]
async fn test_peer_failure_then_retry_uses_new_identity() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    camera.go_live().await.unwrap();
    let viewer = harness.viewer().await;
    let first_id = connected(&viewer).await;

    harness.network.open_peers_to("camera1")[0].fail();

    let snapshot = within(viewer.wait_for_state(ConnectionState::Failed))
        .await
        .unwrap();
    assert!(matches!(snapshot.display, ViewerDisplay::RetryPrompt { .. }));
    assert_eq!(harness.open_viewer_peers(), 0);

    // Room updates that keep the target do not leave Failed
    camera.set_active_camera(1).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(viewer.state(), ConnectionState::Failed);

    let retry_id = viewer.retry().await.unwrap().unwrap();
    assert_ne!(retry_id, first_id);
    assert_eq!(connected(&viewer).await, retry_id);
}

#[tokio::test]
async fn test_negotiation_error_becomes_failed_state() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    camera.go_live().await.unwrap();
    harness.network.fail_next(LoopbackFailure::CreateAnswer);

    let viewer = harness.viewer().await;
    let snapshot = within(viewer.wait_for_state(ConnectionState::Failed))
        .await
        .unwrap();
    assert!(
        matches!(&snapshot.display, ViewerDisplay::RetryPrompt { reason } if reason.contains("injected"))
    );
    assert_eq!(harness.open_viewer_peers(), 0);

    viewer.retry().await.unwrap();
    connected(&viewer).await;
}

#[tokio::test]
async fn test_retry_only_valid_after_failure() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    camera.go_live().await.unwrap();
    let viewer = harness.viewer().await;
    connected(&viewer).await;

    let err = viewer.retry().await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");
    assert_eq!(viewer.snapshot().attempts, 1);
}

#[tokio::test]
async fn test_stale_candidate_is_discarded_and_deleted() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    camera.go_live().await.unwrap();
    let viewer = harness.viewer().await;
    let viewer_id = connected(&viewer).await;
    harness.wait_for_empty_mailbox().await;

    let peer = harness.network.open_peers_to("camera1")[0].clone();
    peer.close();
    let applied = peer.remote_candidates().len();

    harness
        .backend
        .publish(
            &fixture(),
            Signal::ice_candidate(
                "camera1",
                viewer_id.as_str(),
                IceCandidate::new("candidate:9 1 udp 1 10.0.0.9 9 typ host"),
            ),
        )
        .await
        .unwrap();

    harness.wait_for_empty_mailbox().await;
    assert_eq!(peer.remote_candidates().len(), applied);
    assert_eq!(viewer.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_duplicate_viewer_request_is_debounced() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    camera.go_live().await.unwrap();
    let mut events = camera.events();

    let viewer_id = ViewerId::from("viewer-double-tap");
    let request = Signal::viewer_request(&viewer_id, &CameraKey::from_id(1));
    harness
        .backend
        .publish(&fixture(), request.clone())
        .await
        .unwrap();
    harness.backend.publish(&fixture(), request).await.unwrap();

    next_matching(&mut events, |e| matches!(e, BroadcasterEvent::OfferSent { .. })).await;
    let ignored = next_matching(&mut events, |e| {
        matches!(
            e,
            BroadcasterEvent::DuplicateRequestIgnored { .. } | BroadcasterEvent::OfferSent { .. }
        )
    })
    .await;
    assert_eq!(
        ignored,
        BroadcasterEvent::DuplicateRequestIgnored {
            viewer_id: viewer_id.clone()
        }
    );

    let offers = harness
        .backend
        .pending(&fixture())
        .into_iter()
        .filter(|m| m.kind() == MessageKind::Offer && m.to == viewer_id.as_str())
        .count();
    assert_eq!(offers, 1);
    assert_eq!(camera.status().viewers, 1);
    assert_eq!(harness.network.open_peers_to(viewer_id.as_str()).len(), 1);
}

#[tokio::test]
async fn test_throttled_heartbeat_backs_off() {
    // Camera registration and going live use up the window
    let backend = MemoryBackend::with_write_limit(WriteLimit::new(2, Duration::from_secs(60)));
    let harness = Harness::with_backend(backend);
    let camera = harness
        .matchcast
        .broadcaster(fixture(), 1)
        .camera_source(Arc::new(StaticCameraSource::default()))
        .heartbeat(Duration::from_millis(20), Duration::from_millis(80))
        .start()
        .await
        .unwrap();
    let mut events = camera.events();
    camera.go_live().await.unwrap();

    let mut intervals = Vec::new();
    for _ in 0..3 {
        match next_matching(&mut events, |e| e.is_warning()).await {
            BroadcasterEvent::WriteThrottled { next_interval, .. } => intervals.push(next_interval),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(
        intervals,
        vec![
            Duration::from_millis(40),
            Duration::from_millis(80),
            Duration::from_millis(80)
        ]
    );

    let status = camera_status(&camera, |s| s.heartbeat_interval == Duration::from_millis(80)).await;
    assert!(status.is_live);
}

#[tokio::test]
async fn test_heartbeat_refreshes_room() {
    let harness = Harness::new();
    let camera = harness
        .matchcast
        .broadcaster(fixture(), 1)
        .camera_source(Arc::new(StaticCameraSource::default()))
        .heartbeat(Duration::from_millis(20), Duration::from_secs(1))
        .start()
        .await
        .unwrap();
    camera.go_live().await.unwrap();

    let first = harness.backend.get(&fixture()).await.unwrap().unwrap();
    sleep(Duration::from_millis(100)).await;
    let later = harness.backend.get(&fixture()).await.unwrap().unwrap();
    assert!(later.updated_at > first.updated_at);
    assert!(later.is_live);
}

#[tokio::test]
async fn test_capture_denial_reports_user_message() {
    let harness = Harness::new();
    let source = StaticCameraSource::default();
    source.fail_next(CaptureError::PermissionDenied {
        device: "default-camera".to_string(),
    });

    let err = harness
        .matchcast
        .broadcaster(fixture(), 1)
        .camera_source(Arc::new(source))
        .start()
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "MEDIA_ERROR");
    assert!(err.to_string().contains("access was denied"));
    assert!(harness.backend.get(&fixture()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_picture_in_picture_only_while_live() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    let surface = Arc::new(HeadlessSurface::new(true));
    let viewer = harness
        .matchcast
        .viewer(fixture())
        .request_delay(Duration::from_millis(10))
        .surface(surface.clone())
        .start()
        .await
        .unwrap();

    let err = viewer.request_pip().await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");

    camera.go_live().await.unwrap();
    connected(&viewer).await;
    assert!(viewer.snapshot().playback.pip_available);

    viewer.request_pip().await.unwrap();
    viewer.notify_playback(PlaybackEvent::EnteredPip).unwrap();
    within(viewer.wait_for(|s| s.playback.pip_active))
        .await
        .unwrap();

    assert!(viewer.toggle_mute().await.unwrap());
    assert!(surface.calls().muted);

    camera.end_broadcast().await.unwrap();
    let snapshot = within(viewer.wait_for_state(ConnectionState::Idle))
        .await
        .unwrap();
    assert!(!snapshot.playback.pip_active);
    assert!(!snapshot.playback.pip_available);
    assert_eq!(surface.calls().pip_requests, 1);
    assert_eq!(surface.calls().pip_exits, 1);
}

#[tokio::test]
async fn test_many_room_changes_leave_at_most_one_attempt() {
    let harness = Harness::new();
    let camera1 = harness.camera(1).await;
    let camera2 = harness.camera(2).await;
    let viewer = harness.viewer().await;

    camera1.go_live().await.unwrap();
    camera1.set_active_camera(2).await.unwrap();
    camera2.enable_fallback(None).await.unwrap();
    camera2.disable_fallback().await.unwrap();
    camera1.set_active_camera(1).await.unwrap();
    camera1.end_broadcast().await.unwrap();
    camera1.go_live().await.unwrap();

    for _ in 0..20 {
        assert!(harness.open_viewer_peers() <= 1);
        sleep(Duration::from_millis(5)).await;
    }
    let snapshot = within(viewer.wait_for(|s| {
        s.state == ConnectionState::Connected && s.camera == Some(CameraKey::from_id(1))
    }))
    .await
    .unwrap();
    assert!(snapshot.attempts >= 1);
    assert_eq!(harness.open_viewer_peers(), 1);
}

#[tokio::test]
async fn test_shutdown_releases_attempt() {
    let harness = Harness::new();
    let camera = harness.camera(1).await;
    camera.go_live().await.unwrap();
    let viewer = harness.viewer().await;
    connected(&viewer).await;
    assert_eq!(harness.backend.stats(&fixture()).subscribers, 2);

    viewer.shutdown().await.unwrap();
    assert_eq!(harness.open_viewer_peers(), 0);
    assert_eq!(harness.backend.stats(&fixture()).subscribers, 1);

    camera.shutdown().await.unwrap();
    assert_eq!(harness.backend.stats(&fixture()).subscribers, 0);
}
