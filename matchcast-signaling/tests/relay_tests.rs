//! Integration tests for the WebSocket relay
//!
//! A relay server runs on an ephemeral port over a shared in-memory backend;
//! clients talk to it through the same traits the connection managers use.

use std::time::Duration;
use tokio::time::timeout;

use matchcast_core::{
    BroadcastRoom, CameraKey, FixtureId, RoomPatch, SessionDescription, ViewerId,
};
use matchcast_signaling::{
    MemoryBackend, MessageKind, RelayClient, RelayConfig, RelayServer, RoomStore, Signal,
    SignalPayload, SignalingChannel, WriteLimit,
};

async fn start_test_server(backend: MemoryBackend) -> (RelayServer, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(addr, backend);

    let server_clone = server.clone();
    tokio::spawn(async move {
        let _ = server_clone.serve(listener).await;
    });

    (server, format!("ws://{}", addr))
}

async fn connect(url: &str) -> RelayClient {
    timeout(
        Duration::from_secs(5),
        RelayClient::connect(RelayConfig::new(url)),
    )
    .await
    .expect("connect timed out")
    .expect("connect failed")
}

fn fixture() -> FixtureId {
    FixtureId::new("relay-fixture")
}

#[tokio::test]
async fn test_publish_reaches_remote_subscriber() {
    let (_server, url) = start_test_server(MemoryBackend::new()).await;
    let viewer_side = connect(&url).await;
    let camera_side = connect(&url).await;

    let camera = CameraKey::from_id(1);
    let viewer = ViewerId::generate();
    let mut inbox = camera_side
        .subscribe(&fixture(), camera.as_str())
        .await
        .unwrap();

    let id = viewer_side
        .publish(&fixture(), Signal::viewer_request(&viewer, &camera))
        .await
        .unwrap();

    let message = timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("no message")
        .expect("subscription closed");
    assert_eq!(message.id, id);
    assert_eq!(message.kind(), MessageKind::ViewerRequest);
    assert_eq!(message.from, viewer.as_str());

    assert!(camera_side.delete(&fixture(), id).await.unwrap());
    assert!(!camera_side.delete(&fixture(), id).await.unwrap());
}

#[tokio::test]
async fn test_remote_messages_arrive_in_publish_order() {
    let backend = MemoryBackend::new();
    let (_server, url) = start_test_server(backend.clone()).await;
    let client = connect(&url).await;

    let camera = CameraKey::from_id(1);
    let viewer = ViewerId::generate();
    let mut inbox = client.subscribe(&fixture(), viewer.as_str()).await.unwrap();

    for sdp in ["one", "two", "three"] {
        backend
            .publish(
                &fixture(),
                Signal::offer(&camera, viewer.as_str(), SessionDescription::offer(sdp)),
            )
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let message = timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        match message.payload {
            SignalPayload::Offer(desc) => seen.push(desc.sdp),
            other => panic!("Expected offer, got {:?}", other),
        }
    }
    assert_eq!(seen, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_watch_room_receives_updates() {
    let backend = MemoryBackend::new();
    let (_server, url) = start_test_server(backend.clone()).await;
    let client = connect(&url).await;

    let mut watch = client.watch(&fixture()).await.unwrap();
    assert!(watch.borrow().is_none());

    let mut room = BroadcastRoom::new(fixture());
    room.is_live = true;
    backend.put(room).await.unwrap();

    timeout(Duration::from_secs(2), watch.changed())
        .await
        .expect("no room push")
        .unwrap();
    assert!(watch.borrow().as_ref().unwrap().is_live);

    let fetched = client.get(&fixture()).await.unwrap().unwrap();
    assert!(fetched.is_live);
}

#[tokio::test]
async fn test_watch_starts_at_current_document() {
    let backend = MemoryBackend::new();
    let mut room = BroadcastRoom::new(fixture());
    room.is_live = true;
    backend.put(room).await.unwrap();

    let (_server, url) = start_test_server(backend.clone()).await;
    let client = connect(&url).await;

    let mut watch = client.watch(&fixture()).await.unwrap();
    assert!(watch.borrow().as_ref().unwrap().is_live);
    client.get(&fixture()).await.unwrap();
    assert!(timeout(Duration::from_millis(100), watch.changed())
        .await
        .is_err());

    client
        .update(&fixture(), RoomPatch::SetActiveCamera { camera_id: 2 })
        .await
        .unwrap();
    timeout(Duration::from_secs(2), watch.changed())
        .await
        .expect("no room push")
        .unwrap();
    assert_eq!(watch.borrow().as_ref().unwrap().active_camera_id, 2);
}

#[tokio::test]
async fn test_watch_closes_when_relay_goes_away() {
    let (server, url) = start_test_server(MemoryBackend::new()).await;
    let client = connect(&url).await;
    let mut watch = client.watch(&fixture()).await.unwrap();

    server.stop();
    let closed = timeout(Duration::from_secs(2), watch.changed())
        .await
        .expect("watch stayed open after the relay went away");
    assert!(closed.is_err());
}

#[tokio::test]
async fn test_concurrent_remote_writers_keep_each_others_edits() {
    let backend = MemoryBackend::new();
    let (_server, url) = start_test_server(backend.clone()).await;

    let mut writers = Vec::new();
    for id in 1..=20u8 {
        let client = connect(&url).await;
        writers.push(tokio::spawn(async move {
            client
                .update(
                    &fixture(),
                    RoomPatch::RegisterCamera {
                        camera: CameraKey::from_id(id),
                    },
                )
                .await
                .unwrap();
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let room = backend.get(&fixture()).await.unwrap().unwrap();
    assert_eq!(room.cameras.len(), 20);
}

#[tokio::test]
async fn test_remote_update_and_throttling() {
    let backend = MemoryBackend::with_write_limit(WriteLimit::new(1, Duration::from_secs(60)));
    let (_server, url) = start_test_server(backend.clone()).await;
    let client = connect(&url).await;

    let room = client
        .update(&fixture(), RoomPatch::SetActiveCamera { camera_id: 2 })
        .await
        .unwrap();
    assert_eq!(room.active_camera_id, 2);

    let err = client
        .update(&fixture(), RoomPatch::SetActiveCamera { camera_id: 3 })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "WRITE_THROTTLED");
    assert_eq!(
        backend.get(&fixture()).await.unwrap().unwrap().active_camera_id,
        2
    );
}

#[tokio::test]
async fn test_cancelled_remote_subscription_is_released() {
    let backend = MemoryBackend::new();
    let (_server, url) = start_test_server(backend.clone()).await;
    let client = connect(&url).await;

    let mut inbox = client.subscribe(&fixture(), "camera1").await.unwrap();
    assert_eq!(backend.stats(&fixture()).subscribers, 1);

    inbox.cancel();
    let released = timeout(Duration::from_secs(2), async {
        while backend.stats(&fixture()).subscribers > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "server kept the subscription alive");
}

#[tokio::test]
async fn test_clear_drops_pending_messages() {
    let backend = MemoryBackend::new();
    let (_server, url) = start_test_server(backend.clone()).await;
    let client = connect(&url).await;

    let camera = CameraKey::from_id(1);
    for _ in 0..3 {
        client
            .publish(
                &fixture(),
                Signal::viewer_request(&ViewerId::generate(), &camera),
            )
            .await
            .unwrap();
    }
    assert_eq!(client.clear(&fixture()).await.unwrap(), 3);
    assert!(backend.pending(&fixture()).is_empty());
}
