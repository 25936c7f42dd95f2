//! Loopback broadcast demo
//!
//! Runs two cameras and one viewer in a single process: the viewer connects,
//! follows a camera switch, shows a fallback image and goes idle when the
//! broadcast ends.

use matchcast::{
    init_logging, CameraKey, ConnectionState, GlobalConfig, LoopbackNetwork, Matchcast, MemoryBackend,
    StaticCameraSource, ViewerConnectionManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

async fn wait_for(
    viewer: &ViewerConnectionManager,
    state: ConnectionState,
    camera: Option<u8>,
) -> anyhow::Result<()> {
    let wanted = camera.map(CameraKey::from_id);
    let reached =
        viewer.wait_for(|s| s.state == state && (wanted.is_none() || s.camera == wanted));
    let snapshot = timeout(Duration::from_secs(5), reached).await??;
    info!(
        "👀 Viewer is {:?} (camera {:?}, viewer id {:?})",
        snapshot.state, snapshot.camera, snapshot.viewer_id
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GlobalConfig {
        log_filter: "info,matchcast=debug".to_string(),
        ..GlobalConfig::default()
    };
    init_logging(&config)?;

    info!("🚀 matchcast loopback broadcast demo");

    let matchcast = Matchcast::builder()
        .config(config)
        .backend(MemoryBackend::new())
        .peers(LoopbackNetwork::new())
        .build()?;

    let camera1 = matchcast
        .broadcaster("derby-final", 1)
        .camera_source(Arc::new(StaticCameraSource::default()))
        .start()
        .await?;
    let camera2 = matchcast
        .broadcaster("derby-final", 2)
        .camera_source(Arc::new(StaticCameraSource::new(vec![
            "touchline-camera".to_string()
        ])))
        .start()
        .await?;

    let viewer = matchcast
        .viewer("derby-final")
        .request_delay(Duration::from_millis(50))
        .start()
        .await?;
    let mut events = viewer.events();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            info!("📨 {}: {:?}", event.event_type(), event);
        }
    });

    info!("📝 1. Going live on camera1");
    camera1.go_live().await?;
    wait_for(&viewer, ConnectionState::Connected, Some(1)).await?;

    info!("📝 2. Switching to camera2");
    camera1.set_active_camera(2).await?;
    wait_for(&viewer, ConnectionState::Connected, Some(2)).await?;

    info!("📝 3. camera2 shows a still image");
    camera2
        .enable_fallback(Some("https://cdn.example.org/halftime.jpg".to_string()))
        .await?;
    wait_for(&viewer, ConnectionState::Fallback, Some(2)).await?;

    info!("📝 4. Ending the broadcast");
    camera1.end_broadcast().await?;
    wait_for(&viewer, ConnectionState::Idle, None).await?;

    viewer.shutdown().await?;
    camera1.shutdown().await?;
    camera2.shutdown().await?;
    info!("✅ Demo finished");
    Ok(())
}
