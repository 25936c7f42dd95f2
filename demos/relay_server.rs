//! Relay server demo
//!
//! Starts a WebSocket relay, then connects a broadcaster and a viewer to it
//! through separate relay clients, as two browser tabs would.
//!
//! ```text
//! cargo run --example relay_server -- 127.0.0.1:9030
//! ```

use matchcast::{
    init_logging, ConnectionState, GlobalConfig, LoopbackNetwork, Matchcast, MemoryBackend,
    RelayClient, RelayConfig, RelayServer, StaticCameraSource,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(&GlobalConfig::default())?;

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9030".to_string())
        .parse()?;
    let listener = TcpListener::bind(addr).await?;
    let server = RelayServer::new(addr, MemoryBackend::new());
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    info!("🚀 Relay listening on ws://{}", addr);

    // Both sides live in this process, so they share one loopback network
    let network = LoopbackNetwork::new();
    let url = format!("ws://{}", addr);

    let studio = Matchcast::builder()
        .relay(RelayClient::connect(RelayConfig::new(url.clone())).await?)
        .peers(network.clone())
        .build()?;
    let camera = studio
        .broadcaster("cup-semifinal", 1)
        .camera_source(Arc::new(StaticCameraSource::default()))
        .start()
        .await?;
    camera.go_live().await?;

    let fan = Matchcast::builder()
        .relay(RelayClient::connect(RelayConfig::new(url)).await?)
        .peers(network)
        .build()?;
    let viewer = fan.viewer("cup-semifinal").start().await?;

    let snapshot = timeout(
        Duration::from_secs(10),
        viewer.wait_for_state(ConnectionState::Connected),
    )
    .await??;
    info!("✅ Viewer {:?} connected over the relay", snapshot.viewer_id);
    info!(
        "📊 Relay has {} connections, {} pending messages",
        server.connection_count(),
        server.backend().stats(&"cup-semifinal".into()).pending
    );

    info!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    viewer.shutdown().await?;
    camera.shutdown().await?;
    server.stop();
    Ok(())
}
