//! # matchcast - Live match broadcasts over peer-to-peer video
//!
//! A broadcaster streams a camera straight to each viewer. The two sides
//! find each other through a shared mailbox and a room document that says
//! whether the match is live, which camera is active and whether a camera
//! currently shows a still image instead of video.
//!
//! ## Key Features
//!
//! - **Explicit viewer state machine**: idle, fallback, connecting,
//!   negotiating, connected and failed, with manual retry
//! - **Multi-camera**: switching the active camera reconnects every viewer
//! - **Fallback image**: viewers render a still image and skip negotiation
//! - **Pluggable backends**: in-process mailbox or WebSocket relay
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use matchcast::{LoopbackNetwork, Matchcast, MemoryBackend, StaticCameraSource};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), matchcast::MatchcastError> {
//!     let matchcast = Matchcast::builder()
//!         .backend(MemoryBackend::new())
//!         .peers(LoopbackNetwork::new())
//!         .build()?;
//!
//!     let camera = matchcast
//!         .broadcaster("fixture-42", 1)
//!         .camera_source(Arc::new(StaticCameraSource::default()))
//!         .start()
//!         .await?;
//!     camera.go_live().await?;
//!
//!     let viewer = matchcast.viewer("fixture-42").start().await?;
//!     let mut events = viewer.events();
//!     while let Some(event) = events.next().await {
//!         println!("Viewer event: {:?}", event);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use matchcast_core::{
    BroadcastRoom, BroadcastTarget, CameraKey, CameraStatus, FixtureId, IceCandidate,
    IceServerConfig, LoopbackFailure, LoopbackNetwork, LoopbackPeer, MatchcastError, MediaTrack,
    PeerConnection, PeerConnectionFactory, PeerConnectionState, SessionDescription, TrackKind,
    ViewerId,
};
pub use matchcast_media::{
    CameraSource, CaptureConstraints, CaptureError, HeadlessSurface, LocalStream,
    PlaybackEvent, PlaybackState, PlaybackSurface, StaticCameraSource,
};
pub use matchcast_signaling::{
    MailboxStats, MemoryBackend, MessageKind, RelayClient, RelayConfig, RelayServer, RoomStore,
    Signal, SignalingChannel, SignalingMessage, WriteLimit,
};

// Public API modules
pub mod broadcaster;
pub mod config;
pub mod event;
pub mod logging;
pub mod viewer;

// Re-export main API types
pub use broadcaster::{BroadcasterBuilder, BroadcasterConnectionManager, BroadcasterStatus};
pub use config::{BroadcasterConfig, GlobalConfig, ViewerConfig};
pub use event::{BroadcasterEvent, EventStream, ViewerEvent};
pub use logging::init_logging;
pub use viewer::{
    ConnectionState, ViewerBuilder, ViewerConnectionManager, ViewerDisplay, ViewerSnapshot,
};

use std::sync::Arc;

/// Main entry point for matchcast
#[derive(Debug, Clone)]
pub struct Matchcast {
    inner: Arc<MatchcastInner>,
}

#[derive(Debug)]
struct MatchcastInner {
    config: GlobalConfig,
    channel: Arc<dyn SignalingChannel>,
    store: Arc<dyn RoomStore>,
    peers: Arc<dyn PeerConnectionFactory>,
}

impl Matchcast {
    /// Start configuring an instance
    ///
    /// # Example
    /// ```rust,no_run
    /// use matchcast::{LoopbackNetwork, Matchcast, MemoryBackend};
    ///
    /// let matchcast = Matchcast::builder()
    ///     .backend(MemoryBackend::new())
    ///     .peers(LoopbackNetwork::new())
    ///     .build()?;
    /// # Ok::<(), matchcast::MatchcastError>(())
    /// ```
    pub fn builder() -> MatchcastBuilder {
        MatchcastBuilder::default()
    }

    /// Global configuration
    pub fn config(&self) -> &GlobalConfig {
        &self.inner.config
    }

    /// Create a viewer builder for the given fixture
    pub fn viewer(&self, fixture_id: impl Into<FixtureId>) -> ViewerBuilder {
        ViewerBuilder::new(self, fixture_id.into())
    }

    /// Create a broadcaster builder for camera `camera_id` of the given fixture
    pub fn broadcaster(&self, fixture_id: impl Into<FixtureId>, camera_id: u8) -> BroadcasterBuilder {
        BroadcasterBuilder::new(self, fixture_id.into(), camera_id)
    }

    pub(crate) fn channel(&self) -> Arc<dyn SignalingChannel> {
        self.inner.channel.clone()
    }

    pub(crate) fn store(&self) -> Arc<dyn RoomStore> {
        self.inner.store.clone()
    }

    pub(crate) fn peers(&self) -> Arc<dyn PeerConnectionFactory> {
        self.inner.peers.clone()
    }
}

/// Fluent builder for [`Matchcast`]
#[derive(Debug, Default)]
pub struct MatchcastBuilder {
    config: GlobalConfig,
    channel: Option<Arc<dyn SignalingChannel>>,
    store: Option<Arc<dyn RoomStore>>,
    peers: Option<Arc<dyn PeerConnectionFactory>>,
}

impl MatchcastBuilder {
    /// Set global configuration
    pub fn config(mut self, config: GlobalConfig) -> Self {
        self.config = config;
        self
    }

    /// Use one in-process backend as both mailbox and room store
    pub fn backend(self, backend: MemoryBackend) -> Self {
        let backend = Arc::new(backend);
        self.channel(backend.clone()).store(backend)
    }

    /// Use a connected relay as both mailbox and room store
    pub fn relay(self, client: RelayClient) -> Self {
        let client = Arc::new(client);
        self.channel(client.clone()).store(client)
    }

    /// Set the signaling mailbox
    pub fn channel(mut self, channel: Arc<dyn SignalingChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Set the room document store
    pub fn store(mut self, store: Arc<dyn RoomStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the peer connection engine
    pub fn peers(mut self, peers: impl PeerConnectionFactory + 'static) -> Self {
        self.peers = Some(Arc::new(peers));
        self
    }

    /// Finish configuration
    pub fn build(self) -> Result<Matchcast, MatchcastError> {
        let channel = self
            .channel
            .ok_or_else(|| MatchcastError::MissingConfiguration {
                field: "channel".to_string(),
            })?;
        let store = self
            .store
            .ok_or_else(|| MatchcastError::MissingConfiguration {
                field: "store".to_string(),
            })?;
        let peers = self
            .peers
            .ok_or_else(|| MatchcastError::MissingConfiguration {
                field: "peers".to_string(),
            })?;

        if self.config.debug_logging {
            if let Err(e) = logging::init_logging(&self.config) {
                tracing::debug!("Keeping existing subscriber: {}", e);
            }
        }

        Ok(Matchcast {
            inner: Arc::new(MatchcastInner {
                config: self.config,
                channel,
                store,
                peers,
            }),
        })
    }
}
