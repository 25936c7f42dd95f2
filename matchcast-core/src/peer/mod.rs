//! Peer connection seam
//!
//! The media engine (a browser `RTCPeerConnection`, a native WebRTC stack,
//! or the in-process [`loopback`] used by tests and demos) is reached only
//! through [`PeerConnection`]. Connection managers create one peer per
//! negotiation through a [`PeerConnectionFactory`] and react to the
//! [`PeerEvent`]s it emits.

pub mod loopback;

use crate::error::MatchcastError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer from the broadcaster
    Offer,
    /// Answer from the viewer
    Answer,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network path candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate bound to the first media section
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }
}

/// ICE server used to discover network paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs
    pub urls: Vec<String>,
    /// Username for TURN servers
    pub username: Option<String>,
    /// Credential for TURN servers
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// A public STUN server
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Public reflection servers used when nothing else is configured
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
    ]
}

/// Connection state as reported by the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    /// Created, nothing negotiated
    New,
    /// Descriptions exchanged, paths being checked
    Connecting,
    /// Media is flowing
    Connected,
    /// Temporarily lost; the engine may recover
    Disconnected,
    /// Gave up
    Failed,
    /// Closed locally
    Closed,
}

impl PeerConnectionState {
    /// Whether the peer can no longer carry media
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerConnectionState::Failed | PeerConnectionState::Closed
        )
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Media track handle
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaTrack {
    /// Track id
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
}

impl MediaTrack {
    /// Video track with the given id
    pub fn video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Video,
        }
    }

    /// Audio track with the given id
    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Audio,
        }
    }
}

/// Events emitted by a peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be sent to the remote side
    LocalCandidate(IceCandidate),
    /// A remote media track arrived
    Track(MediaTrack),
    /// The connection state changed
    StateChanged(PeerConnectionState),
}

/// Receiver side of a peer's event feed
pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// Parameters for creating a peer connection
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Servers used for network path discovery
    pub ice_servers: Vec<IceServerConfig>,
    /// Address of the remote side, for logs
    pub remote: String,
}

impl PeerConfig {
    /// Config for talking to `remote`
    pub fn new(ice_servers: Vec<IceServerConfig>, remote: impl Into<String>) -> Self {
        Self {
            ice_servers,
            remote: remote.into(),
        }
    }
}

/// A direct media connection to one remote peer
#[async_trait]
pub trait PeerConnection: Send + Sync + fmt::Debug {
    /// Create an offer describing the local tracks
    async fn create_offer(&self) -> Result<SessionDescription, MatchcastError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, MatchcastError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), MatchcastError>;

    /// Apply the remote side's description
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), MatchcastError>;

    /// Apply a remote network candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MatchcastError>;

    /// Attach a local track to be sent
    fn add_track(&self, track: MediaTrack) -> Result<(), MatchcastError>;

    /// Current connection state
    fn state(&self) -> PeerConnectionState;

    /// Close the connection; idempotent and synchronous
    fn close(&self);

    /// Whether [`close`](Self::close) has been called
    fn is_closed(&self) -> bool {
        self.state() == PeerConnectionState::Closed
    }
}

/// Creates peer connections
pub trait PeerConnectionFactory: Send + Sync + fmt::Debug {
    /// Create a new peer and its event feed
    fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), MatchcastError>;
}
