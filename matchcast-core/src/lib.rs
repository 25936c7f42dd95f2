//! # matchcast core
//!
//! Shared building blocks for matchcast live broadcasts: the broadcast room
//! model, the error type, and the peer-connection seam through which the
//! connection managers drive the platform media engine.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod peer;
pub mod room;

// Re-export main types
pub use error::MatchcastError;
pub use peer::loopback::{LoopbackFailure, LoopbackNetwork, LoopbackPeer};
pub use peer::{
    default_ice_servers, IceCandidate, IceServerConfig, MediaTrack, PeerConfig, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEvents, SdpType,
    SessionDescription, TrackKind,
};
pub use room::{
    BroadcastRoom, BroadcastTarget, CameraKey, CameraStatus, FixtureId, RoomPatch, ViewerId,
};
