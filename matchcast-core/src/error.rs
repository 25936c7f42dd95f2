//! Error types for matchcast

use std::time::Duration;
use thiserror::Error;

/// Main error type for matchcast operations
#[derive(Error, Debug)]
pub enum MatchcastError {
    /// Initialization error
    #[error("Initialization failed: {reason}")]
    Initialization {
        /// Reason for initialization failure
        reason: String,
    },

    /// Missing configuration error
    #[error("Missing required configuration: {field}")]
    MissingConfiguration {
        /// Missing configuration field
        field: String,
    },

    /// Invalid state error
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Offer/answer negotiation failed
    #[error("Negotiation failed with {peer}: {reason}")]
    Negotiation {
        /// Remote peer address (camera key or viewer id)
        peer: String,
        /// Reason for negotiation failure
        reason: String,
    },

    /// Operation attempted on a peer connection that is already closed
    #[error("Peer connection {peer} is closed")]
    PeerConnectionClosed {
        /// Remote peer address
        peer: String,
    },

    /// Signaling channel failure
    #[error("Signaling error in fixture {fixture_id}: {reason}")]
    Signaling {
        /// Fixture the channel belongs to
        fixture_id: String,
        /// Reason for the failure
        reason: String,
    },

    /// Backend rejected a write because of its rate limit
    #[error("Write throttled for fixture {fixture_id}, retry in {retry_in:?}")]
    WriteThrottled {
        /// Fixture whose writes are throttled
        fixture_id: String,
        /// Suggested delay before the next write
        retry_in: Duration,
    },

    /// Room not found
    #[error("Room not found: {fixture_id}")]
    RoomNotFound {
        /// Fixture id that was not found
        fixture_id: String,
    },

    /// Invalid message format
    #[error("Invalid message format: {message}, error: {source}")]
    InvalidMessage {
        /// Invalid message content
        message: String,
        /// Parsing error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization failed
    #[error("Serialization failed: {source}")]
    Serialization {
        /// Underlying serde error
        #[from]
        source: serde_json::Error,
    },

    /// A channel or subscription was closed underneath us
    #[error("Channel closed: {channel}")]
    ChannelClosed {
        /// Name of the channel
        channel: String,
    },

    /// Server start failed
    #[error("Failed to start server on {address}: {source}")]
    ServerStartFailed {
        /// Address that failed to bind
        address: std::net::SocketAddr,
        /// Underlying error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Transport error
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for transport error
        reason: String,
    },

    /// Local media could not be used
    #[error("Media error: {reason}")]
    Media {
        /// Reason for media error
        reason: String,
    },

    /// Operation timed out error
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Duration after which timeout occurred
        duration: Duration,
    },
}

impl MatchcastError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            MatchcastError::Initialization { .. } => "INITIALIZATION_FAILED".to_string(),
            MatchcastError::MissingConfiguration { .. } => "MISSING_CONFIGURATION".to_string(),
            MatchcastError::InvalidState { .. } => "INVALID_STATE".to_string(),
            MatchcastError::Negotiation { .. } => "NEGOTIATION_FAILED".to_string(),
            MatchcastError::PeerConnectionClosed { .. } => "PEER_CONNECTION_CLOSED".to_string(),
            MatchcastError::Signaling { .. } => "SIGNALING_ERROR".to_string(),
            MatchcastError::WriteThrottled { .. } => "WRITE_THROTTLED".to_string(),
            MatchcastError::RoomNotFound { .. } => "ROOM_NOT_FOUND".to_string(),
            MatchcastError::InvalidMessage { .. } => "INVALID_MESSAGE".to_string(),
            MatchcastError::Serialization { .. } => "SERIALIZATION_FAILED".to_string(),
            MatchcastError::ChannelClosed { .. } => "CHANNEL_CLOSED".to_string(),
            MatchcastError::ServerStartFailed { .. } => "SERVER_START_FAILED".to_string(),
            MatchcastError::Transport { .. } => "TRANSPORT_ERROR".to_string(),
            MatchcastError::Media { .. } => "MEDIA_ERROR".to_string(),
            MatchcastError::Timeout { .. } => "TIMEOUT".to_string(),
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MatchcastError::Negotiation { .. }
                | MatchcastError::PeerConnectionClosed { .. }
                | MatchcastError::WriteThrottled { .. }
                | MatchcastError::Transport { .. }
                | MatchcastError::Timeout { .. }
                | MatchcastError::ChannelClosed { .. }
        )
    }

    /// Shorthand for a negotiation failure
    pub fn negotiation(peer: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        MatchcastError::Negotiation {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a signaling failure
    pub fn signaling(fixture_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        MatchcastError::Signaling {
            fixture_id: fixture_id.into(),
            reason: reason.to_string(),
        }
    }
}
