//! Signaling protocol messages
//!
//! Two layers live here. [`Signal`] and [`SignalingMessage`] are the
//! mailbox entries peers exchange while negotiating. [`RelayRequest`] and
//! [`RelayResponse`] are the frames a [`RelayClient`](crate::RelayClient)
//! and [`RelayServer`](crate::RelayServer) exchange over WebSocket to give
//! remote peers access to a mailbox and room store.

use chrono::{DateTime, Utc};
use matchcast_core::{
    BroadcastRoom, CameraKey, FixtureId, IceCandidate, RoomPatch, SessionDescription, ViewerId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Channel-assigned id of a published message; ascending ids define
/// delivery order within a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Viewer asks a camera for an offer
    ViewerRequest,
    /// Camera offers a session to a viewer
    Offer,
    /// Viewer answers an offer
    Answer,
    /// Either side shares a network candidate
    IceCandidate,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::ViewerRequest => "viewer-request",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
        };
        f.write_str(name)
    }
}

/// Payload of a viewer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerRequest {
    /// When the viewer asked
    pub requested_at: DateTime<Utc>,
}

/// Typed payload of a signaling message
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    /// `viewer-request`
    ViewerRequest(ViewerRequest),
    /// `offer`
    Offer(SessionDescription),
    /// `answer`
    Answer(SessionDescription),
    /// `ice-candidate`
    IceCandidate(IceCandidate),
}

impl SignalPayload {
    /// Type tag of this payload
    pub fn kind(&self) -> MessageKind {
        match self {
            SignalPayload::ViewerRequest(_) => MessageKind::ViewerRequest,
            SignalPayload::Offer(_) => MessageKind::Offer,
            SignalPayload::Answer(_) => MessageKind::Answer,
            SignalPayload::IceCandidate(_) => MessageKind::IceCandidate,
        }
    }

    fn to_wire(&self) -> (MessageKind, Value) {
        let value = match self {
            SignalPayload::ViewerRequest(request) => serde_json::to_value(request),
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => serde_json::to_value(desc),
            SignalPayload::IceCandidate(candidate) => serde_json::to_value(candidate),
        };
        // Plain data structs always serialize
        (self.kind(), value.unwrap_or(Value::Null))
    }

    fn from_wire(kind: MessageKind, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::ViewerRequest => SignalPayload::ViewerRequest(serde_json::from_value(value)?),
            MessageKind::Offer => SignalPayload::Offer(serde_json::from_value(value)?),
            MessageKind::Answer => SignalPayload::Answer(serde_json::from_value(value)?),
            MessageKind::IceCandidate => SignalPayload::IceCandidate(serde_json::from_value(value)?),
        })
    }
}

/// A signal about to be published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireSignal", into = "WireSignal")]
pub struct Signal {
    /// Sender address (camera key or viewer id)
    pub from: String,
    /// Recipient address
    pub to: String,
    /// Typed payload
    pub payload: SignalPayload,
}

impl Signal {
    /// Viewer asks `camera` for an offer
    pub fn viewer_request(viewer: &ViewerId, camera: &CameraKey) -> Self {
        Self {
            from: viewer.to_string(),
            to: camera.to_string(),
            payload: SignalPayload::ViewerRequest(ViewerRequest {
                requested_at: Utc::now(),
            }),
        }
    }

    /// Camera offers a session to `viewer`
    pub fn offer(camera: &CameraKey, viewer: &str, desc: SessionDescription) -> Self {
        Self {
            from: camera.to_string(),
            to: viewer.to_string(),
            payload: SignalPayload::Offer(desc),
        }
    }

    /// Viewer answers the offer from `to`
    pub fn answer(viewer: &ViewerId, to: &str, desc: SessionDescription) -> Self {
        Self {
            from: viewer.to_string(),
            to: to.to_string(),
            payload: SignalPayload::Answer(desc),
        }
    }

    /// Network candidate from either side
    pub fn ice_candidate(from: &str, to: &str, candidate: IceCandidate) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            payload: SignalPayload::IceCandidate(candidate),
        }
    }

    /// Type tag
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

#[derive(Serialize, Deserialize)]
struct WireSignal {
    #[serde(rename = "type")]
    kind: MessageKind,
    from: String,
    to: String,
    payload: Value,
}

impl From<Signal> for WireSignal {
    fn from(signal: Signal) -> Self {
        let (kind, payload) = signal.payload.to_wire();
        Self {
            kind,
            from: signal.from,
            to: signal.to,
            payload,
        }
    }
}

impl TryFrom<WireSignal> for Signal {
    type Error = serde_json::Error;

    fn try_from(wire: WireSignal) -> Result<Self, Self::Error> {
        Ok(Self {
            from: wire.from,
            to: wire.to,
            payload: SignalPayload::from_wire(wire.kind, wire.payload)?,
        })
    }
}

/// A published mailbox entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct SignalingMessage {
    /// Channel-assigned ordering key
    pub id: MessageId,
    /// Room the message was published to
    pub fixture_id: FixtureId,
    /// Sender address
    pub from: String,
    /// Recipient address
    pub to: String,
    /// Typed payload
    pub payload: SignalPayload,
    /// Channel-assigned publish time
    pub timestamp: DateTime<Utc>,
}

impl SignalingMessage {
    /// Stamp a signal as published
    pub fn published(id: MessageId, fixture_id: FixtureId, signal: Signal) -> Self {
        Self {
            id,
            fixture_id,
            from: signal.from,
            to: signal.to,
            payload: signal.payload,
            timestamp: Utc::now(),
        }
    }

    /// Type tag
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    id: MessageId,
    #[serde(rename = "type")]
    kind: MessageKind,
    from: String,
    to: String,
    fixture_id: FixtureId,
    payload: Value,
    timestamp: DateTime<Utc>,
}

impl From<SignalingMessage> for WireMessage {
    fn from(message: SignalingMessage) -> Self {
        let (kind, payload) = message.payload.to_wire();
        Self {
            id: message.id,
            kind,
            from: message.from,
            to: message.to,
            fixture_id: message.fixture_id,
            payload,
            timestamp: message.timestamp,
        }
    }
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = serde_json::Error;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            id: wire.id,
            fixture_id: wire.fixture_id,
            from: wire.from,
            to: wire.to,
            payload: SignalPayload::from_wire(wire.kind, wire.payload)?,
            timestamp: wire.timestamp,
        })
    }
}

/// Frames sent from a relay client to the relay server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all_fields = "camelCase")]
pub enum RelayRequest {
    /// Append a signal to a room's mailbox
    Publish {
        /// Correlation id
        request_id: u64,
        /// Target room
        fixture_id: FixtureId,
        /// Signal to publish
        signal: Signal,
    },
    /// Receive messages addressed to `recipient`
    Subscribe {
        /// Correlation id
        request_id: u64,
        /// Room to listen on
        fixture_id: FixtureId,
        /// Address to filter on
        recipient: String,
    },
    /// Stop a subscription
    Unsubscribe {
        /// Correlation id
        request_id: u64,
        /// Subscription to stop
        subscription_id: u64,
    },
    /// Remove a consumed message
    Delete {
        /// Correlation id
        request_id: u64,
        /// Room the message lives in
        fixture_id: FixtureId,
        /// Message to remove
        message_id: MessageId,
    },
    /// Drop every pending message of a room
    Clear {
        /// Correlation id
        request_id: u64,
        /// Room to clear
        fixture_id: FixtureId,
    },
    /// Read a room document
    GetRoom {
        /// Correlation id
        request_id: u64,
        /// Room to read
        fixture_id: FixtureId,
    },
    /// Replace a room document
    PutRoom {
        /// Correlation id
        request_id: u64,
        /// New document
        room: BroadcastRoom,
    },
    /// Apply a patch to a room document on the server
    UpdateRoom {
        /// Correlation id
        request_id: u64,
        /// Room to edit
        fixture_id: FixtureId,
        /// Edit to apply
        patch: RoomPatch,
    },
    /// Receive every change of a room document
    WatchRoom {
        /// Correlation id
        request_id: u64,
        /// Room to watch
        fixture_id: FixtureId,
    },
}

impl RelayRequest {
    /// Correlation id of this request
    pub fn request_id(&self) -> u64 {
        match self {
            RelayRequest::Publish { request_id, .. }
            | RelayRequest::Subscribe { request_id, .. }
            | RelayRequest::Unsubscribe { request_id, .. }
            | RelayRequest::Delete { request_id, .. }
            | RelayRequest::Clear { request_id, .. }
            | RelayRequest::GetRoom { request_id, .. }
            | RelayRequest::PutRoom { request_id, .. }
            | RelayRequest::UpdateRoom { request_id, .. }
            | RelayRequest::WatchRoom { request_id, .. } => *request_id,
        }
    }
}

/// Frames sent from the relay server to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all_fields = "camelCase")]
pub enum RelayResponse {
    /// Request succeeded with nothing to report
    Ack {
        /// Correlation id
        request_id: u64,
    },
    /// Signal was published
    Published {
        /// Correlation id
        request_id: u64,
        /// Assigned message id
        message_id: MessageId,
    },
    /// Subscription is active
    Subscribed {
        /// Correlation id
        request_id: u64,
        /// Id to match pushed messages against
        subscription_id: u64,
    },
    /// Delete outcome
    Deleted {
        /// Correlation id
        request_id: u64,
        /// Whether the message was still there
        existed: bool,
    },
    /// Clear outcome
    Cleared {
        /// Correlation id
        request_id: u64,
        /// Number of messages dropped
        removed: usize,
    },
    /// Room document, either as a reply or as a watch push
    Room {
        /// Correlation id for replies, `None` for pushes
        request_id: Option<u64>,
        /// Room the document belongs to
        fixture_id: FixtureId,
        /// Current document
        room: Option<BroadcastRoom>,
    },
    /// Message pushed to a subscription
    Message {
        /// Subscription the message belongs to
        subscription_id: u64,
        /// The message
        message: SignalingMessage,
    },
    /// Error response
    Error {
        /// Correlation id, if the error answers a request
        request_id: Option<u64>,
        /// Error message
        error: String,
        /// Error code for programmatic handling
        error_code: String,
        /// Suggested delay before retrying, for throttled writes
        retry_in_ms: Option<u64>,
    },
}

impl RelayResponse {
    /// Correlation id, if this frame answers a request
    pub fn request_id(&self) -> Option<u64> {
        match self {
            RelayResponse::Ack { request_id }
            | RelayResponse::Published { request_id, .. }
            | RelayResponse::Subscribed { request_id, .. }
            | RelayResponse::Deleted { request_id, .. }
            | RelayResponse::Cleared { request_id, .. } => Some(*request_id),
            RelayResponse::Room { request_id, .. } | RelayResponse::Error { request_id, .. } => {
                *request_id
            }
            RelayResponse::Message { .. } => None,
        }
    }
}
