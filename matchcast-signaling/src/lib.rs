//! # matchcast signaling
//!
//! The transient mailbox peers use to negotiate, the room document store,
//! and a WebSocket relay that shares both between processes.
//!
//! Every message is addressed to one recipient, delivered in publish order
//! and deleted by its consumer right after handling; the mailbox is not an
//! audit log.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod client;
pub mod memory;
pub mod protocol;
pub mod server;

// Re-export main types
pub use channel::{RoomStore, RoomWatch, SignalingChannel, Subscription};
pub use client::{RelayClient, RelayConfig};
pub use memory::{MailboxStats, MemoryBackend, WriteLimit};
pub use protocol::{
    MessageId, MessageKind, RelayRequest, RelayResponse, Signal, SignalPayload, SignalingMessage,
    ViewerRequest,
};
pub use server::RelayServer;

#[cfg(test)]
mod tests {
    use super::*;
    use matchcast_core::{
        BroadcastRoom, CameraKey, FixtureId, IceCandidate, RoomPatch, SessionDescription,
        ViewerId,
    };

    fn fixture() -> FixtureId {
        FixtureId::new("fx-42")
    }

    #[test]
    fn test_viewer_request_wire_format() {
        let viewer = ViewerId::from("viewer-1");
        let signal = Signal::viewer_request(&viewer, &CameraKey::from_id(1));
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["type"], "viewer-request");
        assert_eq!(json["from"], "viewer-1");
        assert_eq!(json["to"], "camera1");
        assert!(json["payload"]["requestedAt"].is_string());

        let parsed: Signal = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind(), MessageKind::ViewerRequest);
    }

    #[test]
    fn test_published_message_wire_format() {
        let signal = Signal::ice_candidate(
            "camera1",
            "viewer-1",
            IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 5000 typ host"),
        );
        let message = SignalingMessage::published(MessageId(9), fixture(), signal);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["id"], 9);
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["fixtureId"], "fx-42");
        assert_eq!(json["payload"]["sdpMLineIndex"], 0);
        assert!(json["timestamp"].is_string());

        let parsed: SignalingMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_payload_must_match_type() {
        let json = serde_json::json!({
            "type": "offer",
            "from": "camera1",
            "to": "viewer-1",
            "payload": { "candidate": "candidate:1" }
        });
        assert!(serde_json::from_value::<Signal>(json).is_err());
    }

    #[test]
    fn test_relay_request_serialization() {
        let request = RelayRequest::Publish {
            request_id: 3,
            fixture_id: fixture(),
            signal: Signal::offer(
                &CameraKey::from_id(1),
                "viewer-1",
                SessionDescription::offer("v=0"),
            ),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("Publish"));
        assert!(json.contains("fx-42"));

        let parsed: RelayRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id(), 3);
    }

    #[test]
    fn test_relay_response_correlation() {
        let push = RelayResponse::Room {
            request_id: None,
            fixture_id: fixture(),
            room: Some(BroadcastRoom::new(fixture())),
        };
        assert_eq!(push.request_id(), None);

        let error = RelayResponse::Error {
            request_id: Some(11),
            error: "Room not found: fx-42".to_string(),
            error_code: "ROOM_NOT_FOUND".to_string(),
            retry_in_ms: None,
        };
        let json = serde_json::to_string(&error).unwrap();
        let parsed: RelayResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id(), Some(11));
    }

    #[test]
    fn test_relay_frame_fields_are_camel_case() {
        let error = RelayResponse::Error {
            request_id: Some(4),
            error: "Room writes throttled".to_string(),
            error_code: "WRITE_THROTTLED".to_string(),
            retry_in_ms: Some(250),
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["Error"]["requestId"], 4);
        assert_eq!(json["Error"]["errorCode"], "WRITE_THROTTLED");
        assert_eq!(json["Error"]["retryInMs"], 250);

        let update = RelayRequest::UpdateRoom {
            request_id: 5,
            fixture_id: fixture(),
            patch: RoomPatch::SetActiveCamera { camera_id: 2 },
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["UpdateRoom"]["requestId"], 5);
        assert_eq!(json["UpdateRoom"]["fixtureId"], "fx-42");
        assert_eq!(json["UpdateRoom"]["patch"]["op"], "setActiveCamera");
        assert_eq!(json["UpdateRoom"]["patch"]["cameraId"], 2);

        let parsed: RelayRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.request_id(), 5);
    }
}
