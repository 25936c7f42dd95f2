//! Broadcast room model
//!
//! A [`BroadcastRoom`] is the single shared document describing one fixture's
//! streaming status. The broadcaster writes it, viewers watch it. Viewers
//! reduce it to a [`BroadcastTarget`], which is all the connection logic
//! needs to decide what to render.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of a fixture (match or event); keys both the room document
/// and its signaling mailbox
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixtureId(String);

impl FixtureId {
    /// Wrap a fixture id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FixtureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FixtureId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for FixtureId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Key of one camera inside a room, `camera{n}` for camera id `n`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraKey(String);

impl CameraKey {
    /// Key for a numeric camera id
    pub fn from_id(id: u8) -> Self {
        Self(format!("camera{}", id))
    }

    /// Numeric id encoded in the key, if it follows the `camera{n}` form
    pub fn id(&self) -> Option<u8> {
        self.0.strip_prefix("camera")?.parse().ok()
    }

    /// Borrow the raw key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CameraKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ephemeral identity of one viewer connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewerId(String);

impl ViewerId {
    /// Generate a fresh random viewer id
    pub fn generate() -> Self {
        Self(format!("viewer-{}", Uuid::new_v4()))
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ViewerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Per-camera status inside a room
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraStatus {
    /// Whether viewers should be shown a still image instead of live video
    pub is_using_fallback: bool,
    /// Still image to show while in fallback
    pub fallback_image_url: Option<String>,
}

impl CameraStatus {
    /// Status of a camera streaming live video
    pub fn live() -> Self {
        Self::default()
    }

    /// Status of a camera showing a fallback still image
    pub fn fallback(image_url: Option<String>) -> Self {
        Self {
            is_using_fallback: true,
            fallback_image_url: image_url,
        }
    }
}

/// Shared state record for one fixture's broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRoom {
    /// Fixture this room belongs to
    pub fixture_id: FixtureId,
    /// Whether the broadcast is live
    pub is_live: bool,
    /// Camera viewers should connect to
    pub active_camera_id: u8,
    /// Known cameras and their status
    #[serde(default)]
    pub cameras: BTreeMap<CameraKey, CameraStatus>,
    /// Last broadcaster write, doubles as heartbeat
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl BroadcastRoom {
    /// Create a room that is not live yet, with camera 1 active
    pub fn new(fixture_id: FixtureId) -> Self {
        Self {
            fixture_id,
            is_live: false,
            active_camera_id: 1,
            cameras: BTreeMap::new(),
            updated_at: None,
        }
    }

    /// Key of the active camera
    pub fn active_camera_key(&self) -> CameraKey {
        CameraKey::from_id(self.active_camera_id)
    }

    /// Status of a camera; a camera without an entry is treated as live
    pub fn camera_status(&self, key: &CameraKey) -> CameraStatus {
        self.cameras.get(key).cloned().unwrap_or_default()
    }

    /// Add a camera entry if it is not there yet
    pub fn register_camera(&mut self, key: CameraKey) {
        self.cameras.entry(key).or_default();
    }

    /// Mark a camera as showing the given fallback image
    pub fn set_fallback(&mut self, key: CameraKey, image_url: Option<String>) {
        self.cameras.insert(key, CameraStatus::fallback(image_url));
    }

    /// Return a camera to live video
    pub fn clear_fallback(&mut self, key: CameraKey) {
        self.cameras.insert(key, CameraStatus::live());
    }

    /// Stamp the room with the current time
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    /// What a viewer should be showing for this room
    pub fn target(&self) -> BroadcastTarget {
        if !self.is_live {
            return BroadcastTarget::Offline;
        }
        let camera = self.active_camera_key();
        let status = self.camera_status(&camera);
        if status.is_using_fallback {
            BroadcastTarget::Fallback {
                camera,
                image_url: status.fallback_image_url,
            }
        } else {
            BroadcastTarget::Live { camera }
        }
    }
}

/// Field-level edit of a room document
///
/// Patches touch only the fields they name, so writers that share a room
/// never undo each other's changes. Stores apply them atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RoomPatch {
    /// Add a camera entry if it is missing
    RegisterCamera {
        /// Camera to register
        camera: CameraKey,
    },
    /// Start or end the broadcast from `camera`
    SetLive {
        /// New live flag
        is_live: bool,
        /// Camera making the change; registered as a side effect
        camera: CameraKey,
    },
    /// Point viewers at another camera
    SetActiveCamera {
        /// Numeric id of the new active camera
        camera_id: u8,
    },
    /// Show a still image instead of `camera`'s video
    SetFallback {
        /// Camera switching to fallback
        camera: CameraKey,
        /// Image to show
        image_url: Option<String>,
    },
    /// Return `camera` to live video
    ClearFallback {
        /// Camera leaving fallback
        camera: CameraKey,
    },
    /// Only refresh `updatedAt`
    Touch,
}

impl RoomPatch {
    /// Apply the edit; stamping `updatedAt` is left to the store
    pub fn apply(self, room: &mut BroadcastRoom) {
        match self {
            RoomPatch::RegisterCamera { camera } => room.register_camera(camera),
            RoomPatch::SetLive { is_live, camera } => {
                room.is_live = is_live;
                room.register_camera(camera);
            }
            RoomPatch::SetActiveCamera { camera_id } => {
                room.active_camera_id = camera_id;
                room.register_camera(CameraKey::from_id(camera_id));
            }
            RoomPatch::SetFallback { camera, image_url } => room.set_fallback(camera, image_url),
            RoomPatch::ClearFallback { camera } => room.clear_fallback(camera),
            RoomPatch::Touch => {}
        }
    }
}

/// What a viewer should render, derived from room state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastTarget {
    /// No room, or the room is not live
    Offline,
    /// The active camera is showing a still image
    Fallback {
        /// Active camera
        camera: CameraKey,
        /// Image to render, if the broadcaster provided one
        image_url: Option<String>,
    },
    /// The active camera is streaming live video
    Live {
        /// Active camera
        camera: CameraKey,
    },
}

impl BroadcastTarget {
    /// Target for an optional room document
    pub fn of(room: Option<&BroadcastRoom>) -> Self {
        room.map(BroadcastRoom::target)
            .unwrap_or(BroadcastTarget::Offline)
    }

    /// Camera a live connection should be made to
    pub fn live_camera(&self) -> Option<&CameraKey> {
        match self {
            BroadcastTarget::Live { camera } => Some(camera),
            _ => None,
        }
    }
}
