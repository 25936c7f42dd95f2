//! Local camera acquisition
//!
//! The broadcaster asks a [`CameraSource`] for a [`LocalStream`] once, when
//! it starts, and attaches the stream's tracks to every viewer connection.

use crate::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use matchcast_core::{MediaTrack, TrackKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What to ask the platform for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Capture video
    pub video: bool,
    /// Capture audio
    pub audio: bool,
    /// Specific device to open, or the platform default
    pub device_id: Option<String>,
    /// Preferred frame width
    pub width: Option<u32>,
    /// Preferred frame height
    pub height: Option<u32>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            device_id: None,
            width: None,
            height: None,
        }
    }
}

impl CaptureConstraints {
    /// Open a specific device
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Prefer a resolution
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Video only
    pub fn video_only(mut self) -> Self {
        self.audio = false;
        self
    }
}

/// Tracks acquired from a local device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    /// Stream identifier
    pub id: String,
    /// Device the tracks came from
    pub device: String,
    /// Acquired tracks, video first
    pub tracks: Vec<MediaTrack>,
}

impl LocalStream {
    /// Tracks of one kind
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    /// Whether the stream carries video
    pub fn has_video(&self) -> bool {
        self.tracks_of(TrackKind::Video).next().is_some()
    }
}

/// Platform camera and microphone access
#[async_trait]
pub trait CameraSource: Send + Sync + Debug {
    /// Acquire local media matching `constraints`
    async fn acquire(&self, constraints: &CaptureConstraints) -> CaptureResult<LocalStream>;

    /// Devices that can be opened
    fn devices(&self) -> Vec<String>;
}

/// Camera source backed by a fixed device list
///
/// Hands out synthetic tracks, so it stands in for real hardware in headless
/// broadcasters and tests. A denial can be queued to exercise error paths.
#[derive(Debug)]
pub struct StaticCameraSource {
    devices: Vec<String>,
    busy: Mutex<Vec<String>>,
    next_failure: Mutex<Option<CaptureError>>,
}

impl Default for StaticCameraSource {
    fn default() -> Self {
        Self::new(vec!["default-camera".to_string()])
    }
}

impl StaticCameraSource {
    /// Create a source exposing `devices`; the first one is the default
    pub fn new(devices: Vec<String>) -> Self {
        Self {
            devices,
            busy: Mutex::new(Vec::new()),
            next_failure: Mutex::new(None),
        }
    }

    /// Fail the next acquisition with `error`
    pub fn fail_next(&self, error: CaptureError) {
        *self.next_failure.lock() = Some(error);
    }

    /// Mark a device as held by another application
    pub fn set_busy(&self, device: impl Into<String>) {
        self.busy.lock().push(device.into());
    }
}

#[async_trait]
impl CameraSource for StaticCameraSource {
    async fn acquire(&self, constraints: &CaptureConstraints) -> CaptureResult<LocalStream> {
        if let Some(error) = self.next_failure.lock().take() {
            warn!("Camera acquisition failed: {}", error);
            return Err(error);
        }
        if !constraints.video && !constraints.audio {
            return Err(CaptureError::Constraints {
                constraint: "at least one of audio or video".to_string(),
            });
        }

        let device = match &constraints.device_id {
            Some(id) if self.devices.contains(id) => id.clone(),
            Some(id) => {
                return Err(CaptureError::DeviceNotFound { device: id.clone() });
            }
            None => self
                .devices
                .first()
                .cloned()
                .ok_or_else(|| CaptureError::DeviceNotFound {
                    device: "default".to_string(),
                })?,
        };
        if self.busy.lock().contains(&device) {
            return Err(CaptureError::DeviceBusy { device });
        }

        let id = Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(MediaTrack::video(format!("{}-video", id)));
        }
        if constraints.audio {
            tracks.push(MediaTrack::audio(format!("{}-audio", id)));
        }
        debug!("Acquired {} tracks from {}", tracks.len(), device);
        info!("📹 Local stream {} ready on {}", id, device);

        Ok(LocalStream { id, device, tracks })
    }

    fn devices(&self) -> Vec<String> {
        self.devices.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_default_device() {
        let source = StaticCameraSource::default();
        let stream = source
            .acquire(&CaptureConstraints::default())
            .await
            .unwrap();

        assert_eq!(stream.device, "default-camera");
        assert_eq!(stream.tracks.len(), 2);
        assert_eq!(stream.tracks[0].kind, TrackKind::Video);
        assert!(stream.has_video());
    }

    #[tokio::test]
    async fn test_video_only() {
        let source = StaticCameraSource::default();
        let stream = source
            .acquire(&CaptureConstraints::default().video_only())
            .await
            .unwrap();
        assert_eq!(stream.tracks_of(TrackKind::Audio).count(), 0);
        assert_eq!(stream.tracks.len(), 1);
    }

    #[tokio::test]
    async fn test_queued_failure_fires_once() {
        let source = StaticCameraSource::default();
        source.fail_next(CaptureError::PermissionDenied {
            device: "default-camera".to_string(),
        });

        let err = source
            .acquire(&CaptureConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CAPTURE_PERMISSION_DENIED");
        assert!(source.acquire(&CaptureConstraints::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_constraints_rejected() {
        let source = StaticCameraSource::default();
        let constraints = CaptureConstraints {
            video: false,
            audio: false,
            ..Default::default()
        };
        let err = source.acquire(&constraints).await.unwrap_err();
        assert!(matches!(err, CaptureError::Constraints { .. }));
    }
}
