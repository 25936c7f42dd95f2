//! # matchcast media
//!
//! Seams to the platform media API: acquiring the broadcaster's camera and
//! controlling how the viewer renders the remote stream. Encoding, decoding
//! and rendering stay in the platform engine.

#![warn(clippy::all)]

pub mod capture;
pub mod error;
pub mod playback;

// Re-export main types
pub use capture::{CameraSource, CaptureConstraints, LocalStream, StaticCameraSource};
pub use error::{CaptureError, CaptureResult, ErrorCategory};
pub use playback::{
    HeadlessSurface, PlaybackControls, PlaybackEvent, PlaybackState, PlaybackSurface,
    SurfaceCalls,
};
