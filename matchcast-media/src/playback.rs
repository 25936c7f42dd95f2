//! Viewer playback controls
//!
//! [`PlaybackControls`] sits between the viewer and whatever element renders
//! the remote stream. Muting only affects local audio output and is never
//! signaled to the broadcaster.

use matchcast_core::MatchcastError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Element rendering the remote stream
pub trait PlaybackSurface: Send + Sync + Debug {
    /// Mute or unmute local audio output
    fn set_muted(&self, muted: bool);

    /// Ask the platform to show the surface fullscreen
    fn request_fullscreen(&self) -> Result<(), MatchcastError>;

    /// Whether picture-in-picture is available at all
    fn supports_pip(&self) -> bool;

    /// Ask the platform to enter picture-in-picture
    fn request_pip(&self) -> Result<(), MatchcastError>;

    /// Ask the platform to leave picture-in-picture
    fn exit_pip(&self);
}

/// Notifications coming back from the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackEvent {
    /// The surface entered picture-in-picture
    EnteredPip,
    /// The surface left picture-in-picture
    LeftPip,
    /// Fullscreen was entered or left
    FullscreenChanged(bool),
}

/// Observable playback state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackState {
    /// Local audio is muted
    pub muted: bool,
    /// The surface is in picture-in-picture
    pub pip_active: bool,
    /// The surface is fullscreen
    pub fullscreen: bool,
    /// Picture-in-picture can be requested right now
    pub pip_available: bool,
}

/// Mute, fullscreen and picture-in-picture over a [`PlaybackSurface`]
#[derive(Debug)]
pub struct PlaybackControls {
    surface: Arc<dyn PlaybackSurface>,
    state: PlaybackState,
    live: bool,
}

impl PlaybackControls {
    /// Wrap a surface; starts unmuted and not live
    pub fn new(surface: Arc<dyn PlaybackSurface>) -> Self {
        Self {
            surface,
            state: PlaybackState::default(),
            live: false,
        }
    }

    /// Current state
    pub fn state(&self) -> PlaybackState {
        PlaybackState {
            pip_available: self.pip_available(),
            ..self.state
        }
    }

    /// Flip local mute and return the new value
    pub fn toggle_mute(&mut self) -> bool {
        self.set_muted(!self.state.muted);
        self.state.muted
    }

    /// Set local mute
    pub fn set_muted(&mut self, muted: bool) {
        self.state.muted = muted;
        self.surface.set_muted(muted);
    }

    /// Request fullscreen from the surface
    pub fn request_fullscreen(&self) -> Result<(), MatchcastError> {
        self.surface.request_fullscreen()
    }

    /// Picture-in-picture is offered only for a rendering live stream
    pub fn pip_available(&self) -> bool {
        self.live && self.surface.supports_pip()
    }

    /// Request picture-in-picture; state changes once the surface reports it
    pub fn request_pip(&self) -> Result<(), MatchcastError> {
        if !self.pip_available() {
            return Err(MatchcastError::InvalidState {
                expected: "live stream on a surface with picture-in-picture".to_string(),
                actual: if self.live {
                    "picture-in-picture unsupported".to_string()
                } else {
                    "not rendering a live stream".to_string()
                },
            });
        }
        self.surface.request_pip()
    }

    /// Leave picture-in-picture if active
    pub fn exit_pip(&self) {
        if self.state.pip_active {
            self.surface.exit_pip();
        }
    }

    /// Record whether a live stream is being rendered
    ///
    /// Leaving live rendering exits picture-in-picture.
    pub fn set_live(&mut self, live: bool) {
        if self.live == live {
            return;
        }
        self.live = live;
        if !live && self.state.pip_active {
            debug!("Live stream ended, leaving picture-in-picture");
            self.surface.exit_pip();
            self.state.pip_active = false;
        }
    }

    /// Apply a surface notification
    pub fn handle_event(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::EnteredPip => self.state.pip_active = true,
            PlaybackEvent::LeftPip => self.state.pip_active = false,
            PlaybackEvent::FullscreenChanged(on) => self.state.fullscreen = on,
        }
    }
}

/// Surface that renders nothing and records what it was asked to do
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    pip_supported: bool,
    calls: Mutex<SurfaceCalls>,
}

/// Calls received by a [`HeadlessSurface`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurfaceCalls {
    /// Last mute value applied
    pub muted: bool,
    /// Fullscreen requests
    pub fullscreen_requests: usize,
    /// Picture-in-picture requests
    pub pip_requests: usize,
    /// Picture-in-picture exits
    pub pip_exits: usize,
}

impl HeadlessSurface {
    /// Create a surface, optionally claiming picture-in-picture support
    pub fn new(pip_supported: bool) -> Self {
        Self {
            pip_supported,
            calls: Mutex::new(SurfaceCalls::default()),
        }
    }

    /// Snapshot of received calls
    pub fn calls(&self) -> SurfaceCalls {
        self.calls.lock().clone()
    }
}

impl PlaybackSurface for HeadlessSurface {
    fn set_muted(&self, muted: bool) {
        self.calls.lock().muted = muted;
    }

    fn request_fullscreen(&self) -> Result<(), MatchcastError> {
        self.calls.lock().fullscreen_requests += 1;
        Ok(())
    }

    fn supports_pip(&self) -> bool {
        self.pip_supported
    }

    fn request_pip(&self) -> Result<(), MatchcastError> {
        self.calls.lock().pip_requests += 1;
        Ok(())
    }

    fn exit_pip(&self) {
        self.calls.lock().pip_exits += 1;
    }
}
