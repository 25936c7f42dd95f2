//! Event system for viewer and broadcaster sessions

use matchcast_core::{CameraKey, MediaTrack, ViewerId};
use matchcast_media::PlaybackState;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::viewer::ConnectionState;

/// Events emitted by a viewer connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    /// The connection state changed
    StateChanged {
        /// Previous state
        from: ConnectionState,
        /// New state
        to: ConnectionState,
    },
    /// A viewer request was published to the camera
    RequestSent {
        /// Identity used for this attempt
        viewer_id: ViewerId,
        /// Camera asked
        camera: CameraKey,
    },
    /// The camera's offer was answered
    AnswerSent {
        /// Identity used for this attempt
        viewer_id: ViewerId,
        /// Camera answered
        camera: CameraKey,
    },
    /// A remote media track arrived
    TrackReceived {
        /// The track
        track: MediaTrack,
    },
    /// The active camera is showing a still image
    FallbackShown {
        /// Camera in fallback
        camera: CameraKey,
        /// Image to render
        image_url: Option<String>,
    },
    /// An attempt was torn down
    AttemptClosed {
        /// Identity of the closed attempt
        viewer_id: ViewerId,
        /// Why it was closed
        reason: String,
    },
    /// Playback controls changed
    PlaybackChanged {
        /// New playback state
        state: PlaybackState,
    },
    /// The attempt failed; a manual retry is needed
    Failed {
        /// Failure description
        reason: String,
    },
}

impl ViewerEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            ViewerEvent::StateChanged { .. } => "state_changed",
            ViewerEvent::RequestSent { .. } => "request_sent",
            ViewerEvent::AnswerSent { .. } => "answer_sent",
            ViewerEvent::TrackReceived { .. } => "track_received",
            ViewerEvent::FallbackShown { .. } => "fallback_shown",
            ViewerEvent::AttemptClosed { .. } => "attempt_closed",
            ViewerEvent::PlaybackChanged { .. } => "playback_changed",
            ViewerEvent::Failed { .. } => "failed",
        }
    }

    /// Check if this is a negotiation or connection event
    pub fn is_connection_event(&self) -> bool {
        matches!(
            self,
            ViewerEvent::StateChanged { .. }
                | ViewerEvent::RequestSent { .. }
                | ViewerEvent::AnswerSent { .. }
                | ViewerEvent::AttemptClosed { .. }
        )
    }

    /// Check if this is an error event
    pub fn is_error_event(&self) -> bool {
        matches!(self, ViewerEvent::Failed { .. })
    }
}

/// Events emitted by a broadcaster connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcasterEvent {
    /// The broadcast went live or ended
    LiveChanged {
        /// Whether the room is live now
        is_live: bool,
    },
    /// Viewers were told to switch cameras
    ActiveCameraChanged {
        /// New active camera
        camera: CameraKey,
    },
    /// This camera entered or left fallback
    FallbackChanged {
        /// Whether fallback is on
        enabled: bool,
        /// Image shown while in fallback
        image_url: Option<String>,
    },
    /// An offer was sent in reply to a viewer request
    OfferSent {
        /// Viewer addressed
        viewer_id: ViewerId,
    },
    /// A repeated viewer request was ignored
    DuplicateRequestIgnored {
        /// Viewer that asked again
        viewer_id: ViewerId,
    },
    /// A viewer connection carries media
    ViewerConnected {
        /// Connected viewer
        viewer_id: ViewerId,
    },
    /// A viewer connection was closed or failed
    ViewerDropped {
        /// Dropped viewer
        viewer_id: ViewerId,
        /// Why it was dropped
        reason: String,
    },
    /// The room store rejected a write for rate; the heartbeat slowed down
    WriteThrottled {
        /// Wait suggested by the store
        retry_in: Duration,
        /// Heartbeat interval from now on
        next_interval: Duration,
    },
    /// Something failed without stopping the broadcast
    Error {
        /// Error that occurred
        error: String,
        /// Whether this error is recoverable
        recoverable: bool,
    },
}

impl BroadcasterEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            BroadcasterEvent::LiveChanged { .. } => "live_changed",
            BroadcasterEvent::ActiveCameraChanged { .. } => "active_camera_changed",
            BroadcasterEvent::FallbackChanged { .. } => "fallback_changed",
            BroadcasterEvent::OfferSent { .. } => "offer_sent",
            BroadcasterEvent::DuplicateRequestIgnored { .. } => "duplicate_request_ignored",
            BroadcasterEvent::ViewerConnected { .. } => "viewer_connected",
            BroadcasterEvent::ViewerDropped { .. } => "viewer_dropped",
            BroadcasterEvent::WriteThrottled { .. } => "write_throttled",
            BroadcasterEvent::Error { .. } => "error",
        }
    }

    /// Check if this is a viewer-related event
    pub fn is_viewer_event(&self) -> bool {
        matches!(
            self,
            BroadcasterEvent::OfferSent { .. }
                | BroadcasterEvent::DuplicateRequestIgnored { .. }
                | BroadcasterEvent::ViewerConnected { .. }
                | BroadcasterEvent::ViewerDropped { .. }
        )
    }

    /// Check if this is a non-fatal warning
    pub fn is_warning(&self) -> bool {
        matches!(self, BroadcasterEvent::WriteThrottled { .. })
    }

    /// Check if this is an error event
    pub fn is_error_event(&self) -> bool {
        matches!(self, BroadcasterEvent::Error { .. })
    }
}

/// Stream of session events for async iteration
#[derive(Debug)]
pub struct EventStream<E> {
    receiver: mpsc::UnboundedReceiver<E>,
}

impl<E> EventStream<E> {
    /// Create a new event stream with a receiver
    pub fn new(receiver: mpsc::UnboundedReceiver<E>) -> Self {
        Self { receiver }
    }

    /// Get the next event from the stream
    pub async fn next(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    /// Try to get the next event without blocking
    pub fn try_next(&mut self) -> Result<Option<E>, mpsc::error::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(mpsc::error::TryRecvError::Disconnected)
            }
        }
    }

    /// Close the event stream
    pub fn close(&mut self) {
        self.receiver.close();
    }

    /// Check if the event stream is closed
    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }
}

/// Fan-out of events to every open [`EventStream`]
#[derive(Debug)]
pub(crate) struct EventBus<E> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<E>>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<E: Clone> EventBus<E> {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn subscribe(&self) -> EventStream<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventStream::new(rx)
    }

    pub(crate) fn emit(&self, event: E) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
