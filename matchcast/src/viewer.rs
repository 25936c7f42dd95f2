//! Viewer connection manager
//!
//! One actor task per viewer owns the whole connection lifecycle. It reacts
//! to three input sources, one at a time:
//!
//! - room document changes, which decide the target (offline, fallback
//!   image, or live camera),
//! - messages in the current attempt's inbox and events from its peer,
//! - commands from the [`ViewerConnectionManager`] handle.
//!
//! A connection attempt (viewer id, peer connection, inbox subscription) is
//! owned by exactly one [`Phase`] value. Leaving that phase closes the peer
//! and cancels the subscription before any new attempt is created, so two
//! attempts never overlap.

use crate::config::ViewerConfig;
use crate::event::{EventBus, EventStream, ViewerEvent};
use crate::Matchcast;
use matchcast_core::{
    BroadcastTarget, CameraKey, FixtureId, IceServerConfig, MatchcastError, MediaTrack, PeerConfig,
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEvents,
    SessionDescription, ViewerId,
};
use matchcast_media::{HeadlessSurface, PlaybackControls, PlaybackEvent, PlaybackState, PlaybackSurface};
use matchcast_signaling::{
    RoomStore, RoomWatch, Signal, SignalPayload, SignalingChannel, SignalingMessage,
    Subscription,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

/// Observable connection state of a viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No live broadcast to connect to
    Idle,
    /// Showing the active camera's still image
    Fallback,
    /// Waiting for the camera's offer
    Connecting,
    /// Answer sent, waiting for media
    Negotiating,
    /// Media is flowing
    Connected,
    /// The attempt failed; waiting for a manual retry
    Failed,
}

/// What the viewer should render
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewerDisplay {
    /// Nothing is being broadcast
    Offline,
    /// Loading indicator while connecting
    Loading,
    /// Temporary feed: a still image instead of live video
    Fallback {
        /// Image to render
        image_url: Option<String>,
    },
    /// The remote stream
    Live {
        /// Received tracks
        tracks: Vec<MediaTrack>,
    },
    /// Failure with a retry prompt
    RetryPrompt {
        /// What went wrong
        reason: String,
    },
}

/// Point-in-time view of a viewer session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerSnapshot {
    /// Connection state
    pub state: ConnectionState,
    /// Identity of the current or last attempt
    pub viewer_id: Option<ViewerId>,
    /// Camera being watched
    pub camera: Option<CameraKey>,
    /// What to render
    pub display: ViewerDisplay,
    /// Playback control state
    pub playback: PlaybackState,
    /// Attempts started so far
    pub attempts: u64,
}

impl Default for ViewerSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            viewer_id: None,
            camera: None,
            display: ViewerDisplay::Offline,
            playback: PlaybackState::default(),
            attempts: 0,
        }
    }
}

/// Fluent builder for a viewer session
#[derive(Debug)]
pub struct ViewerBuilder {
    matchcast: Matchcast,
    fixture_id: FixtureId,
    config: ViewerConfig,
    surface: Option<Arc<dyn PlaybackSurface>>,
}

impl ViewerBuilder {
    pub(crate) fn new(matchcast: &Matchcast, fixture_id: FixtureId) -> Self {
        let config = ViewerConfig {
            ice_servers: matchcast.config().ice_servers.clone(),
            ..ViewerConfig::default()
        };
        Self {
            matchcast: matchcast.clone(),
            fixture_id,
            config,
            surface: None,
        }
    }

    /// Replace the whole viewer configuration
    pub fn config(mut self, config: ViewerConfig) -> Self {
        self.config = config;
        self
    }

    /// Delay between subscribing and publishing the viewer request
    pub fn request_delay(mut self, delay: Duration) -> Self {
        self.config.request_delay = delay;
        self
    }

    /// Servers used for network path discovery
    pub fn ice_servers(mut self, servers: Vec<IceServerConfig>) -> Self {
        self.config.ice_servers = servers;
        self
    }

    /// Element rendering the stream; a headless surface is used otherwise
    pub fn surface(mut self, surface: Arc<dyn PlaybackSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    /// Start watching the room
    pub async fn start(self) -> Result<ViewerConnectionManager, MatchcastError> {
        let surface = self
            .surface
            .unwrap_or_else(|| Arc::new(HeadlessSurface::new(false)));
        ViewerConnectionManager::start(
            self.fixture_id,
            self.matchcast.channel(),
            self.matchcast.store(),
            self.matchcast.peers(),
            surface,
            self.config,
        )
        .await
    }
}

enum Command {
    Retry(oneshot::Sender<Result<Option<ViewerId>, MatchcastError>>),
    ToggleMute(oneshot::Sender<bool>),
    Fullscreen(oneshot::Sender<Result<(), MatchcastError>>),
    RequestPip(oneshot::Sender<Result<(), MatchcastError>>),
    ExitPip,
    Playback(PlaybackEvent),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running viewer session
#[derive(Debug)]
pub struct ViewerConnectionManager {
    fixture_id: FixtureId,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ViewerSnapshot>,
    events: EventBus<ViewerEvent>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Retry(_) => "Retry",
            Command::ToggleMute(_) => "ToggleMute",
            Command::Fullscreen(_) => "Fullscreen",
            Command::RequestPip(_) => "RequestPip",
            Command::ExitPip => "ExitPip",
            Command::Playback(_) => "Playback",
            Command::Shutdown(_) => "Shutdown",
        };
        f.write_str(name)
    }
}

impl ViewerConnectionManager {
    /// Watch `fixture_id` and connect whenever its active camera is live
    pub async fn start(
        fixture_id: FixtureId,
        channel: Arc<dyn SignalingChannel>,
        store: Arc<dyn RoomStore>,
        peers: Arc<dyn PeerConnectionFactory>,
        surface: Arc<dyn PlaybackSurface>,
        config: ViewerConfig,
    ) -> Result<Self, MatchcastError> {
        let room = store.watch(&fixture_id).await?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(ViewerSnapshot::default());
        let events = EventBus::new();

        let actor = ViewerActor {
            fixture_id: fixture_id.clone(),
            channel,
            peers,
            config,
            room,
            room_open: true,
            commands: command_rx,
            phase: Phase::Idle,
            target: BroadcastTarget::Offline,
            playback: PlaybackControls::new(surface),
            attempts: 0,
            snapshot: snapshot_tx,
            events: events.clone(),
        };
        let task = tokio::spawn(actor.run());
        info!("Viewer started for fixture {}", fixture_id);

        Ok(Self {
            fixture_id,
            commands,
            snapshot,
            events,
            task,
        })
    }

    /// Fixture being watched
    pub fn fixture_id(&self) -> &FixtureId {
        &self.fixture_id
    }

    /// Current snapshot
    pub fn snapshot(&self) -> ViewerSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Receiver of snapshot changes
    pub fn watch(&self) -> watch::Receiver<ViewerSnapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to session events
    pub fn events(&self) -> EventStream<ViewerEvent> {
        self.events.subscribe()
    }

    /// Wait until the snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&ViewerSnapshot) -> bool,
    ) -> Result<ViewerSnapshot, MatchcastError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| closed())?
            .clone();
        Ok(snapshot)
    }

    /// Wait until the session reaches `state`
    pub async fn wait_for_state(
        &self,
        state: ConnectionState,
    ) -> Result<ViewerSnapshot, MatchcastError> {
        self.wait_for(|s| s.state == state).await
    }

    /// Restart after a failure with a fresh viewer id
    ///
    /// Only valid while `Failed`. Returns the new id if the room is still
    /// live and an attempt was started.
    pub async fn retry(&self) -> Result<Option<ViewerId>, MatchcastError> {
        self.request(Command::Retry).await?
    }

    /// Flip local audio mute, returning the new value
    pub async fn toggle_mute(&self) -> Result<bool, MatchcastError> {
        self.request(Command::ToggleMute).await
    }

    /// Ask the surface for fullscreen
    pub async fn request_fullscreen(&self) -> Result<(), MatchcastError> {
        self.request(Command::Fullscreen).await?
    }

    /// Ask the surface for picture-in-picture
    pub async fn request_pip(&self) -> Result<(), MatchcastError> {
        self.request(Command::RequestPip).await?
    }

    /// Leave picture-in-picture
    pub fn exit_pip(&self) -> Result<(), MatchcastError> {
        self.send(Command::ExitPip)
    }

    /// Forward a notification from the playback surface
    pub fn notify_playback(&self, event: PlaybackEvent) -> Result<(), MatchcastError> {
        self.send(Command::Playback(event))
    }

    /// Tear down the current attempt and stop the actor
    pub async fn shutdown(self) -> Result<(), MatchcastError> {
        self.request(Command::Shutdown).await?;
        let _ = self.task.await;
        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), MatchcastError> {
        self.commands.send(command).map_err(|_| closed())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MatchcastError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| closed())
    }
}

fn closed() -> MatchcastError {
    MatchcastError::ChannelClosed {
        channel: "viewer".to_string(),
    }
}

/// Everything owned by one connection attempt
#[derive(Debug)]
struct Attempt {
    viewer_id: ViewerId,
    camera: CameraKey,
    peer: Arc<dyn PeerConnection>,
    peer_events: PeerEvents,
    inbox: Subscription,
    request_at: Option<Instant>,
    tracks: Vec<MediaTrack>,
}

enum AttemptInput {
    Signal(Option<SignalingMessage>),
    Peer(Option<PeerEvent>),
    RequestDue,
}

impl Attempt {
    async fn next_input(&mut self) -> AttemptInput {
        tokio::select! {
            message = self.inbox.recv() => AttemptInput::Signal(message),
            event = self.peer_events.recv() => AttemptInput::Peer(event),
            _ = request_due(self.request_at) => AttemptInput::RequestDue,
        }
    }
}

async fn request_due(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[derive(Debug)]
enum Phase {
    Idle,
    Fallback {
        camera: CameraKey,
        image_url: Option<String>,
    },
    Connecting(Attempt),
    Negotiating(Attempt),
    Connected(Attempt),
    Failed {
        camera: CameraKey,
        viewer_id: ViewerId,
        reason: String,
    },
}

impl Phase {
    fn state(&self) -> ConnectionState {
        match self {
            Phase::Idle => ConnectionState::Idle,
            Phase::Fallback { .. } => ConnectionState::Fallback,
            Phase::Connecting(_) => ConnectionState::Connecting,
            Phase::Negotiating(_) => ConnectionState::Negotiating,
            Phase::Connected(_) => ConnectionState::Connected,
            Phase::Failed { .. } => ConnectionState::Failed,
        }
    }

    fn attempt(&self) -> Option<&Attempt> {
        match self {
            Phase::Connecting(a) | Phase::Negotiating(a) | Phase::Connected(a) => Some(a),
            _ => None,
        }
    }

    fn attempt_mut(&mut self) -> Option<&mut Attempt> {
        match self {
            Phase::Connecting(a) | Phase::Negotiating(a) | Phase::Connected(a) => Some(a),
            _ => None,
        }
    }

    fn into_attempt(self) -> Option<Attempt> {
        match self {
            Phase::Connecting(a) | Phase::Negotiating(a) | Phase::Connected(a) => Some(a),
            _ => None,
        }
    }
}

async fn next_attempt_input(phase: &mut Phase) -> AttemptInput {
    match phase.attempt_mut() {
        Some(attempt) => attempt.next_input().await,
        None => std::future::pending().await,
    }
}

enum Input {
    Room,
    RoomClosed,
    Command(Option<Command>),
    Attempt(AttemptInput),
}

struct ViewerActor {
    fixture_id: FixtureId,
    channel: Arc<dyn SignalingChannel>,
    peers: Arc<dyn PeerConnectionFactory>,
    config: ViewerConfig,
    room: RoomWatch,
    room_open: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    phase: Phase,
    target: BroadcastTarget,
    playback: PlaybackControls,
    attempts: u64,
    snapshot: watch::Sender<ViewerSnapshot>,
    events: EventBus<ViewerEvent>,
}

impl ViewerActor {
    async fn run(mut self) {
        let initial = self.room.borrow_and_update().clone();
        self.apply_target(BroadcastTarget::of(initial.as_ref())).await;
        self.publish_snapshot();

        loop {
            let input = {
                let room = &mut self.room;
                let room_open = self.room_open;
                let commands = &mut self.commands;
                let phase = &mut self.phase;
                tokio::select! {
                    changed = room.changed(), if room_open => match changed {
                        Ok(()) => Input::Room,
                        Err(_) => Input::RoomClosed,
                    },
                    command = commands.recv() => Input::Command(command),
                    input = next_attempt_input(phase) => Input::Attempt(input),
                }
            };

            match input {
                Input::Room => self.on_room_changed().await,
                Input::RoomClosed => {
                    warn!("Room store for {} went away", self.fixture_id);
                    self.room_open = false;
                }
                Input::Command(Some(Command::Shutdown(reply))) => {
                    self.teardown("viewer shut down").await;
                    self.phase = Phase::Idle;
                    self.publish_snapshot();
                    let _ = reply.send(());
                    break;
                }
                Input::Command(Some(command)) => self.on_command(command).await,
                Input::Command(None) => {
                    debug!("Viewer handle dropped, stopping");
                    self.teardown("viewer handle dropped").await;
                    break;
                }
                Input::Attempt(AttemptInput::Signal(Some(message))) => {
                    self.on_message(message).await
                }
                Input::Attempt(AttemptInput::Signal(None)) => {
                    self.fail("signaling channel closed").await
                }
                Input::Attempt(AttemptInput::Peer(Some(event))) => self.on_peer_event(event).await,
                Input::Attempt(AttemptInput::Peer(None)) => {
                    self.fail("peer connection went away").await
                }
                Input::Attempt(AttemptInput::RequestDue) => self.send_request().await,
            }
            self.publish_snapshot();
        }
        debug!("Viewer actor for {} stopped", self.fixture_id);
    }

    async fn on_room_changed(&mut self) {
        let room = self.room.borrow_and_update().clone();
        let target = BroadcastTarget::of(room.as_ref());
        if target == self.target {
            trace!("Room update without target change");
            return;
        }
        debug!("Target changed: {:?} -> {:?}", self.target, target);
        self.apply_target(target).await;
    }

    /// Tear down whatever runs now, then move towards `target`
    async fn apply_target(&mut self, target: BroadcastTarget) {
        self.target = target.clone();
        self.teardown("broadcast target changed").await;
        self.phase = Phase::Idle;

        match target {
            BroadcastTarget::Offline => {}
            BroadcastTarget::Fallback { camera, image_url } => {
                info!("🖼️ Showing fallback image for {}", camera);
                self.events.emit(ViewerEvent::FallbackShown {
                    camera: camera.clone(),
                    image_url: image_url.clone(),
                });
                self.phase = Phase::Fallback { camera, image_url };
            }
            BroadcastTarget::Live { camera } => self.begin_attempt(camera).await,
        }
    }

    async fn begin_attempt(&mut self, camera: CameraKey) {
        let viewer_id = ViewerId::generate();
        self.attempts += 1;
        info!(
            "Connecting to {} as {} (attempt {})",
            camera, viewer_id, self.attempts
        );

        let inbox = match self.channel.subscribe(&self.fixture_id, viewer_id.as_str()).await {
            Ok(inbox) => inbox,
            Err(e) => {
                self.enter_failed(camera, viewer_id, format!("subscribe failed: {}", e));
                return;
            }
        };
        let config = PeerConfig::new(self.config.ice_servers.clone(), camera.as_str());
        let (peer, peer_events) = match self.peers.create(&config) {
            Ok(created) => created,
            Err(e) => {
                drop(inbox);
                self.enter_failed(camera, viewer_id, format!("peer creation failed: {}", e));
                return;
            }
        };

        self.phase = Phase::Connecting(Attempt {
            viewer_id,
            camera,
            peer,
            peer_events,
            inbox,
            request_at: Some(Instant::now() + self.config.request_delay),
            tracks: Vec::new(),
        });
    }

    async fn send_request(&mut self) {
        let Phase::Connecting(attempt) = &mut self.phase else {
            return;
        };
        attempt.request_at = None;
        let signal = Signal::viewer_request(&attempt.viewer_id, &attempt.camera);
        let viewer_id = attempt.viewer_id.clone();
        let camera = attempt.camera.clone();

        match self.channel.publish(&self.fixture_id, signal).await {
            Ok(id) => {
                debug!("Published viewer request {} to {}", id, camera);
                self.events
                    .emit(ViewerEvent::RequestSent { viewer_id, camera });
            }
            Err(e) => self.fail(format!("viewer request failed: {}", e)).await,
        }
    }

    async fn on_message(&mut self, message: SignalingMessage) {
        let Some(attempt) = self.phase.attempt() else {
            self.delete(&message).await;
            return;
        };
        let from_camera = message.from == attempt.camera.as_str();
        let peer = attempt.peer.clone();
        let connecting = matches!(self.phase, Phase::Connecting(_));

        match &message.payload {
            SignalPayload::Offer(offer) if from_camera && connecting => {
                let offer = offer.clone();
                self.accept_offer(&message, offer).await;
            }
            SignalPayload::Offer(_) if from_camera => {
                debug!("Ignoring duplicate offer {}", message.id);
                self.delete(&message).await;
            }
            SignalPayload::IceCandidate(candidate) if from_camera => {
                if peer.is_closed() {
                    trace!("Discarding candidate {} for closed peer", message.id);
                } else if let Err(e) = peer.add_ice_candidate(candidate.clone()).await {
                    debug!("Candidate {} not applied: {}", message.id, e);
                }
                self.delete(&message).await;
            }
            _ => {
                debug!(
                    "Ignoring {} {} from {}",
                    message.kind(),
                    message.id,
                    message.from
                );
                self.delete(&message).await;
            }
        }
    }

    async fn accept_offer(&mut self, message: &SignalingMessage, offer: SessionDescription) {
        let Some(attempt) = self.phase.attempt() else {
            return;
        };
        let peer = attempt.peer.clone();
        let viewer_id = attempt.viewer_id.clone();
        let camera = attempt.camera.clone();

        let answered = async {
            peer.set_remote_description(offer).await?;
            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            self.channel
                .publish(
                    &self.fixture_id,
                    Signal::answer(&viewer_id, &message.from, answer),
                )
                .await
        }
        .await;
        self.delete(message).await;

        match answered {
            Ok(id) => {
                debug!("Answered offer {} with {}", message.id, id);
                if let Phase::Connecting(attempt) = std::mem::replace(&mut self.phase, Phase::Idle)
                {
                    self.phase = Phase::Negotiating(attempt);
                }
                self.events
                    .emit(ViewerEvent::AnswerSent { viewer_id, camera });
            }
            Err(e) => {
                warn!("Negotiation with {} failed: {}", camera, e);
                self.fail(e.to_string()).await;
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(attempt) = self.phase.attempt() else {
                    return;
                };
                let signal = Signal::ice_candidate(
                    attempt.viewer_id.as_str(),
                    attempt.camera.as_str(),
                    candidate,
                );
                if let Err(e) = self.channel.publish(&self.fixture_id, signal).await {
                    warn!("Failed to publish local candidate: {}", e);
                }
            }
            PeerEvent::Track(track) => {
                let Some(attempt) = self.phase.attempt_mut() else {
                    return;
                };
                attempt.tracks.push(track.clone());
                self.events.emit(ViewerEvent::TrackReceived { track });

                if !matches!(self.phase, Phase::Negotiating(_)) {
                    return;
                }
                if let Phase::Negotiating(attempt) =
                    std::mem::replace(&mut self.phase, Phase::Idle)
                {
                    info!("✅ Connected to {} as {}", attempt.camera, attempt.viewer_id);
                    self.phase = Phase::Connected(attempt);
                }
                self.playback.set_live(true);
                self.emit_playback();
            }
            PeerEvent::StateChanged(state) => match state {
                PeerConnectionState::Failed => self.fail("peer connection failed").await,
                PeerConnectionState::Closed => self.fail("peer connection closed").await,
                PeerConnectionState::Disconnected => {
                    debug!("Peer connection disconnected, waiting for recovery")
                }
                other => trace!("Peer connection state {:?}", other),
            },
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Retry(reply) => {
                let result = self.retry().await;
                let _ = reply.send(result);
            }
            Command::ToggleMute(reply) => {
                let muted = self.playback.toggle_mute();
                self.emit_playback();
                let _ = reply.send(muted);
            }
            Command::Fullscreen(reply) => {
                let _ = reply.send(self.playback.request_fullscreen());
            }
            Command::RequestPip(reply) => {
                let _ = reply.send(self.playback.request_pip());
            }
            Command::ExitPip => self.playback.exit_pip(),
            Command::Playback(event) => {
                self.playback.handle_event(event);
                self.emit_playback();
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn retry(&mut self) -> Result<Option<ViewerId>, MatchcastError> {
        if !matches!(self.phase, Phase::Failed { .. }) {
            return Err(MatchcastError::InvalidState {
                expected: "failed".to_string(),
                actual: format!("{:?}", self.phase.state()).to_lowercase(),
            });
        }
        info!("Retrying connection for fixture {}", self.fixture_id);
        let room = self.room.borrow_and_update().clone();
        self.apply_target(BroadcastTarget::of(room.as_ref())).await;
        Ok(self.phase.attempt().map(|a| a.viewer_id.clone()))
    }

    /// Leave the current attempt in `Failed`
    async fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        let Some((camera, viewer_id)) = self
            .phase
            .attempt()
            .map(|a| (a.camera.clone(), a.viewer_id.clone()))
        else {
            return;
        };
        self.teardown(&reason).await;
        self.enter_failed(camera, viewer_id, reason);
    }

    fn enter_failed(&mut self, camera: CameraKey, viewer_id: ViewerId, reason: String) {
        warn!("Viewer {} failed: {}", viewer_id, reason);
        self.events.emit(ViewerEvent::Failed {
            reason: reason.clone(),
        });
        self.phase = Phase::Failed {
            camera,
            viewer_id,
            reason,
        };
    }

    /// Close the peer and cancel the inbox of the current attempt
    ///
    /// Messages that were delivered but not handled are deleted.
    async fn teardown(&mut self, reason: &str) {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        if let Some(mut attempt) = phase.into_attempt() {
            attempt.peer.close();
            let unread = attempt.inbox.cancel_and_drain();
            debug!(
                "Tore down {} ({}), {} unread messages",
                attempt.viewer_id,
                reason,
                unread.len()
            );
            for message in &unread {
                self.delete(message).await;
            }
            self.events.emit(ViewerEvent::AttemptClosed {
                viewer_id: attempt.viewer_id,
                reason: reason.to_string(),
            });
        }

        let before = self.playback.state();
        self.playback.set_live(false);
        if self.playback.state() != before {
            self.emit_playback();
        }
    }

    async fn delete(&self, message: &SignalingMessage) {
        if let Err(e) = self.channel.delete(&self.fixture_id, message.id).await {
            warn!("Failed to delete message {}: {}", message.id, e);
        }
    }

    fn emit_playback(&self) {
        self.events.emit(ViewerEvent::PlaybackChanged {
            state: self.playback.state(),
        });
    }

    fn publish_snapshot(&mut self) {
        let next = self.current_snapshot();
        let previous = self.snapshot.borrow().state;
        if previous != next.state {
            self.events.emit(ViewerEvent::StateChanged {
                from: previous,
                to: next.state,
            });
        }
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn current_snapshot(&self) -> ViewerSnapshot {
        let (viewer_id, camera, display) = match &self.phase {
            Phase::Idle => (None, None, ViewerDisplay::Offline),
            Phase::Fallback { camera, image_url } => (
                None,
                Some(camera.clone()),
                ViewerDisplay::Fallback {
                    image_url: image_url.clone(),
                },
            ),
            Phase::Connecting(a) | Phase::Negotiating(a) => (
                Some(a.viewer_id.clone()),
                Some(a.camera.clone()),
                ViewerDisplay::Loading,
            ),
            Phase::Connected(a) => (
                Some(a.viewer_id.clone()),
                Some(a.camera.clone()),
                ViewerDisplay::Live {
                    tracks: a.tracks.clone(),
                },
            ),
            Phase::Failed {
                camera,
                viewer_id,
                reason,
            } => (
                Some(viewer_id.clone()),
                Some(camera.clone()),
                ViewerDisplay::RetryPrompt {
                    reason: reason.clone(),
                },
            ),
        };
        ViewerSnapshot {
            state: self.phase.state(),
            viewer_id,
            camera,
            display,
            playback: self.playback.state(),
            attempts: self.attempts,
        }
    }
}
