//! Broadcaster connection manager
//!
//! One manager runs per camera. It owns the camera's local stream, answers
//! viewer requests addressed to the camera key with offers, and keeps the
//! room document up to date (live flag, active camera, fallback status,
//! heartbeat).

use crate::config::BroadcasterConfig;
use crate::event::{BroadcasterEvent, EventBus, EventStream};
use crate::Matchcast;
use matchcast_core::{
    BroadcastRoom, CameraKey, FixtureId, IceCandidate, MatchcastError, PeerConfig,
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, RoomPatch,
    SessionDescription, ViewerId,
};
use matchcast_media::{CameraSource, LocalStream};
use matchcast_signaling::{
    RoomStore, Signal, SignalPayload, SignalingChannel, SignalingMessage, Subscription,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

/// Point-in-time view of a broadcaster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcasterStatus {
    /// Camera this manager serves
    pub camera: CameraKey,
    /// Whether this manager has the room live
    pub is_live: bool,
    /// Whether this camera shows a fallback image
    pub using_fallback: bool,
    /// Viewers with an open peer, connected or not
    pub viewers: usize,
    /// Viewers whose peer carries media
    pub connected_viewers: usize,
    /// Current heartbeat interval
    pub heartbeat_interval: Duration,
}

/// Fluent builder for a broadcaster
#[derive(Debug)]
pub struct BroadcasterBuilder {
    matchcast: Matchcast,
    fixture_id: FixtureId,
    camera_id: u8,
    config: BroadcasterConfig,
    camera_source: Option<Arc<dyn CameraSource>>,
}

impl BroadcasterBuilder {
    pub(crate) fn new(matchcast: &Matchcast, fixture_id: FixtureId, camera_id: u8) -> Self {
        let config = BroadcasterConfig {
            ice_servers: matchcast.config().ice_servers.clone(),
            ..BroadcasterConfig::default()
        };
        Self {
            matchcast: matchcast.clone(),
            fixture_id,
            camera_id,
            config,
            camera_source: None,
        }
    }

    /// Replace the whole broadcaster configuration
    pub fn config(mut self, config: BroadcasterConfig) -> Self {
        self.config = config;
        self
    }

    /// Source of the local camera stream (required)
    pub fn camera_source(mut self, source: Arc<dyn CameraSource>) -> Self {
        self.camera_source = Some(source);
        self
    }

    /// Window in which repeated requests from one viewer are ignored
    pub fn request_debounce(mut self, window: Duration) -> Self {
        self.config.request_debounce = window;
        self
    }

    /// Heartbeat interval and its backoff ceiling
    pub fn heartbeat(mut self, interval: Duration, max: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self.config.max_heartbeat_interval = max;
        self
    }

    /// Acquire the camera, register it in the room and start answering viewers
    pub async fn start(self) -> Result<BroadcasterConnectionManager, MatchcastError> {
        let source = self
            .camera_source
            .ok_or_else(|| MatchcastError::MissingConfiguration {
                field: "camera_source".to_string(),
            })?;
        BroadcasterConnectionManager::start(
            self.fixture_id,
            CameraKey::from_id(self.camera_id),
            self.matchcast.channel(),
            self.matchcast.store(),
            self.matchcast.peers(),
            source,
            self.config,
        )
        .await
    }
}

enum Command {
    SetLive(bool, oneshot::Sender<Result<(), MatchcastError>>),
    SetActiveCamera(u8, oneshot::Sender<Result<(), MatchcastError>>),
    SetFallback(
        Option<Option<String>>,
        oneshot::Sender<Result<(), MatchcastError>>,
    ),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running broadcaster
#[derive(Debug)]
pub struct BroadcasterConnectionManager {
    fixture_id: FixtureId,
    camera: CameraKey,
    local_stream: LocalStream,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<BroadcasterStatus>,
    events: EventBus<BroadcasterEvent>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::SetLive(live, _) => write!(f, "SetLive({})", live),
            Command::SetActiveCamera(id, _) => write!(f, "SetActiveCamera({})", id),
            Command::SetFallback(url, _) => write!(f, "SetFallback({:?})", url),
            Command::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

impl BroadcasterConnectionManager {
    /// Acquire local media, register `camera` in the room and subscribe to
    /// its inbox
    ///
    /// Capture denials come back as [`MatchcastError::Media`] carrying the
    /// message to show the operator.
    pub async fn start(
        fixture_id: FixtureId,
        camera: CameraKey,
        channel: Arc<dyn SignalingChannel>,
        store: Arc<dyn RoomStore>,
        peers: Arc<dyn PeerConnectionFactory>,
        camera_source: Arc<dyn CameraSource>,
        config: BroadcasterConfig,
    ) -> Result<Self, MatchcastError> {
        let local_stream = camera_source.acquire(&config.capture).await?;

        let room = store
            .update(
                &fixture_id,
                RoomPatch::RegisterCamera {
                    camera: camera.clone(),
                },
            )
            .await?;
        let inbox = channel.subscribe(&fixture_id, camera.as_str()).await?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let status = BroadcasterStatus {
            camera: camera.clone(),
            is_live: room.is_live,
            using_fallback: room.camera_status(&camera).is_using_fallback,
            viewers: 0,
            connected_viewers: 0,
            heartbeat_interval: config.heartbeat_interval,
        };
        let (status_tx, status_rx) = watch::channel(status);
        let events = EventBus::new();

        let actor = BroadcasterActor {
            fixture_id: fixture_id.clone(),
            camera: camera.clone(),
            channel,
            store,
            peers,
            local_stream: local_stream.clone(),
            inbox,
            inbox_open: true,
            commands: command_rx,
            peer_tx,
            peer_rx,
            viewers: HashMap::new(),
            next_generation: 0,
            is_live: room.is_live,
            using_fallback: room.camera_status(&camera).is_using_fallback,
            heartbeat_interval: config.heartbeat_interval,
            next_heartbeat: Instant::now() + config.heartbeat_interval,
            config,
            status: status_tx,
            events: events.clone(),
        };
        let task = tokio::spawn(actor.run());
        info!("🎥 Broadcaster {} started for fixture {}", camera, fixture_id);

        Ok(Self {
            fixture_id,
            camera,
            local_stream,
            commands,
            status: status_rx,
            events,
            task,
        })
    }

    /// Fixture being broadcast
    pub fn fixture_id(&self) -> &FixtureId {
        &self.fixture_id
    }

    /// Camera served by this manager
    pub fn camera(&self) -> &CameraKey {
        &self.camera
    }

    /// Stream attached to every viewer connection
    pub fn local_stream(&self) -> &LocalStream {
        &self.local_stream
    }

    /// Current status
    pub fn status(&self) -> BroadcasterStatus {
        self.status.borrow().clone()
    }

    /// Receiver of status changes
    pub fn watch(&self) -> watch::Receiver<BroadcasterStatus> {
        self.status.clone()
    }

    /// Subscribe to broadcaster events
    pub fn events(&self) -> EventStream<BroadcasterEvent> {
        self.events.subscribe()
    }

    /// Mark the room live so viewers start connecting
    pub async fn go_live(&self) -> Result<(), MatchcastError> {
        self.request(|tx| Command::SetLive(true, tx)).await?
    }

    /// Mark the room not live and close every viewer connection
    pub async fn end_broadcast(&self) -> Result<(), MatchcastError> {
        self.request(|tx| Command::SetLive(false, tx)).await?
    }

    /// Point viewers at camera `camera_id`
    pub async fn set_active_camera(&self, camera_id: u8) -> Result<(), MatchcastError> {
        self.request(|tx| Command::SetActiveCamera(camera_id, tx))
            .await?
    }

    /// Show a still image instead of this camera's video
    ///
    /// Viewer connections of this camera are closed.
    pub async fn enable_fallback(&self, image_url: Option<String>) -> Result<(), MatchcastError> {
        self.request(|tx| Command::SetFallback(Some(image_url), tx))
            .await?
    }

    /// Return this camera to live video
    pub async fn disable_fallback(&self) -> Result<(), MatchcastError> {
        self.request(|tx| Command::SetFallback(None, tx)).await?
    }

    /// Close every viewer connection and stop the actor
    ///
    /// The room document is left as is.
    pub async fn shutdown(self) -> Result<(), MatchcastError> {
        self.request(Command::Shutdown).await?;
        let _ = self.task.await;
        Ok(())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MatchcastError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }
}

fn closed() -> MatchcastError {
    MatchcastError::ChannelClosed {
        channel: "broadcaster".to_string(),
    }
}

/// Peer event tagged with the viewer and peer generation it came from
#[derive(Debug)]
struct TaggedPeerEvent {
    viewer: String,
    generation: u64,
    event: PeerEvent,
}

#[derive(Debug)]
struct ViewerPeer {
    peer: Arc<dyn PeerConnection>,
    generation: u64,
    created_at: Instant,
    answered: bool,
    connected: bool,
    forwarder: JoinHandle<()>,
}

impl ViewerPeer {
    fn close(&self) {
        self.peer.close();
        self.forwarder.abort();
    }
}

enum Input {
    Signal(Option<SignalingMessage>),
    Peer(TaggedPeerEvent),
    Command(Option<Command>),
    Heartbeat,
}

struct BroadcasterActor {
    fixture_id: FixtureId,
    camera: CameraKey,
    channel: Arc<dyn SignalingChannel>,
    store: Arc<dyn RoomStore>,
    peers: Arc<dyn PeerConnectionFactory>,
    config: BroadcasterConfig,
    local_stream: LocalStream,
    inbox: Subscription,
    inbox_open: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    peer_tx: mpsc::UnboundedSender<TaggedPeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<TaggedPeerEvent>,
    viewers: HashMap<String, ViewerPeer>,
    next_generation: u64,
    is_live: bool,
    using_fallback: bool,
    heartbeat_interval: Duration,
    next_heartbeat: Instant,
    status: watch::Sender<BroadcasterStatus>,
    events: EventBus<BroadcasterEvent>,
}

impl BroadcasterActor {
    async fn run(mut self) {
        loop {
            let input = {
                let inbox_open = self.inbox_open;
                let heartbeat_due = self.is_live;
                tokio::select! {
                    message = self.inbox.recv(), if inbox_open => Input::Signal(message),
                    Some(event) = self.peer_rx.recv() => Input::Peer(event),
                    command = self.commands.recv() => Input::Command(command),
                    _ = sleep_until(self.next_heartbeat), if heartbeat_due => Input::Heartbeat,
                }
            };

            match input {
                Input::Signal(Some(message)) => self.on_message(message).await,
                Input::Signal(None) => {
                    error!("Inbox of {} closed", self.camera);
                    self.inbox_open = false;
                    self.events.emit(BroadcasterEvent::Error {
                        error: "signaling channel closed".to_string(),
                        recoverable: false,
                    });
                }
                Input::Peer(tagged) => self.on_peer_event(tagged).await,
                Input::Command(Some(Command::Shutdown(reply))) => {
                    self.close_all_viewers("broadcaster shut down");
                    self.inbox.cancel();
                    self.publish_status();
                    let _ = reply.send(());
                    break;
                }
                Input::Command(Some(command)) => self.on_command(command).await,
                Input::Command(None) => {
                    debug!("Broadcaster handle dropped, stopping");
                    self.close_all_viewers("broadcaster handle dropped");
                    break;
                }
                Input::Heartbeat => self.heartbeat().await,
            }
            self.publish_status();
        }
        debug!("Broadcaster actor for {} stopped", self.camera);
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SetLive(live, reply) => {
                let _ = reply.send(self.set_live(live).await);
            }
            Command::SetActiveCamera(id, reply) => {
                let result = self
                    .write_room(RoomPatch::SetActiveCamera { camera_id: id })
                    .await
                    .map(|_| ());
                if result.is_ok() {
                    info!("Active camera set to camera{}", id);
                    self.events.emit(BroadcasterEvent::ActiveCameraChanged {
                        camera: CameraKey::from_id(id),
                    });
                }
                let _ = reply.send(result);
            }
            Command::SetFallback(fallback, reply) => {
                let _ = reply.send(self.set_fallback(fallback).await);
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn set_live(&mut self, live: bool) -> Result<(), MatchcastError> {
        self.write_room(RoomPatch::SetLive {
            is_live: live,
            camera: self.camera.clone(),
        })
        .await?;

        self.is_live = live;
        if live {
            info!("🔴 Fixture {} is live", self.fixture_id);
            self.next_heartbeat = Instant::now() + self.heartbeat_interval;
        } else {
            info!("Broadcast of fixture {} ended", self.fixture_id);
            self.close_all_viewers("broadcast ended");
        }
        self.events.emit(BroadcasterEvent::LiveChanged { is_live: live });
        Ok(())
    }

    async fn set_fallback(&mut self, fallback: Option<Option<String>>) -> Result<(), MatchcastError> {
        let camera = self.camera.clone();
        let patch = match fallback.clone() {
            Some(image_url) => RoomPatch::SetFallback { camera, image_url },
            None => RoomPatch::ClearFallback { camera },
        };
        self.write_room(patch).await?;

        self.using_fallback = fallback.is_some();
        if self.using_fallback {
            info!("🖼️ {} switched to fallback image", self.camera);
            self.close_all_viewers("fallback enabled");
        } else {
            info!("{} back to live video", self.camera);
        }
        self.events.emit(BroadcasterEvent::FallbackChanged {
            enabled: self.using_fallback,
            image_url: fallback.flatten(),
        });
        Ok(())
    }

    async fn write_room(&self, patch: RoomPatch) -> Result<BroadcastRoom, MatchcastError> {
        self.store.update(&self.fixture_id, patch).await
    }

    /// Rewrite `updatedAt`; throttling slows the heartbeat down
    async fn heartbeat(&mut self) {
        match self.write_room(RoomPatch::Touch).await {
            Ok(room) => trace!("Heartbeat at {:?}", room.updated_at),
            Err(MatchcastError::WriteThrottled { retry_in, .. }) => {
                let next = (self.heartbeat_interval * 2).min(self.config.max_heartbeat_interval);
                warn!(
                    "Room writes throttled, heartbeat every {:?} instead of {:?}",
                    next, self.heartbeat_interval
                );
                self.heartbeat_interval = next;
                self.events.emit(BroadcasterEvent::WriteThrottled {
                    retry_in,
                    next_interval: next,
                });
            }
            Err(e) => {
                warn!("Heartbeat failed: {}", e);
                self.events.emit(BroadcasterEvent::Error {
                    error: e.to_string(),
                    recoverable: e.is_recoverable(),
                });
            }
        }
        self.next_heartbeat = Instant::now() + self.heartbeat_interval;
    }

    async fn on_message(&mut self, message: SignalingMessage) {
        match &message.payload {
            SignalPayload::ViewerRequest(_) => {
                let viewer = message.from.clone();
                self.on_viewer_request(viewer).await;
            }
            SignalPayload::Answer(answer) => {
                let answer = answer.clone();
                self.on_answer(&message.from, answer).await;
            }
            SignalPayload::IceCandidate(candidate) => {
                let candidate = candidate.clone();
                self.on_candidate(&message.from, candidate).await;
            }
            SignalPayload::Offer(_) => {
                debug!("Ignoring offer {} addressed to a camera", message.id);
            }
        }
        if let Err(e) = self.channel.delete(&self.fixture_id, message.id).await {
            warn!("Failed to delete message {}: {}", message.id, e);
        }
    }

    async fn on_viewer_request(&mut self, viewer: String) {
        let viewer_id = ViewerId::from(viewer.as_str());
        if self.using_fallback {
            debug!("Ignoring request from {} while in fallback", viewer);
            return;
        }
        if let Some(existing) = self.viewers.get(&viewer) {
            if !existing.peer.is_closed()
                && existing.created_at.elapsed() < self.config.request_debounce
            {
                debug!("Ignoring repeated request from {}", viewer);
                self.events
                    .emit(BroadcasterEvent::DuplicateRequestIgnored { viewer_id });
                return;
            }
        }
        if let Some(old) = self.viewers.remove(&viewer) {
            debug!("Replacing stale peer for {}", viewer);
            old.close();
        }

        match self.offer_to(&viewer).await {
            Ok(entry) => {
                self.viewers.insert(viewer.clone(), entry);
                info!("Offer sent to {}", viewer);
                self.events.emit(BroadcasterEvent::OfferSent { viewer_id });
            }
            Err(e) => {
                warn!("Could not offer to {}: {}", viewer, e);
                self.events.emit(BroadcasterEvent::Error {
                    error: e.to_string(),
                    recoverable: e.is_recoverable(),
                });
            }
        }
    }

    async fn offer_to(&mut self, viewer: &str) -> Result<ViewerPeer, MatchcastError> {
        let config = PeerConfig::new(self.config.ice_servers.clone(), viewer);
        let (peer, mut peer_events) = self.peers.create(&config)?;

        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.peer_tx.clone();
        let tag = viewer.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                let tagged = TaggedPeerEvent {
                    viewer: tag.clone(),
                    generation,
                    event,
                };
                if tx.send(tagged).is_err() {
                    break;
                }
            }
        });
        let entry = ViewerPeer {
            peer,
            generation,
            created_at: Instant::now(),
            answered: false,
            connected: false,
            forwarder,
        };

        match self.negotiate_offer(&entry.peer, viewer).await {
            Ok(()) => Ok(entry),
            Err(e) => {
                entry.close();
                Err(e)
            }
        }
    }

    async fn negotiate_offer(
        &self,
        peer: &Arc<dyn PeerConnection>,
        viewer: &str,
    ) -> Result<(), MatchcastError> {
        for track in &self.local_stream.tracks {
            peer.add_track(track.clone())?;
        }
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.channel
            .publish(&self.fixture_id, Signal::offer(&self.camera, viewer, offer))
            .await?;
        Ok(())
    }

    async fn on_answer(&mut self, viewer: &str, answer: SessionDescription) {
        let Some(entry) = self.viewers.get_mut(viewer) else {
            debug!("Ignoring answer from unknown viewer {}", viewer);
            return;
        };
        if entry.answered {
            debug!("Ignoring repeated answer from {}", viewer);
            return;
        }
        let applied = entry.peer.set_remote_description(answer).await;
        match applied {
            Ok(()) => {
                entry.answered = true;
                debug!("Applied answer from {}", viewer);
            }
            Err(e) => {
                warn!("Answer from {} rejected: {}", viewer, e);
                self.drop_viewer(viewer, &format!("answer rejected: {}", e));
            }
        }
    }

    async fn on_candidate(&mut self, viewer: &str, candidate: IceCandidate) {
        let Some(entry) = self.viewers.get(viewer) else {
            trace!("Discarding candidate from unknown viewer {}", viewer);
            return;
        };
        if entry.peer.is_closed() {
            trace!("Discarding candidate for closed peer of {}", viewer);
            return;
        }
        if let Err(e) = entry.peer.add_ice_candidate(candidate).await {
            debug!("Candidate from {} not applied: {}", viewer, e);
        }
    }

    async fn on_peer_event(&mut self, tagged: TaggedPeerEvent) {
        let TaggedPeerEvent {
            viewer,
            generation,
            event,
        } = tagged;
        let Some(entry) = self.viewers.get_mut(&viewer) else {
            trace!("Dropping event for departed viewer {}", viewer);
            return;
        };
        if entry.generation != generation {
            trace!("Dropping event from replaced peer of {}", viewer);
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let signal = Signal::ice_candidate(self.camera.as_str(), &viewer, candidate);
                if let Err(e) = self.channel.publish(&self.fixture_id, signal).await {
                    warn!("Failed to publish candidate for {}: {}", viewer, e);
                }
            }
            PeerEvent::StateChanged(PeerConnectionState::Connected) => {
                if !entry.connected {
                    entry.connected = true;
                    info!("✅ Viewer {} connected to {}", viewer, self.camera);
                    self.events.emit(BroadcasterEvent::ViewerConnected {
                        viewer_id: ViewerId::from(viewer.as_str()),
                    });
                }
            }
            PeerEvent::StateChanged(state) if state.is_terminal() => {
                self.drop_viewer(&viewer, &format!("peer {:?}", state).to_lowercase());
            }
            PeerEvent::StateChanged(state) => {
                trace!("Peer of {} is {:?}", viewer, state);
            }
            PeerEvent::Track(_) => {}
        }
    }

    fn drop_viewer(&mut self, viewer: &str, reason: &str) {
        if let Some(entry) = self.viewers.remove(viewer) {
            entry.close();
            debug!("Dropped viewer {}: {}", viewer, reason);
            self.events.emit(BroadcasterEvent::ViewerDropped {
                viewer_id: ViewerId::from(viewer),
                reason: reason.to_string(),
            });
        }
    }

    fn close_all_viewers(&mut self, reason: &str) {
        let viewers: Vec<String> = self.viewers.keys().cloned().collect();
        for viewer in viewers {
            self.drop_viewer(&viewer, reason);
        }
    }

    fn publish_status(&self) {
        let next = BroadcasterStatus {
            camera: self.camera.clone(),
            is_live: self.is_live,
            using_fallback: self.using_fallback,
            viewers: self.viewers.len(),
            connected_viewers: self.viewers.values().filter(|v| v.connected).count(),
            heartbeat_interval: self.heartbeat_interval,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
