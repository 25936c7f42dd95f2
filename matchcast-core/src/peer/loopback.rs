//! In-process peer connections
//!
//! Peers created by the same [`LoopbackNetwork`] find each other through a
//! `a=loopback-peer:` line embedded in their SDP. Once both ends hold a
//! local and a remote description they move to `Connected` and each side
//! receives the other's tracks, mirroring what a real engine reports after
//! an offer/answer exchange. Closing one end makes the other report
//! `Disconnected` at once and `Failed` after the network's disconnect
//! timeout. Tests use the network to inspect open peers and to inject
//! failures.

use super::{
    IceCandidate, MediaTrack, PeerConfig, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerEvent, PeerEvents, SessionDescription, TrackKind,
};
use crate::error::MatchcastError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const PEER_ATTR: &str = "a=loopback-peer:";
const TRACK_ATTR: &str = "a=track:";
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Operation that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackFailure {
    /// `create_offer`
    CreateOffer,
    /// `create_answer`
    CreateAnswer,
    /// `set_local_description`
    SetLocalDescription,
    /// `set_remote_description`
    SetRemoteDescription,
}

#[derive(Debug)]
struct NetworkInner {
    peers: DashMap<String, Arc<LoopbackPeer>>,
    failures: Mutex<Vec<LoopbackFailure>>,
    next_id: AtomicU64,
    disconnect_timeout: Duration,
}

impl Default for NetworkInner {
    fn default() -> Self {
        Self {
            peers: DashMap::new(),
            failures: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

impl NetworkInner {
    fn take_failure(&self, point: LoopbackFailure) -> bool {
        let mut failures = self.failures.lock();
        match failures.iter().position(|f| *f == point) {
            Some(index) => {
                failures.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Factory and registry for loopback peers
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Network whose peers fail `timeout` after their remote end closes
    pub fn with_disconnect_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                disconnect_timeout: timeout,
                ..NetworkInner::default()
            }),
        }
    }

    /// Make the next call to `point` on any peer fail
    pub fn fail_next(&self, point: LoopbackFailure) {
        self.inner.failures.lock().push(point);
    }

    /// Every peer created so far, oldest first
    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        let mut peers: Vec<_> = self
            .inner
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        peers.sort_by_key(|p| p.seq);
        peers
    }

    /// Peers created for talking to `remote` that are not closed
    pub fn open_peers_to(&self, remote: &str) -> Vec<Arc<LoopbackPeer>> {
        self.peers()
            .into_iter()
            .filter(|p| p.remote == remote && !p.is_closed())
            .collect()
    }

    /// Number of peers that are not closed
    pub fn open_peer_count(&self) -> usize {
        self.peers().iter().filter(|p| !p.is_closed()).count()
    }
}

impl PeerConnectionFactory for LoopbackNetwork {
    fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), MatchcastError> {
        let seq = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (events, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(LoopbackPeer {
            id: format!("pc-{}", seq),
            seq,
            remote: config.remote.clone(),
            network: Arc::downgrade(&self.inner),
            events,
            state: Mutex::new(PeerState::default()),
        });
        debug!("Created loopback peer {} for {}", peer.id, peer.remote);
        self.inner.peers.insert(peer.id.clone(), peer.clone());
        Ok((peer, rx))
    }
}

#[derive(Debug)]
struct PeerState {
    connection: PeerConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    local_tracks: Vec<MediaTrack>,
    remote_candidates: Vec<IceCandidate>,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            connection: PeerConnectionState::New,
            local: None,
            remote: None,
            local_tracks: Vec::new(),
            remote_candidates: Vec::new(),
        }
    }
}

/// One end of a loopback connection
#[derive(Debug)]
pub struct LoopbackPeer {
    id: String,
    seq: u64,
    remote: String,
    network: Weak<NetworkInner>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<PeerState>,
}

impl LoopbackPeer {
    /// Peer id embedded in its SDP
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote address the peer was created for
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Candidates applied with `add_ice_candidate`
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    /// Tracks attached with `add_track`
    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.state.lock().local_tracks.clone()
    }

    /// Simulate the engine giving up on this connection
    pub fn fail(&self) {
        self.transition(PeerConnectionState::Failed);
    }

    fn emit(&self, event: PeerEvent) {
        // The owner may already have dropped the feed during teardown
        let _ = self.events.send(event);
    }

    fn transition(&self, next: PeerConnectionState) {
        {
            let mut state = self.state.lock();
            if state.connection == next || state.connection == PeerConnectionState::Closed {
                return;
            }
            state.connection = next;
        }
        trace!("Loopback peer {} -> {:?}", self.id, next);
        self.emit(PeerEvent::StateChanged(next));
    }

    fn ensure_open(&self) -> Result<(), MatchcastError> {
        if self.is_closed() {
            return Err(MatchcastError::PeerConnectionClosed {
                peer: self.remote.clone(),
            });
        }
        Ok(())
    }

    fn check_failure(&self, point: LoopbackFailure) -> Result<(), MatchcastError> {
        let injected = self
            .network
            .upgrade()
            .map(|network| network.take_failure(point))
            .unwrap_or(false);
        if injected {
            return Err(MatchcastError::negotiation(
                self.remote.clone(),
                format!("injected failure in {:?}", point),
            ));
        }
        Ok(())
    }

    fn render_sdp(&self) -> String {
        let session: u64 = rand::thread_rng().gen();
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\n{}{}\r\n",
            session, PEER_ATTR, self.id
        );
        for track in self.state.lock().local_tracks.iter() {
            let kind = match track.kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!("{}{}:{}\r\n", TRACK_ATTR, kind, track.id));
        }
        sdp
    }

    /// Remote peer id if both descriptions are in place
    fn negotiated_with(&self) -> Option<String> {
        let state = self.state.lock();
        state.local.as_ref()?;
        let remote = state.remote.as_ref()?;
        parse_peer_id(&remote.sdp)
    }

    fn maybe_connect(&self) {
        let Some(other_id) = self.negotiated_with() else {
            return;
        };
        if self.state() == PeerConnectionState::New {
            self.transition(PeerConnectionState::Connecting);
        }
        let Some(network) = self.network.upgrade() else {
            return;
        };
        let Some(other) = network.peers.get(&other_id).map(|p| p.value().clone()) else {
            return;
        };
        let other_ready = other.negotiated_with().as_deref() == Some(self.id.as_str())
            && other.state() == PeerConnectionState::Connecting;
        if other_ready && self.state() == PeerConnectionState::Connecting {
            self.connect();
            other.connect();
        }
    }

    /// Tell the paired peer its remote end went away
    fn notify_remote_closed(&self) {
        let Some(network) = self.network.upgrade() else {
            return;
        };
        let Some(other_id) = self.negotiated_with() else {
            return;
        };
        let Some(other) = network.peers.get(&other_id).map(|p| p.value().clone()) else {
            return;
        };
        if other.is_closed() || other.negotiated_with().as_deref() != Some(self.id.as_str()) {
            return;
        }

        other.transition(PeerConnectionState::Disconnected);
        let timeout = network.disconnect_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let other = Arc::downgrade(&other);
                handle.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(other) = other.upgrade() {
                        other.transition(PeerConnectionState::Failed);
                    }
                });
            }
            Err(_) => other.transition(PeerConnectionState::Failed),
        }
    }

    fn connect(&self) {
        let tracks = {
            let state = self.state.lock();
            state
                .remote
                .as_ref()
                .map(|remote| parse_tracks(&remote.sdp))
                .unwrap_or_default()
        };
        self.transition(PeerConnectionState::Connected);
        for track in tracks {
            self.emit(PeerEvent::Track(track));
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription, MatchcastError> {
        self.ensure_open()?;
        self.check_failure(LoopbackFailure::CreateOffer)?;
        Ok(SessionDescription::offer(self.render_sdp()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MatchcastError> {
        self.ensure_open()?;
        self.check_failure(LoopbackFailure::CreateAnswer)?;
        if self.state.lock().remote.is_none() {
            return Err(MatchcastError::negotiation(
                self.remote.clone(),
                "cannot answer without a remote offer",
            ));
        }
        Ok(SessionDescription::answer(self.render_sdp()))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), MatchcastError> {
        self.ensure_open()?;
        self.check_failure(LoopbackFailure::SetLocalDescription)?;
        self.state.lock().local = Some(desc);

        let port: u16 = rand::thread_rng().gen_range(49152..65535);
        self.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
            port
        ))));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), MatchcastError> {
        self.ensure_open()?;
        self.check_failure(LoopbackFailure::SetRemoteDescription)?;
        if parse_peer_id(&desc.sdp).is_none() {
            return Err(MatchcastError::negotiation(
                self.remote.clone(),
                "malformed session description",
            ));
        }
        self.state.lock().remote = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MatchcastError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(MatchcastError::negotiation(
                self.remote.clone(),
                "candidate received before remote description",
            ));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    fn add_track(&self, track: MediaTrack) -> Result<(), MatchcastError> {
        self.ensure_open()?;
        self.state.lock().local_tracks.push(track);
        Ok(())
    }

    fn state(&self) -> PeerConnectionState {
        self.state.lock().connection
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.connection == PeerConnectionState::Closed {
                return;
            }
            state.connection = PeerConnectionState::Closed;
        }
        debug!("Closed loopback peer {}", self.id);
        self.notify_remote_closed();
    }
}

fn parse_peer_id(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(PEER_ATTR))
        .map(str::to_string)
}

fn parse_tracks(sdp: &str) -> Vec<MediaTrack> {
    sdp.lines()
        .filter_map(|line| line.trim().strip_prefix(TRACK_ATTR))
        .filter_map(|rest| {
            let (kind, id) = rest.split_once(':')?;
            match kind {
                "audio" => Some(MediaTrack::audio(id)),
                "video" => Some(MediaTrack::video(id)),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut PeerEvents) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both_sides() {
        let network = LoopbackNetwork::new();
        let (caster, mut caster_rx) = network
            .create(&PeerConfig::new(vec![], "viewer-a"))
            .unwrap();
        let (viewer, mut viewer_rx) = network
            .create(&PeerConfig::new(vec![], "camera1"))
            .unwrap();

        caster.add_track(MediaTrack::video("cam-video")).unwrap();
        let offer = caster.create_offer().await.unwrap();
        caster.set_local_description(offer.clone()).await.unwrap();

        viewer.set_remote_description(offer).await.unwrap();
        let answer = viewer.create_answer().await.unwrap();
        viewer.set_local_description(answer.clone()).await.unwrap();
        caster.set_remote_description(answer).await.unwrap();

        assert_eq!(caster.state(), PeerConnectionState::Connected);
        assert_eq!(viewer.state(), PeerConnectionState::Connected);

        let viewer_events = drain(&mut viewer_rx);
        assert!(viewer_events.contains(&PeerEvent::Track(MediaTrack::video("cam-video"))));
        assert!(viewer_events
            .iter()
            .any(|e| matches!(e, PeerEvent::LocalCandidate(_))));

        let caster_events = drain(&mut caster_rx);
        assert!(caster_events.contains(&PeerEvent::StateChanged(
            PeerConnectionState::Connected
        )));
    }

    #[tokio::test]
    async fn test_closed_peer_rejects_candidates() {
        let network = LoopbackNetwork::new();
        let (peer, _rx) = network.create(&PeerConfig::new(vec![], "camera1")).unwrap();
        peer.close();
        assert!(peer.is_closed());

        let result = peer.add_ice_candidate(IceCandidate::new("candidate:x")).await;
        assert!(matches!(
            result,
            Err(MatchcastError::PeerConnectionClosed { .. })
        ));
        assert_eq!(network.open_peer_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_the_remote_end() {
        let network = LoopbackNetwork::with_disconnect_timeout(Duration::from_millis(20));
        let (caster, mut caster_rx) = network
            .create(&PeerConfig::new(vec![], "viewer-a"))
            .unwrap();
        let (viewer, mut viewer_rx) = network
            .create(&PeerConfig::new(vec![], "camera1"))
            .unwrap();

        let offer = caster.create_offer().await.unwrap();
        caster.set_local_description(offer.clone()).await.unwrap();
        viewer.set_remote_description(offer).await.unwrap();
        let answer = viewer.create_answer().await.unwrap();
        viewer.set_local_description(answer.clone()).await.unwrap();
        caster.set_remote_description(answer).await.unwrap();
        drain(&mut caster_rx);
        drain(&mut viewer_rx);

        viewer.close();
        assert_eq!(caster.state(), PeerConnectionState::Disconnected);
        assert!(drain(&mut viewer_rx).is_empty());

        let failed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match caster_rx.recv().await {
                    Some(PeerEvent::StateChanged(PeerConnectionState::Failed)) => break,
                    Some(_) => continue,
                    None => panic!("event feed closed"),
                }
            }
        })
        .await;
        assert!(failed.is_ok(), "remote end never failed");

        // Closing the failed end does not bounce back to the closed one
        caster.close();
        assert_eq!(viewer.state(), PeerConnectionState::Closed);
    }

    #[test]
    fn test_close_without_runtime_fails_remote_at_once() {
        let network = LoopbackNetwork::new();
        let (caster, _caster_rx) = network
            .create(&PeerConfig::new(vec![], "viewer-a"))
            .unwrap();
        let (viewer, _viewer_rx) = network
            .create(&PeerConfig::new(vec![], "camera1"))
            .unwrap();

        tokio_test::block_on(async {
            let offer = caster.create_offer().await.unwrap();
            caster.set_local_description(offer.clone()).await.unwrap();
            viewer.set_remote_description(offer).await.unwrap();
            let answer = viewer.create_answer().await.unwrap();
            viewer.set_local_description(answer.clone()).await.unwrap();
            caster.set_remote_description(answer).await.unwrap();
        });

        caster.close();
        assert_eq!(viewer.state(), PeerConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let network = LoopbackNetwork::new();
        network.fail_next(LoopbackFailure::CreateOffer);
        let (peer, _rx) = network.create(&PeerConfig::new(vec![], "viewer")).unwrap();

        assert!(peer.create_offer().await.is_err());
        assert!(peer.create_offer().await.is_ok());
    }

    #[test]
    fn test_parse_tracks() {
        let sdp = "v=0\r\na=loopback-peer:pc-1\r\na=track:video:v1\r\na=track:audio:a1\r\n";
        assert_eq!(parse_peer_id(sdp).as_deref(), Some("pc-1"));
        assert_eq!(
            parse_tracks(sdp),
            vec![MediaTrack::video("v1"), MediaTrack::audio("a1")]
        );
    }
}
