//! WebSocket relay client
//!
//! [`RelayClient`] implements [`SignalingChannel`] and [`RoomStore`] on top
//! of a [`RelayServer`](crate::RelayServer) connection, so connection
//! managers run unchanged against a remote mailbox.

use crate::channel::{RoomStore, RoomWatch, SignalingChannel, Subscription};
use crate::protocol::{MessageId, RelayRequest, RelayResponse, Signal, SignalingMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use matchcast_core::{BroadcastRoom, FixtureId, MatchcastError, RoomPatch};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

/// Relay client settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9030`
    pub url: String,
    /// How long to wait for a reply before giving up
    pub request_timeout: Duration,
}

impl RelayConfig {
    /// Settings for `url` with default timeouts
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// What to wire up when a reply arrives, before the caller sees it
enum ReplyRoute {
    Plain,
    Subscription(mpsc::UnboundedSender<SignalingMessage>),
    SeedWatch,
}

struct PendingRequest {
    reply: oneshot::Sender<RelayResponse>,
    route: ReplyRoute,
}

#[derive(Default)]
struct ClientState {
    pending: DashMap<u64, PendingRequest>,
    subscriptions: DashMap<u64, mpsc::UnboundedSender<SignalingMessage>>,
    watches: DashMap<FixtureId, watch::Sender<Option<BroadcastRoom>>>,
}

impl ClientState {
    fn dispatch(&self, response: RelayResponse) {
        match response {
            RelayResponse::Message {
                subscription_id,
                message,
            } => {
                let delivered = self
                    .subscriptions
                    .get(&subscription_id)
                    .map(|tx| tx.send(message).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    self.subscriptions.remove(&subscription_id);
                }
            }
            RelayResponse::Room {
                request_id: None,
                fixture_id,
                room,
            } => {
                if let Some(tx) = self.watches.get(&fixture_id) {
                    tx.send_if_modified(|current| {
                        if *current == room {
                            return false;
                        }
                        *current = room;
                        true
                    });
                }
            }
            response => {
                let Some(request_id) = response.request_id() else {
                    warn!("Dropping uncorrelated relay frame: {:?}", response);
                    return;
                };
                let Some((_, pending)) = self.pending.remove(&request_id) else {
                    return;
                };
                match (&response, pending.route) {
                    (
                        RelayResponse::Subscribed {
                            subscription_id, ..
                        },
                        ReplyRoute::Subscription(tx),
                    ) => {
                        self.subscriptions.insert(*subscription_id, tx);
                    }
                    (
                        RelayResponse::Room {
                            fixture_id, room, ..
                        },
                        ReplyRoute::SeedWatch,
                    ) => {
                        // Receivers start at this value; only later pushes count as changes
                        if let Some(tx) = self.watches.get(fixture_id) {
                            tx.send_if_modified(|current| {
                                *current = room.clone();
                                false
                            });
                        }
                    }
                    _ => {}
                }
                let _ = pending.reply.send(response);
            }
        }
    }

    fn disconnect(&self) {
        self.pending.clear();
        self.subscriptions.clear();
        self.watches.clear();
    }
}

struct ClientInner {
    config: RelayConfig,
    outbound: mpsc::UnboundedSender<Message>,
    state: Arc<ClientState>,
    next_request: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Remote signaling channel and room store
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("url", &self.inner.config.url)
            .finish()
    }
}

impl RelayClient {
    /// Connect to a relay server
    pub async fn connect(config: RelayConfig) -> Result<Self, MatchcastError> {
        let (ws_stream, _) =
            connect_async(config.url.as_str())
                .await
                .map_err(|e| MatchcastError::Transport {
                    reason: format!("failed to connect to {}: {}", config.url, e),
                })?;
        debug!("Connected to relay {}", config.url);

        let (mut sink, mut incoming) = ws_stream.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
        let state = Arc::new(ClientState::default());

        let writer = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(e) = sink.send(frame).await {
                    error!("Failed to send relay frame: {}", e);
                    break;
                }
            }
        });

        let reader_state = state.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = incoming.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<RelayResponse>(&text) {
                            Ok(response) => reader_state.dispatch(response),
                            Err(e) => warn!("Invalid relay frame: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        error!("Relay connection error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            debug!("Relay connection closed");
            reader_state.disconnect();
        });

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                outbound,
                state,
                next_request: AtomicU64::new(1),
                tasks: Mutex::new(vec![writer, reader]),
            }),
        })
    }

    fn next_request_id(&self) -> u64 {
        self.inner.next_request.fetch_add(1, Ordering::SeqCst)
    }

    fn send_frame(&self, request: &RelayRequest) -> Result<(), MatchcastError> {
        let json = serde_json::to_string(request)?;
        self.inner
            .outbound
            .send(Message::Text(json))
            .map_err(|_| MatchcastError::ChannelClosed {
                channel: "relay".to_string(),
            })
    }

    async fn request(
        &self,
        build: impl FnOnce(u64) -> RelayRequest,
        route: ReplyRoute,
    ) -> Result<RelayResponse, MatchcastError> {
        let request_id = self.next_request_id();
        let request = build(request_id);
        let (reply, response) = oneshot::channel();
        self.inner
            .state
            .pending
            .insert(request_id, PendingRequest { reply, route });
        if let Err(e) = self.send_frame(&request) {
            self.inner.state.pending.remove(&request_id);
            return Err(e);
        }

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(RelayResponse::Error {
                error,
                error_code,
                retry_in_ms,
                ..
            })) => Err(remote_error(&request, error, &error_code, retry_in_ms)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MatchcastError::ChannelClosed {
                channel: "relay".to_string(),
            }),
            Err(_) => {
                self.inner.state.pending.remove(&request_id);
                Err(MatchcastError::Timeout {
                    operation: format!("relay request {}", request_id),
                    duration: timeout,
                })
            }
        }
    }
}

fn request_fixture(request: &RelayRequest) -> String {
    match request {
        RelayRequest::Publish { fixture_id, .. }
        | RelayRequest::Subscribe { fixture_id, .. }
        | RelayRequest::Delete { fixture_id, .. }
        | RelayRequest::Clear { fixture_id, .. }
        | RelayRequest::GetRoom { fixture_id, .. }
        | RelayRequest::UpdateRoom { fixture_id, .. }
        | RelayRequest::WatchRoom { fixture_id, .. } => fixture_id.to_string(),
        RelayRequest::PutRoom { room, .. } => room.fixture_id.to_string(),
        RelayRequest::Unsubscribe { .. } => String::new(),
    }
}

fn remote_error(
    request: &RelayRequest,
    error: String,
    error_code: &str,
    retry_in_ms: Option<u64>,
) -> MatchcastError {
    let fixture_id = request_fixture(request);
    match error_code {
        "WRITE_THROTTLED" => MatchcastError::WriteThrottled {
            fixture_id,
            retry_in: Duration::from_millis(retry_in_ms.unwrap_or(1000)),
        },
        "ROOM_NOT_FOUND" => MatchcastError::RoomNotFound { fixture_id },
        _ => MatchcastError::signaling(fixture_id, format!("{} ({})", error, error_code)),
    }
}

fn unexpected(response: RelayResponse) -> MatchcastError {
    MatchcastError::Signaling {
        fixture_id: String::new(),
        reason: format!("unexpected relay response: {:?}", response),
    }
}

#[async_trait]
impl SignalingChannel for RelayClient {
    async fn publish(
        &self,
        fixture_id: &FixtureId,
        signal: Signal,
    ) -> Result<MessageId, MatchcastError> {
        let fixture_id = fixture_id.clone();
        match self
            .request(
                |request_id| RelayRequest::Publish {
                    request_id,
                    fixture_id,
                    signal,
                },
                ReplyRoute::Plain,
            )
            .await?
        {
            RelayResponse::Published { message_id, .. } => Ok(message_id),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(
        &self,
        fixture_id: &FixtureId,
        recipient: &str,
    ) -> Result<Subscription, MatchcastError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let fixture = fixture_id.clone();
        let address = recipient.to_string();
        let response = self
            .request(
                |request_id| RelayRequest::Subscribe {
                    request_id,
                    fixture_id: fixture,
                    recipient: address,
                },
                ReplyRoute::Subscription(tx),
            )
            .await?;
        let RelayResponse::Subscribed {
            subscription_id, ..
        } = response
        else {
            return Err(unexpected(response));
        };

        let client = self.clone();
        Ok(Subscription::new(subscription_id, recipient, rx, move || {
            client.inner.state.subscriptions.remove(&subscription_id);
            let request_id = client.next_request_id();
            let unsubscribe = RelayRequest::Unsubscribe {
                request_id,
                subscription_id,
            };
            if let Err(e) = client.send_frame(&unsubscribe) {
                debug!("Unsubscribe {} not sent: {}", subscription_id, e);
            }
        }))
    }

    async fn delete(
        &self,
        fixture_id: &FixtureId,
        id: MessageId,
    ) -> Result<bool, MatchcastError> {
        let fixture_id = fixture_id.clone();
        match self
            .request(
                |request_id| RelayRequest::Delete {
                    request_id,
                    fixture_id,
                    message_id: id,
                },
                ReplyRoute::Plain,
            )
            .await?
        {
            RelayResponse::Deleted { existed, .. } => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    async fn clear(&self, fixture_id: &FixtureId) -> Result<usize, MatchcastError> {
        let fixture_id = fixture_id.clone();
        match self
            .request(
                |request_id| RelayRequest::Clear {
                    request_id,
                    fixture_id,
                },
                ReplyRoute::Plain,
            )
            .await?
        {
            RelayResponse::Cleared { removed, .. } => Ok(removed),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl RoomStore for RelayClient {
    async fn get(&self, fixture_id: &FixtureId) -> Result<Option<BroadcastRoom>, MatchcastError> {
        let fixture_id = fixture_id.clone();
        match self
            .request(
                |request_id| RelayRequest::GetRoom {
                    request_id,
                    fixture_id,
                },
                ReplyRoute::Plain,
            )
            .await?
        {
            RelayResponse::Room { room, .. } => Ok(room),
            other => Err(unexpected(other)),
        }
    }

    async fn put(&self, room: BroadcastRoom) -> Result<(), MatchcastError> {
        match self
            .request(
                |request_id| RelayRequest::PutRoom { request_id, room },
                ReplyRoute::Plain,
            )
            .await?
        {
            RelayResponse::Ack { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn update(
        &self,
        fixture_id: &FixtureId,
        patch: RoomPatch,
    ) -> Result<BroadcastRoom, MatchcastError> {
        let fixture = fixture_id.clone();
        match self
            .request(
                |request_id| RelayRequest::UpdateRoom {
                    request_id,
                    fixture_id: fixture,
                    patch,
                },
                ReplyRoute::Plain,
            )
            .await?
        {
            RelayResponse::Room {
                room: Some(room), ..
            } => Ok(room),
            RelayResponse::Room { room: None, .. } => Err(MatchcastError::RoomNotFound {
                fixture_id: fixture_id.to_string(),
            }),
            other => Err(unexpected(other)),
        }
    }

    async fn watch(&self, fixture_id: &FixtureId) -> Result<RoomWatch, MatchcastError> {
        if let Some(tx) = self.inner.state.watches.get(fixture_id) {
            return Ok(tx.subscribe());
        }
        let (tx, rx) = watch::channel(None);
        self.inner.state.watches.insert(fixture_id.clone(), tx);

        let fixture = fixture_id.clone();
        match self
            .request(
                |request_id| RelayRequest::WatchRoom {
                    request_id,
                    fixture_id: fixture,
                },
                ReplyRoute::SeedWatch,
            )
            .await
        {
            Ok(RelayResponse::Room { .. }) => Ok(rx),
            Ok(other) => {
                self.inner.state.watches.remove(fixture_id);
                Err(unexpected(other))
            }
            Err(e) => {
                self.inner.state.watches.remove(fixture_id);
                Err(e)
            }
        }
    }
}
