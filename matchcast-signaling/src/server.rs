//! WebSocket relay server
//!
//! Exposes a [`MemoryBackend`] to remote peers. Each connection gets a
//! writer task fed by an unbounded queue, one forwarding task per
//! subscription and one per watched room; all of them are torn down when
//! the socket closes.

use crate::channel::{RoomStore, SignalingChannel};
use crate::memory::MemoryBackend;
use crate::protocol::{RelayRequest, RelayResponse};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use matchcast_core::{FixtureId, MatchcastError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

/// Relay server sharing one backend between all connected peers
#[derive(Debug, Clone)]
pub struct RelayServer {
    /// Address the server binds to
    pub bind_addr: SocketAddr,
    backend: MemoryBackend,
    connections: Arc<DashMap<String, JoinHandle<()>>>,
}

impl RelayServer {
    /// Create a relay server over `backend`
    pub fn new(bind_addr: SocketAddr, backend: MemoryBackend) -> Self {
        Self {
            bind_addr,
            backend,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Backend shared by all connections
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    /// Bind and serve until the listener fails
    pub async fn start(&self) -> Result<(), MatchcastError> {
        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            MatchcastError::ServerStartFailed {
                address: self.bind_addr,
                source: e.into(),
            }
        })?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), MatchcastError> {
        let local = listener
            .local_addr()
            .map_err(|e| MatchcastError::Transport {
                reason: e.to_string(),
            })?;
        tracing::info!("Relay server listening on {}", local);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!("New connection from {}", addr);
                    let connection_id = Uuid::new_v4().to_string();
                    let server = self.clone();
                    let id = connection_id.clone();
                    let handle = tokio::spawn(async move {
                        server.handle_connection(id.clone(), stream).await;
                        server.connections.remove(&id);
                    });
                    self.connections.insert(connection_id, handle);
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Number of open client connections
    pub fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .count()
    }

    /// Drop every client connection
    pub fn stop(&self) {
        for entry in self.connections.iter() {
            entry.value().abort();
        }
        self.connections.clear();
        tracing::info!("Relay server stopped");
    }

    async fn handle_connection(&self, connection_id: String, stream: TcpStream) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::error!("WebSocket handshake failed: {}", e);
                return;
            }
        };
        tracing::debug!("WebSocket connection established: {}", connection_id);

        let (mut sink, mut incoming) = ws_stream.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<RelayResponse>();
        let writer = tokio::spawn(async move {
            while let Some(response) = queue.recv().await {
                let text = match serde_json::to_string(&response) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to serialize response: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut session = Session {
            backend: self.backend.clone(),
            outbound,
            subscriptions: HashMap::new(),
            watches: HashMap::new(),
        };

        while let Some(frame) = incoming.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<RelayRequest>(&text) {
                    Ok(request) => session.handle(request).await,
                    Err(e) => {
                        tracing::warn!("Invalid message format: {}", e);
                        session.send_error(
                            None,
                            &MatchcastError::InvalidMessage {
                                message: text,
                                source: e.into(),
                            },
                        );
                    }
                },
                Ok(Message::Close(_)) => {
                    tracing::debug!("Connection {} closed", connection_id);
                    break;
                }
                Err(e) => {
                    tracing::error!("WebSocket error on connection {}: {}", connection_id, e);
                    break;
                }
                _ => {
                    // Ignore other message types (Binary, Ping, Pong)
                }
            }
        }

        drop(session);
        let _ = writer.await;
        tracing::debug!("Connection {} cleaned up", connection_id);
    }
}

/// Per-connection state
struct Session {
    backend: MemoryBackend,
    outbound: mpsc::UnboundedSender<RelayResponse>,
    subscriptions: HashMap<u64, JoinHandle<()>>,
    watches: HashMap<FixtureId, JoinHandle<()>>,
}

impl Session {
    fn send(&self, response: RelayResponse) {
        // Writer is gone only when the socket is already closing
        let _ = self.outbound.send(response);
    }

    fn send_error(&self, request_id: Option<u64>, error: &MatchcastError) {
        let retry_in_ms = match error {
            MatchcastError::WriteThrottled { retry_in, .. } => {
                Some(u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX))
            }
            _ => None,
        };
        self.send(RelayResponse::Error {
            request_id,
            error: error.to_string(),
            error_code: error.error_code(),
            retry_in_ms,
        });
    }

    async fn handle(&mut self, request: RelayRequest) {
        let request_id = request.request_id();
        if let Err(e) = self.dispatch(request).await {
            tracing::debug!("Request {} failed: {}", request_id, e);
            self.send_error(Some(request_id), &e);
        }
    }

    async fn dispatch(&mut self, request: RelayRequest) -> Result<(), MatchcastError> {
        match request {
            RelayRequest::Publish {
                request_id,
                fixture_id,
                signal,
            } => {
                let message_id = self.backend.publish(&fixture_id, signal).await?;
                self.send(RelayResponse::Published {
                    request_id,
                    message_id,
                });
            }
            RelayRequest::Subscribe {
                request_id,
                fixture_id,
                recipient,
            } => {
                let mut subscription = self.backend.subscribe(&fixture_id, &recipient).await?;
                let subscription_id = subscription.id();
                // Reply before any pushed message so the client knows the id
                self.send(RelayResponse::Subscribed {
                    request_id,
                    subscription_id,
                });
                let outbound = self.outbound.clone();
                let task = tokio::spawn(async move {
                    while let Some(message) = subscription.recv().await {
                        let push = RelayResponse::Message {
                            subscription_id,
                            message,
                        };
                        if outbound.send(push).is_err() {
                            break;
                        }
                    }
                });
                self.subscriptions.insert(subscription_id, task);
            }
            RelayRequest::Unsubscribe {
                request_id,
                subscription_id,
            } => {
                if let Some(task) = self.subscriptions.remove(&subscription_id) {
                    task.abort();
                }
                self.send(RelayResponse::Ack { request_id });
            }
            RelayRequest::Delete {
                request_id,
                fixture_id,
                message_id,
            } => {
                let existed = self.backend.delete(&fixture_id, message_id).await?;
                self.send(RelayResponse::Deleted {
                    request_id,
                    existed,
                });
            }
            RelayRequest::Clear {
                request_id,
                fixture_id,
            } => {
                let removed = self.backend.clear(&fixture_id).await?;
                self.send(RelayResponse::Cleared {
                    request_id,
                    removed,
                });
            }
            RelayRequest::GetRoom {
                request_id,
                fixture_id,
            } => {
                let room = self.backend.get(&fixture_id).await?;
                self.send(RelayResponse::Room {
                    request_id: Some(request_id),
                    fixture_id,
                    room,
                });
            }
            RelayRequest::PutRoom { request_id, room } => {
                self.backend.put(room).await?;
                self.send(RelayResponse::Ack { request_id });
            }
            RelayRequest::UpdateRoom {
                request_id,
                fixture_id,
                patch,
            } => {
                let room = self.backend.update(&fixture_id, patch).await?;
                self.send(RelayResponse::Room {
                    request_id: Some(request_id),
                    fixture_id,
                    room: Some(room),
                });
            }
            RelayRequest::WatchRoom {
                request_id,
                fixture_id,
            } => {
                let mut watch = self.backend.watch(&fixture_id).await?;
                let current = watch.borrow_and_update().clone();
                self.send(RelayResponse::Room {
                    request_id: Some(request_id),
                    fixture_id: fixture_id.clone(),
                    room: current,
                });
                if self.watches.contains_key(&fixture_id) {
                    return Ok(());
                }
                let outbound = self.outbound.clone();
                let watched = fixture_id.clone();
                let task = tokio::spawn(async move {
                    while watch.changed().await.is_ok() {
                        let room = watch.borrow_and_update().clone();
                        let push = RelayResponse::Room {
                            request_id: None,
                            fixture_id: watched.clone(),
                            room,
                        };
                        if outbound.send(push).is_err() {
                            break;
                        }
                    }
                });
                self.watches.insert(fixture_id, task);
            }
        }
        Ok(())
    }

}

// The socket closes only once every forwarding task has let go of the writer
impl Drop for Session {
    fn drop(&mut self) {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
        for (_, task) in self.watches.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session() -> (Session, mpsc::UnboundedReceiver<RelayResponse>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let session = Session {
            backend: MemoryBackend::new(),
            outbound,
            subscriptions: HashMap::new(),
            watches: HashMap::new(),
        };
        (session, rx)
    }

    #[test]
    fn test_throttle_delay_saturates() {
        let (session, mut rx) = session();
        session.send_error(
            Some(1),
            &MatchcastError::WriteThrottled {
                fixture_id: "fx".to_string(),
                retry_in: Duration::MAX,
            },
        );
        match rx.try_recv().unwrap() {
            RelayResponse::Error {
                retry_in_ms,
                error_code,
                ..
            } => {
                assert_eq!(retry_in_ms, Some(u64::MAX));
                assert_eq!(error_code, "WRITE_THROTTLED");
            }
            other => panic!("Expected error frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_room_replies_with_document() {
        let (mut session, mut rx) = session();
        session
            .handle(RelayRequest::UpdateRoom {
                request_id: 8,
                fixture_id: FixtureId::new("fx"),
                patch: matchcast_core::RoomPatch::SetActiveCamera { camera_id: 2 },
            })
            .await;
        match rx.try_recv().unwrap() {
            RelayResponse::Room {
                request_id, room, ..
            } => {
                assert_eq!(request_id, Some(8));
                assert_eq!(room.unwrap().active_camera_id, 2);
            }
            other => panic!("Expected room frame, got {:?}", other),
        }
    }
}
