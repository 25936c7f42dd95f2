//! In-process signaling channel and room store

use crate::channel::{RoomStore, RoomWatch, SignalingChannel, Subscription};
use crate::protocol::{MessageId, Signal, SignalingMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use matchcast_core::{BroadcastRoom, FixtureId, MatchcastError, RoomPatch};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Cap on room document writes per fixture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteLimit {
    /// Writes allowed per window
    pub max_writes: u32,
    /// Window length
    pub window: Duration,
}

impl WriteLimit {
    /// `max_writes` per `window`
    pub fn new(max_writes: u32, window: Duration) -> Self {
        Self { max_writes, window }
    }
}

impl Default for WriteLimit {
    fn default() -> Self {
        Self {
            max_writes: 1,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    count: u32,
}

/// Counters for one room's mailbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStats {
    /// Messages waiting to be consumed
    pub pending: usize,
    /// Messages ever published
    pub published: u64,
    /// Messages removed by `delete`
    pub deleted: u64,
    /// `delete` calls for messages that were already gone
    pub missed_deletes: u64,
    /// Live subscriptions
    pub subscribers: usize,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    recipient: String,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

#[derive(Debug, Default)]
struct Mailbox {
    next_id: u64,
    messages: BTreeMap<MessageId, SignalingMessage>,
    subscribers: Vec<Subscriber>,
    deleted: u64,
    missed_deletes: u64,
}

#[derive(Debug, Default)]
struct BackendInner {
    mailboxes: DashMap<FixtureId, Arc<Mutex<Mailbox>>>,
    rooms: DashMap<FixtureId, watch::Sender<Option<BroadcastRoom>>>,
    windows: DashMap<FixtureId, RateWindow>,
    write_limit: Option<WriteLimit>,
    next_subscription: AtomicU64,
}

/// Mailbox and room store living in this process
///
/// Cheap to clone; clones share state. Serves as the backend of a
/// [`RelayServer`](crate::RelayServer) and as the test double for both
/// connection managers.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl MemoryBackend {
    /// Backend without write limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that rejects room writes beyond `limit`
    pub fn with_write_limit(limit: WriteLimit) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                write_limit: Some(limit),
                ..Default::default()
            }),
        }
    }

    /// Messages of a room still waiting to be consumed, in order
    pub fn pending(&self, fixture_id: &FixtureId) -> Vec<SignalingMessage> {
        self.mailbox(fixture_id)
            .lock()
            .messages
            .values()
            .cloned()
            .collect()
    }

    /// Counters for a room's mailbox
    pub fn stats(&self, fixture_id: &FixtureId) -> MailboxStats {
        let mailbox = self.mailbox(fixture_id);
        let mailbox = mailbox.lock();
        MailboxStats {
            pending: mailbox.messages.len(),
            published: mailbox.next_id,
            deleted: mailbox.deleted,
            missed_deletes: mailbox.missed_deletes,
            subscribers: mailbox.subscribers.len(),
        }
    }

    fn mailbox(&self, fixture_id: &FixtureId) -> Arc<Mutex<Mailbox>> {
        self.inner
            .mailboxes
            .entry(fixture_id.clone())
            .or_default()
            .clone()
    }

    fn room_sender(&self, fixture_id: &FixtureId) -> watch::Sender<Option<BroadcastRoom>> {
        self.inner
            .rooms
            .entry(fixture_id.clone())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    fn check_write_limit(&self, fixture_id: &FixtureId) -> Result<(), MatchcastError> {
        let Some(limit) = self.inner.write_limit else {
            return Ok(());
        };
        let now = Instant::now();
        let mut window = self
            .inner
            .windows
            .entry(fixture_id.clone())
            .or_insert_with(|| RateWindow {
                started: now,
                count: 0,
            });
        let elapsed = now.duration_since(window.started);
        if elapsed >= limit.window {
            window.started = now;
            window.count = 0;
        }
        if window.count >= limit.max_writes {
            let retry_in = limit.window.saturating_sub(elapsed);
            warn!("Write throttled for {} (retry in {:?})", fixture_id, retry_in);
            return Err(MatchcastError::WriteThrottled {
                fixture_id: fixture_id.to_string(),
                retry_in,
            });
        }
        window.count += 1;
        Ok(())
    }
}

fn unregister(mailbox: Weak<Mutex<Mailbox>>, subscription_id: u64) {
    if let Some(mailbox) = mailbox.upgrade() {
        mailbox
            .lock()
            .subscribers
            .retain(|subscriber| subscriber.id != subscription_id);
    }
}

#[async_trait]
impl SignalingChannel for MemoryBackend {
    async fn publish(
        &self,
        fixture_id: &FixtureId,
        signal: Signal,
    ) -> Result<MessageId, MatchcastError> {
        let mailbox = self.mailbox(fixture_id);
        let mut mailbox = mailbox.lock();
        mailbox.next_id += 1;
        let id = MessageId(mailbox.next_id);
        let message = SignalingMessage::published(id, fixture_id.clone(), signal);
        trace!(
            "Publish {} {} {} -> {}",
            id,
            message.kind(),
            message.from,
            message.to
        );

        mailbox
            .subscribers
            .retain(|subscriber| {
                if subscriber.recipient == message.to {
                    subscriber.tx.send(message.clone()).is_ok()
                } else {
                    !subscriber.tx.is_closed()
                }
            });
        mailbox.messages.insert(id, message);
        Ok(id)
    }

    async fn subscribe(
        &self,
        fixture_id: &FixtureId,
        recipient: &str,
    ) -> Result<Subscription, MatchcastError> {
        let shared = self.mailbox(fixture_id);
        let id = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut mailbox = shared.lock();
            for message in mailbox.messages.values().filter(|m| m.to == recipient) {
                // Receiver is still in hand, cannot be closed
                let _ = tx.send(message.clone());
            }
            mailbox.subscribers.push(Subscriber {
                id,
                recipient: recipient.to_string(),
                tx,
            });
        }
        debug!("Subscribed {} to mailbox of {}", recipient, fixture_id);

        let weak = Arc::downgrade(&shared);
        Ok(Subscription::new(id, recipient, rx, move || {
            unregister(weak, id)
        }))
    }

    async fn delete(
        &self,
        fixture_id: &FixtureId,
        id: MessageId,
    ) -> Result<bool, MatchcastError> {
        let mailbox = self.mailbox(fixture_id);
        let mut mailbox = mailbox.lock();
        let existed = mailbox.messages.remove(&id).is_some();
        if existed {
            mailbox.deleted += 1;
        } else {
            mailbox.missed_deletes += 1;
        }
        Ok(existed)
    }

    async fn clear(&self, fixture_id: &FixtureId) -> Result<usize, MatchcastError> {
        let mailbox = self.mailbox(fixture_id);
        let mut mailbox = mailbox.lock();
        let removed = mailbox.messages.len();
        mailbox.messages.clear();
        debug!("Cleared {} pending messages of {}", removed, fixture_id);
        Ok(removed)
    }
}

#[async_trait]
impl RoomStore for MemoryBackend {
    async fn get(&self, fixture_id: &FixtureId) -> Result<Option<BroadcastRoom>, MatchcastError> {
        Ok(self.room_sender(fixture_id).borrow().clone())
    }

    async fn put(&self, room: BroadcastRoom) -> Result<(), MatchcastError> {
        self.check_write_limit(&room.fixture_id)?;
        let sender = self.room_sender(&room.fixture_id);
        sender.send_replace(Some(room));
        Ok(())
    }

    async fn watch(&self, fixture_id: &FixtureId) -> Result<RoomWatch, MatchcastError> {
        Ok(self.room_sender(fixture_id).subscribe())
    }

    async fn update(
        &self,
        fixture_id: &FixtureId,
        patch: RoomPatch,
    ) -> Result<BroadcastRoom, MatchcastError> {
        self.check_write_limit(fixture_id)?;
        let sender = self.room_sender(fixture_id);
        let mut updated = None;
        sender.send_modify(|slot| {
            let room = slot.get_or_insert_with(|| BroadcastRoom::new(fixture_id.clone()));
            patch.apply(room);
            room.touch();
            updated = Some(room.clone());
        });
        updated.ok_or_else(|| MatchcastError::RoomNotFound {
            fixture_id: fixture_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchcast_core::{CameraKey, SessionDescription, ViewerId};

    fn set_live(is_live: bool) -> RoomPatch {
        RoomPatch::SetLive {
            is_live,
            camera: CameraKey::from_id(1),
        }
    }

    fn fixture() -> FixtureId {
        FixtureId::new("fx-memory")
    }

    #[tokio::test]
    async fn test_subscription_only_sees_own_messages_in_order() {
        let backend = MemoryBackend::new();
        let camera = CameraKey::from_id(1);
        let viewer = ViewerId::generate();
        let mut sub = backend.subscribe(&fixture(), viewer.as_str()).await.unwrap();

        backend
            .publish(&fixture(), Signal::viewer_request(&viewer, &camera))
            .await
            .unwrap();
        let first = backend
            .publish(
                &fixture(),
                Signal::offer(&camera, viewer.as_str(), SessionDescription::offer("a")),
            )
            .await
            .unwrap();
        let second = backend
            .publish(
                &fixture(),
                Signal::offer(&camera, viewer.as_str(), SessionDescription::offer("b")),
            )
            .await
            .unwrap();

        assert_eq!(sub.recv().await.unwrap().id, first);
        assert_eq!(sub.recv().await.unwrap().id, second);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let backend = MemoryBackend::new();
        let viewer = ViewerId::generate();
        let mut sub = backend.subscribe(&fixture(), "camera1").await.unwrap();

        let mut next = tokio_test::task::spawn(sub.recv());
        tokio_test::assert_pending!(next.poll());

        backend
            .publish(
                &fixture(),
                Signal::viewer_request(&viewer, &CameraKey::from_id(1)),
            )
            .await
            .unwrap();
        assert!(next.is_woken());
        let message = tokio_test::assert_ready!(next.poll()).unwrap();
        assert_eq!(message.from, viewer.as_str());
    }

    #[tokio::test]
    async fn test_subscribe_replays_pending() {
        let backend = MemoryBackend::new();
        let viewer = ViewerId::generate();
        let camera = CameraKey::from_id(2);
        let id = backend
            .publish(&fixture(), Signal::viewer_request(&viewer, &camera))
            .await
            .unwrap();

        let mut sub = backend.subscribe(&fixture(), camera.as_str()).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_delete_counts_once() {
        let backend = MemoryBackend::new();
        let viewer = ViewerId::generate();
        let id = backend
            .publish(
                &fixture(),
                Signal::viewer_request(&viewer, &CameraKey::from_id(1)),
            )
            .await
            .unwrap();

        assert!(backend.delete(&fixture(), id).await.unwrap());
        assert!(!backend.delete(&fixture(), id).await.unwrap());

        let stats = backend.stats(&fixture());
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.missed_deletes, 1);
    }

    #[tokio::test]
    async fn test_cancelled_subscription_is_unregistered() {
        let backend = MemoryBackend::new();
        let mut sub = backend.subscribe(&fixture(), "camera1").await.unwrap();
        assert_eq!(backend.stats(&fixture()).subscribers, 1);
        sub.cancel();
        assert_eq!(backend.stats(&fixture()).subscribers, 0);
    }

    #[tokio::test]
    async fn test_room_update_creates_and_notifies() {
        let backend = MemoryBackend::new();
        let mut watch = backend.watch(&fixture()).await.unwrap();
        assert!(watch.borrow().is_none());

        let room = backend
            .update(&fixture(), set_live(true))
            .await
            .unwrap();
        assert!(room.is_live);
        assert!(room.updated_at.is_some());

        watch.changed().await.unwrap();
        assert!(watch.borrow().as_ref().unwrap().is_live);
    }

    #[tokio::test]
    async fn test_write_limit_throttles_room_writes() {
        let backend =
            MemoryBackend::with_write_limit(WriteLimit::new(2, Duration::from_secs(60)));
        for _ in 0..2 {
            backend
                .update(&fixture(), set_live(true))
                .await
                .unwrap();
        }
        let err = backend
            .update(&fixture(), set_live(false))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "WRITE_THROTTLED");
        assert!(backend.get(&fixture()).await.unwrap().unwrap().is_live);
    }
}
