//! Signaling channel and room store contracts
//!
//! Both sides of a broadcast only ever talk to these two traits. The
//! in-process [`MemoryBackend`](crate::MemoryBackend) and the WebSocket
//! [`RelayClient`](crate::RelayClient) implement them.

use crate::protocol::{MessageId, Signal, SignalingMessage};
use async_trait::async_trait;
use matchcast_core::{BroadcastRoom, FixtureId, MatchcastError, RoomPatch};
use std::fmt;
use tokio::sync::{mpsc, watch};

/// Receiver of room document changes; `None` while the room does not exist
pub type RoomWatch = watch::Receiver<Option<BroadcastRoom>>;

type CancelFn = Box<dyn FnOnce() + Send + Sync>;

/// Live feed of messages addressed to one recipient
///
/// Messages arrive in publish order. Cancelling, explicitly or by dropping,
/// stops delivery at once: buffered messages are discarded and `recv`
/// returns `None` from then on.
pub struct Subscription {
    id: u64,
    recipient: String,
    receiver: mpsc::UnboundedReceiver<SignalingMessage>,
    on_cancel: Option<CancelFn>,
    cancelled: bool,
}

impl Subscription {
    /// Wrap a backend feed; `on_cancel` unregisters it from the backend
    pub fn new(
        id: u64,
        recipient: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<SignalingMessage>,
        on_cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            recipient: recipient.into(),
            receiver,
            on_cancel: Some(Box::new(on_cancel)),
            cancelled: false,
        }
    }

    /// Backend-assigned subscription id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address this subscription filters on
    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// Next message, or `None` once cancelled or the backend went away
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        if self.cancelled {
            return None;
        }
        self.receiver.recv().await
    }

    /// Next buffered message without waiting
    pub fn try_recv(&mut self) -> Option<SignalingMessage> {
        if self.cancelled {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    /// Stop delivery and unregister from the backend
    pub fn cancel(&mut self) {
        self.cancel_and_drain();
    }

    /// Cancel, handing back messages that were delivered but not yet read
    ///
    /// Consumers use this to delete what they will never handle.
    pub fn cancel_and_drain(&mut self) -> Vec<SignalingMessage> {
        if self.cancelled {
            return Vec::new();
        }
        self.cancelled = true;
        self.receiver.close();
        let mut unread = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            unread.push(message);
        }
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
        unread
    }

    /// Whether [`cancel`](Self::cancel) has run
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("recipient", &self.recipient)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

/// Room-scoped, append-only mailbox used for negotiation
#[async_trait]
pub trait SignalingChannel: Send + Sync + fmt::Debug {
    /// Append a signal; the channel assigns id and timestamp
    async fn publish(
        &self,
        fixture_id: &FixtureId,
        signal: Signal,
    ) -> Result<MessageId, MatchcastError>;

    /// Feed of pending and future messages addressed to `recipient`
    async fn subscribe(
        &self,
        fixture_id: &FixtureId,
        recipient: &str,
    ) -> Result<Subscription, MatchcastError>;

    /// Remove a consumed message; `false` if it was already gone
    async fn delete(&self, fixture_id: &FixtureId, id: MessageId)
        -> Result<bool, MatchcastError>;

    /// Drop every pending message of a room, returning how many were dropped
    async fn clear(&self, fixture_id: &FixtureId) -> Result<usize, MatchcastError>;
}

/// Store of broadcast room documents
#[async_trait]
pub trait RoomStore: Send + Sync + fmt::Debug {
    /// Current document
    async fn get(&self, fixture_id: &FixtureId) -> Result<Option<BroadcastRoom>, MatchcastError>;

    /// Replace the document
    async fn put(&self, room: BroadcastRoom) -> Result<(), MatchcastError>;

    /// Watch the document; the receiver starts at the current value
    async fn watch(&self, fixture_id: &FixtureId) -> Result<RoomWatch, MatchcastError>;

    /// Apply `patch`, creating the document if absent, and stamp it
    ///
    /// The default reads then writes, which loses concurrent edits; shared
    /// stores override it with an atomic update.
    async fn update(
        &self,
        fixture_id: &FixtureId,
        patch: RoomPatch,
    ) -> Result<BroadcastRoom, MatchcastError> {
        let mut room = self
            .get(fixture_id)
            .await?
            .unwrap_or_else(|| BroadcastRoom::new(fixture_id.clone()));
        patch.apply(&mut room);
        room.touch();
        self.put(room.clone()).await?;
        Ok(room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SignalPayload;
    use matchcast_core::{CameraKey, ViewerId};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn message(id: u64) -> SignalingMessage {
        SignalingMessage::published(
            MessageId(id),
            FixtureId::new("fx"),
            Signal::viewer_request(&ViewerId::generate(), &CameraKey::from_id(1)),
        )
    }

    #[tokio::test]
    async fn test_cancel_discards_buffered_messages() {
        let (tx, rx) = mpsc::unbounded_channel();
        let unregistered = Arc::new(AtomicBool::new(false));
        let flag = unregistered.clone();
        let mut sub = Subscription::new(1, "camera1", rx, move || {
            flag.store(true, Ordering::SeqCst);
        });

        tx.send(message(1)).unwrap();
        tx.send(message(2)).unwrap();
        assert_eq!(sub.recv().await.map(|m| m.id), Some(MessageId(1)));

        sub.cancel();
        assert!(sub.is_cancelled());
        assert!(unregistered.load(Ordering::SeqCst));
        assert!(sub.recv().await.is_none());
        assert!(tx.send(message(3)).is_err());
    }

    #[tokio::test]
    async fn test_cancel_and_drain_returns_unread() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Subscription::new(2, "viewer-1", rx, || {});

        tx.send(message(4)).unwrap();
        tx.send(message(5)).unwrap();
        let unread: Vec<_> = sub.cancel_and_drain().into_iter().map(|m| m.id).collect();
        assert_eq!(unread, vec![MessageId(4), MessageId(5)]);
        assert!(sub.cancel_and_drain().is_empty());
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let unregistered = Arc::new(AtomicBool::new(false));
        let flag = unregistered.clone();
        let sub = Subscription::new(7, "viewer-x", rx, move || {
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(sub.recipient(), "viewer-x");
        drop(sub);
        assert!(unregistered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_subscription_can_be_shared_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Subscription>();
    }

    #[test]
    fn test_message_kind_from_payload() {
        let msg = message(1);
        assert!(matches!(msg.payload, SignalPayload::ViewerRequest(_)));
        assert_eq!(msg.kind().to_string(), "viewer-request");
    }
}
