//! In-process fan-out of newly persisted messages.
//!
//! Every conversation id is a topic. A topic lives in the registry while at
//! least one [`Subscription`] holds it and is evicted when the last one is
//! released. Each topic owns its own lock, so publishing to one conversation
//! never waits on subscribers of another; the registry map itself is only
//! write-locked to add or evict a topic.
//!
//! Delivery goes through a bounded `tokio::sync::broadcast` ring per topic.
//! `publish` never waits: a subscriber that falls more than `capacity`
//! messages behind loses the oldest ones, gets a warning logged and keeps its
//! subscription.
//!
//! Every handle remembers which user opened it so [`Broadcaster::revoke`] can
//! end one user's handles on a topic without touching anyone else's.

use chat_protocol::Message;
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use uuid::Uuid;

pub const DEFAULT_CAPACITY: usize = 64;

/// Registry of live topics. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Registry>,
}

struct Registry {
    topics: RwLock<HashMap<Uuid, Arc<TopicSlot>>>,
    capacity: usize,
    next_id: AtomicU64,
}

struct TopicSlot {
    state: Mutex<TopicState>,
}

struct TopicState {
    /// `None` once the topic has been retired.
    tx: Option<broadcast::Sender<Message>>,
    handles: HashMap<u64, Handle>,
}

struct Handle {
    subscriber: Uuid,
    /// Fired by `revoke`; dropped silently on cancel or close.
    revoke: oneshot::Sender<()>,
}

impl TopicSlot {
    fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            state: Mutex::new(TopicState {
                tx: Some(tx),
                handles: HashMap::new(),
            }),
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("capacity", &self.inner.capacity)
            .field("topics", &self.topic_count())
            .finish()
    }
}

impl Broadcaster {
    /// Create a registry whose subscribers buffer at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Registry {
                topics: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `subscriber` on `topic`.
    ///
    /// Only messages published after this call returns are delivered.
    pub fn subscribe(&self, topic: Uuid, subscriber: Uuid) -> Subscription {
        loop {
            let slot = self.inner.slot_or_insert(topic);
            let mut state = slot.state.lock();
            let Some(rx) = state.tx.as_ref().map(broadcast::Sender::subscribe) else {
                drop(state);
                self.inner.evict(&topic, &slot);
                continue;
            };
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let (revoke, revoked) = oneshot::channel();
            state.handles.insert(id, Handle { subscriber, revoke });
            let count = state.handles.len();
            drop(state);
            tracing::debug!(%topic, %subscriber, handle = id, subscribers = count, "subscribed");
            return Subscription {
                topic,
                id,
                slot,
                registry: self.inner.clone(),
                rx: Some(BroadcastStream::new(rx)),
                revoked: Some(revoked),
            };
        }
    }

    /// Deliver `message` to everyone currently subscribed to `topic`.
    ///
    /// Returns how many subscribers it was queued for. Never fails: a topic
    /// without subscribers is a no-op.
    pub fn publish(&self, topic: Uuid, message: Message) -> usize {
        loop {
            let Some(slot) = self.inner.slot(&topic) else {
                tracing::trace!(%topic, "publish without subscribers");
                return 0;
            };
            let state = slot.state.lock();
            if state.tx.is_none() {
                drop(state);
                self.inner.evict(&topic, &slot);
                continue;
            }
            // send order under the topic lock is the delivery order
            let delivered = state
                .tx
                .as_ref()
                .map_or(0, |tx| tx.send(message).unwrap_or(0));
            drop(state);
            tracing::debug!(%topic, delivered, "published message");
            return delivered;
        }
    }

    /// End every live subscription on `topic`. Their streams finish after
    /// draining what was already queued.
    pub fn close(&self, topic: Uuid) {
        let slot = self.inner.topics.write().remove(&topic);
        if let Some(slot) = slot {
            let mut state = slot.state.lock();
            state.tx = None;
            let dropped = state.handles.len();
            state.handles.clear();
            tracing::info!(%topic, subscribers = dropped, "closed topic");
        }
    }

    /// End every handle `subscriber` holds on `topic`, immediately and without
    /// delivering anything still queued for them. Returns how many ended.
    pub fn revoke(&self, topic: &Uuid, subscriber: &Uuid) -> usize {
        let Some(slot) = self.inner.slot(topic) else {
            return 0;
        };
        let mut state = slot.state.lock();
        let ids: Vec<u64> = state
            .handles
            .iter()
            .filter(|(_, h)| h.subscriber == *subscriber)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(handle) = state.handles.remove(id) {
                // the receiver may already be gone
                let _ = handle.revoke.send(());
            }
        }
        let remaining = state.handles.len();
        if remaining == 0 {
            state.tx = None;
        }
        drop(state);
        if !ids.is_empty() {
            tracing::info!(%topic, %subscriber, revoked = ids.len(), remaining, "revoked subscriber");
        }
        if remaining == 0 {
            self.inner.evict(topic, &slot);
        }
        ids.len()
    }

    pub fn subscriber_count(&self, topic: &Uuid) -> usize {
        self.inner
            .slot(topic)
            .map(|slot| slot.state.lock().handles.len())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics.read().len()
    }
}

impl Registry {
    fn slot(&self, topic: &Uuid) -> Option<Arc<TopicSlot>> {
        self.topics.read().get(topic).cloned()
    }

    fn slot_or_insert(&self, topic: Uuid) -> Arc<TopicSlot> {
        if let Some(slot) = self.slot(&topic) {
            return slot;
        }
        self.topics
            .write()
            .entry(topic)
            .or_insert_with(|| Arc::new(TopicSlot::new(self.capacity)))
            .clone()
    }

    /// Remove `slot` from the map if it is still the one registered for `topic`.
    fn evict(&self, topic: &Uuid, slot: &Arc<TopicSlot>) {
        let mut topics = self.topics.write();
        if topics.get(topic).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            topics.remove(topic);
            tracing::debug!(%topic, "evicted empty topic");
        }
    }

    fn release(&self, topic: &Uuid, slot: &Arc<TopicSlot>, id: u64) {
        let mut state = slot.state.lock();
        if state.handles.remove(&id).is_none() {
            return;
        }
        let remaining = state.handles.len();
        if remaining == 0 {
            state.tx = None;
        }
        drop(state);
        tracing::debug!(%topic, handle = id, subscribers = remaining, "unsubscribed");
        if remaining == 0 {
            self.evict(topic, slot);
        }
    }
}

/// One live registration on a topic.
///
/// Yields messages until cancelled. Dropping the handle cancels it.
pub struct Subscription {
    topic: Uuid,
    id: u64,
    slot: Arc<TopicSlot>,
    registry: Arc<Registry>,
    rx: Option<BroadcastStream<Message>>,
    revoked: Option<oneshot::Receiver<()>>,
}

impl Subscription {
    pub fn topic(&self) -> Uuid {
        self.topic
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }

    /// Wait for the next message. `None` once cancelled or closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.next().await
    }

    /// Deregister from the topic. Safe to call more than once.
    pub fn cancel(&mut self) {
        if self.rx.take().is_some() {
            self.registry.release(&self.topic, &self.slot, self.id);
        }
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        let topic = self.topic;
        if let Some(signal) = self.revoked.as_mut() {
            match Pin::new(signal).poll(cx) {
                Poll::Ready(Ok(())) => {
                    // the registry already dropped this handle
                    self.revoked = None;
                    self.rx = None;
                    return Poll::Ready(None);
                }
                Poll::Ready(Err(_)) => self.revoked = None,
                Poll::Pending => {}
            }
        }
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(None);
        };
        loop {
            match rx.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(msg))) => return Poll::Ready(Some(msg)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    tracing::warn!(%topic, skipped, "subscriber lagged, dropped oldest messages");
                }
                Poll::Ready(None) => {
                    self.cancel();
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("handle", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
