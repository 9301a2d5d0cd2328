//! Broadcast channel for push observers
//!
//! Each observer owns a bounded queue. Publishing never waits: an observer
//! whose queue is closed is dropped silently, and one whose queue is full
//! is dropped with a warning (it reconnects and gets a fresh snapshot).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::ipc::protocol::PushMessage;

pub type SubscriberId = u64;

/// An observer's end of the channel
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<PushMessage>,
}

/// Registry of observers
pub struct Broadcaster {
    queue_capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<PushMessage>>>,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<PushMessage>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscribers().insert(id, tx);
        tracing::debug!(subscriber = id, "Observer subscribed");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers().remove(&id).is_some() {
            tracing::debug!(subscriber = id, "Observer unsubscribed");
        }
    }

    /// Queue `message` for every observer
    pub fn publish(&self, message: PushMessage) {
        self.subscribers().retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = id, "Dropping closed observer");
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, "Observer queue full, disconnecting it");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}
