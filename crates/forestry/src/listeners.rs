//! 📣 Listeners: a shared set of channel senders that batches get fanned out to.
//!
//! Callers hand us the sending half of a bounded `async_channel`. Every worker
//! broadcasts into the same set, awaiting each send, so a slow listener slows
//! the workers down instead of letting memory balloon. Backpressure, the
//! polite way.
//!
//! A listener whose receiver was dropped is removed on the next broadcast.
//! Removing a listener that was never added is a no-op.

use std::sync::{Arc, PoisonError, RwLock};

use async_channel::{Receiver, Sender};
use tracing::debug;

/// 📣 The set of listeners for one event type. Clones share the same set.
#[derive(Debug)]
pub struct Listeners<T> {
    senders: Arc<RwLock<Vec<Sender<T>>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            senders: Arc::clone(&self.senders),
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            senders: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<T: Clone> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// ➕ Register a listener. Safe while workers are broadcasting.
    pub fn add(&self, sender: Sender<T>) {
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
    }

    /// ➖ Unregister a listener. Returns whether it was registered.
    pub fn remove(&self, sender: &Sender<T>) -> bool {
        let mut senders = self.senders.write().unwrap_or_else(PoisonError::into_inner);
        let before = senders.len();
        senders.retain(|s| !s.same_channel(sender));
        senders.len() != before
    }

    /// 📻 Register a fresh bounded channel and hand back its receiving half.
    pub fn subscribe(&self, capacity: usize) -> Receiver<T> {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        self.add(tx);
        rx
    }

    pub fn len(&self) -> usize {
        self.senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 📣 Deliver `item` to every listener, waiting on full channels.
    ///
    /// Returns how many listeners received it. Closed listeners are dropped from the set.
    pub async fn broadcast(&self, item: T) -> usize {
        // snapshot, so the lock is never held across an await
        let senders: Vec<Sender<T>> = self
            .senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut delivered = 0;
        for sender in &senders {
            match sender.send(item.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => {
                    debug!("📪 listener hung up, removing it from the guest list");
                    self.remove(sender);
                }
            }
        }
        delivered
    }

    /// 📨 Deliver without waiting. Full or closed listeners miss this one.
    pub fn try_broadcast(&self, item: T) -> usize {
        let senders: Vec<Sender<T>> = self
            .senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut delivered = 0;
        for sender in &senders {
            match sender.try_send(item.clone()) {
                Ok(()) => delivered += 1,
                Err(async_channel::TrySendError::Closed(_)) => {
                    self.remove(sender);
                }
                Err(async_channel::TrySendError::Full(_)) => {
                    debug!("📪 listener is full, this notification goes to the void");
                }
            }
        }
        delivered
    }
}
