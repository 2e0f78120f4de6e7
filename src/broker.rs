use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::protocol::SessionEvent;

/// Default per-subscriber queue depth.
///
/// A subscriber whose queue fills up is dropped rather than allowed to stall
/// the publisher or grow memory without bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub type SubscriberId = u64;

/// Per-session fan-out of [`SessionEvent`]s.
///
/// The broadcaster itself does no locking: it lives inside the session
/// state and every method is called with that state's write lock held, so
/// registration, log snapshots and delivery share one critical section.
/// Delivery only enqueues (`try_send`); the slow part, writing to the
/// network, happens in each subscriber's own task after the lock is gone.
#[derive(Debug)]
pub struct Broadcaster {
    label: String,
    subscribers: HashMap<SubscriberId, mpsc::Sender<SessionEvent>>,
    next_id: SubscriberId,
    capacity: usize,
    closed: bool,
}

impl Broadcaster {
    pub fn new(label: impl Into<String>, capacity: usize) -> Self {
        Self {
            label: label.into(),
            subscribers: HashMap::new(),
            next_id: 0,
            capacity: capacity.max(1),
            closed: false,
        }
    }

    /// Register a new subscriber and return its id and queue.
    ///
    /// Once the broadcaster is closed the returned queue is already closed:
    /// the receiver yields `None` immediately.
    pub fn subscribe(&mut self) -> (SubscriberId, mpsc::Receiver<SessionEvent>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.capacity);
        if !self.closed {
            self.subscribers.insert(id, tx);
        }
        (id, rx)
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Enqueue `event` for every subscriber and return how many accepted it.
    ///
    /// A subscriber whose queue is closed (connection gone) or full (client
    /// not keeping up) is removed. Neither case is an error for the caller.
    pub fn deliver(&mut self, event: &SessionEvent) -> usize {
        let label = &self.label;
        let before = self.subscribers.len();
        self.subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session = %label, subscriber = id, "subscriber queue full, dropping subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(session = %label, subscriber = id, "subscriber gone, removing");
                false
            }
        });
        let delivered = self.subscribers.len();
        if delivered < before {
            tracing::debug!(session = %label, dropped = before - delivered, "pruned subscribers");
        }
        delivered
    }

    /// Drop every subscriber queue and refuse new registrations.
    ///
    /// Queued events are still readable; receivers see `None` after them.
    pub fn close(&mut self) {
        self.closed = true;
        self.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
