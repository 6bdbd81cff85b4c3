//! Lifecycle event fan-out.
//!
//! Every published event is stamped with a bus-wide sequence number and
//! delivered at most once to each subscriber attached at publish time. There
//! is no backlog: a late subscriber only sees events published after it
//! subscribed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use futures_util::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use mediaq_models::{TaskEvent, TaskEventEnvelope};

/// Events buffered per subscriber before the slowest one starts lagging.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Broadcast bus for task lifecycle events.
pub struct ProgressBus {
    sender: Mutex<Option<broadcast::Sender<TaskEventEnvelope>>>,
    seq: AtomicU64,
}

impl ProgressBus {
    /// Create a new bus.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            seq: AtomicU64::new(0),
        }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Returns the assigned sequence number, or `None` once the bus is closed.
    pub fn publish(&self, event: TaskEvent) -> Option<u64> {
        let guard = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        let sender = guard.as_ref()?;

        // Assigned under the lock so sequence order matches delivery order
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            seq,
            task_id = %event.task_id(),
            event = event.event_type().as_str(),
            "Publishing task event"
        );

        let envelope = TaskEventEnvelope {
            seq,
            timestamp: Utc::now(),
            event,
        };
        // No subscribers is not an error
        let _ = sender.send(envelope);
        Some(seq)
    }

    /// Attach a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let guard = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        Subscription {
            receiver: guard.as_ref().map(|s| s.subscribe()),
        }
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        let guard = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        guard.as_ref().map(|s| s.receiver_count()).unwrap_or(0)
    }

    /// Stop accepting events.
    ///
    /// Events already published are still delivered; afterwards every
    /// subscriber's `recv` yields `None`.
    pub fn close(&self) {
        let mut guard = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        if guard.take().is_some() {
            debug!("Progress bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_none()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// A subscriber's handle on the bus. Dropping it detaches the subscriber.
pub struct Subscription {
    receiver: Option<broadcast::Receiver<TaskEventEnvelope>>,
}

impl Subscription {
    /// Wait for the next event. `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<TaskEventEnvelope> {
        let receiver = self.receiver.as_mut()?;

        let next = loop {
            match receiver.recv().await {
                Ok(envelope) => break Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break None,
            }
        };

        if next.is_none() {
            self.receiver = None;
        }
        next
    }

    /// Take the next event if one is ready.
    pub fn try_recv(&mut self) -> Option<TaskEventEnvelope> {
        let receiver = self.receiver.as_mut()?;

        let (next, closed) = loop {
            match receiver.try_recv() {
                Ok(envelope) => break (Some(envelope), false),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged, events dropped");
                }
                Err(broadcast::error::TryRecvError::Empty) => break (None, false),
                Err(broadcast::error::TryRecvError::Closed) => break (None, true),
            }
        };

        if closed {
            self.receiver = None;
        }
        next
    }

    /// Detach from the bus.
    pub fn unsubscribe(mut self) {
        self.receiver.take();
    }

    /// Turn the subscription into a stream that ends when the bus closes.
    pub fn into_stream(self) -> impl Stream<Item = TaskEventEnvelope> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|envelope| (envelope, sub))
        })
    }

    /// Whether this handle can still receive events.
    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }
}
