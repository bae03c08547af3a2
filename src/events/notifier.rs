//! Event fan-out to live subscribers.
//!
//! Publishing never blocks: transitions go onto an unbounded channel drained
//! by one delivery worker, which keeps per-subscriber order equal to publish
//! order. Each subscriber has a bounded queue. Delivery uses `try_send`, so a
//! slow subscriber loses events instead of stalling the others; one that stays
//! full for [`MAX_CONSECUTIVE_FULL`] events in a row is dropped as dead.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;
use crate::storage::RetryPolicy;

use super::lookup::DependentLookup;
use super::{Notification, TaskEvent, TaskTransition};

/// Consecutive full-queue deliveries after which a subscriber is pruned.
pub const MAX_CONSECUTIVE_FULL: u32 = 8;

/// Identifier of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving end of a subscription. Its first item is always
/// [`Notification::Connected`].
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Notification>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next notification; `None` once unsubscribed or pruned
    /// and drained.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<Notification> {
        ReceiverStream::new(self.receiver)
    }
}

struct Subscriber {
    sender: mpsc::Sender<Notification>,
    consecutive_full: u32,
}

struct Registry {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
    metrics: MetricsCollector,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(&self, event: TaskEvent) {
        let mut subscribers = self.lock();
        let mut dropped = 0;

        subscribers.retain(|id, sub| {
            match sub.sender.try_send(Notification::Task(event.clone())) {
                Ok(()) => {
                    sub.consecutive_full = 0;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    sub.consecutive_full += 1;
                    if sub.consecutive_full >= MAX_CONSECUTIVE_FULL {
                        warn!(subscriber = %id, "Pruning subscriber with a full queue");
                        false
                    } else {
                        true
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped += 1;
                    debug!(subscriber = %id, "Pruning closed subscriber");
                    false
                }
            }
        });

        self.metrics.record_dropped_events(dropped);
        self.metrics.update_subscribers(subscribers.len());
    }
}

/// Publishes task events to subscribers.
///
/// Cloning yields another handle to the same subscriber set and worker. The
/// worker exits once every handle is dropped.
#[derive(Clone)]
pub struct EventNotifier {
    registry: Arc<Registry>,
    sender: mpsc::UnboundedSender<TaskTransition>,
}

impl fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("subscribers", &self.subscriber_count())
            .field("buffer", &self.registry.buffer)
            .finish()
    }
}

impl EventNotifier {
    /// Starts the delivery worker on the current tokio runtime.
    ///
    /// `buffer` is the queue capacity of each subscriber; `retry` bounds the
    /// dependent lookup performed for every event.
    pub fn spawn(buffer: usize, lookup: Arc<dyn DependentLookup>, retry: RetryPolicy) -> Self {
        let registry = Arc::new(Registry {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            metrics: MetricsCollector::new(),
        });
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(delivery_worker(
            Arc::clone(&registry),
            receiver,
            lookup,
            retry,
        ));

        Self { registry, sender }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.registry.buffer);
        // Capacity is at least one, so the marker always fits
        let _ = sender.try_send(Notification::Connected);

        let count = {
            let mut subscribers = self.registry.lock();
            subscribers.insert(
                id,
                Subscriber {
                    sender,
                    consecutive_full: 0,
                },
            );
            subscribers.len()
        };
        self.registry.metrics.update_subscribers(count);
        info!(subscriber = %id, subscribers = count, "Subscriber connected");

        Subscription { id, receiver }
    }

    /// Removes a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let (removed, count) = {
            let mut subscribers = self.registry.lock();
            let removed = subscribers.remove(&id).is_some();
            (removed, subscribers.len())
        };
        if removed {
            self.registry.metrics.update_subscribers(count);
            info!(subscriber = %id, subscribers = count, "Subscriber disconnected");
        }
        removed
    }

    /// Hands a transition to the delivery worker without waiting.
    pub fn publish(&self, transition: TaskTransition) {
        if self.sender.send(transition).is_err() {
            warn!("Event delivery worker has stopped; dropping event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }
}

async fn delivery_worker(
    registry: Arc<Registry>,
    mut receiver: mpsc::UnboundedReceiver<TaskTransition>,
    lookup: Arc<dyn DependentLookup>,
    retry: RetryPolicy,
) {
    while let Some(transition) = receiver.recv().await {
        let task_id = transition.task_id;
        let affected_entity_ids = match retry
            .run("dependent lookup", || lookup.dependents(task_id))
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(
                    task_id = %task_id,
                    error = %e,
                    "Dependent lookup failed; publishing without dependents"
                );
                Vec::new()
            }
        };

        registry.deliver(TaskEvent {
            task_id,
            status: transition.status,
            result_ref: transition.result_ref,
            affected_entity_ids,
        });
    }
    debug!("Event delivery worker stopped");
}
