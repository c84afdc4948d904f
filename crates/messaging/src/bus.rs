//! Bus client trait and an in-process implementation.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::{BusError, EventEnvelope, Result};

/// A stream of envelopes delivered to a subscription.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = EventEnvelope> + Send>>;

/// Publishes envelopes to the message broker.
///
/// Delivery is at-least-once: consumers must tolerate duplicates.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()>;
}

#[async_trait]
impl<T: MessageBus + ?Sized> MessageBus for Arc<T> {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        (**self).publish(envelope).await
    }
}

struct Subscriber {
    event_types: Vec<String>,
    sender: mpsc::UnboundedSender<EventEnvelope>,
}

impl Subscriber {
    fn wants(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type)
    }
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Subscriber>,
    published: Vec<EventEnvelope>,
}

/// In-process bus fanning out to typed subscriptions.
///
/// Each subscription is a queue; cloning a [`Subscription`] yields a
/// competing consumer on the same queue. Every accepted envelope is also kept
/// in a publish log for inspection.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<RwLock<BusState>>,
    failures_pending: Arc<AtomicUsize>,
}

impl InMemoryBus {
    /// Creates a new empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publish calls fail with `Unavailable`.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Opens a queue receiving the given event types (all types when empty).
    pub async fn subscribe(&self, event_types: &[&str]) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.write().await.subscribers.push(Subscriber {
            event_types: event_types.iter().map(|t| t.to_string()).collect(),
            sender,
        });
        Subscription {
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Returns every envelope accepted so far, in publish order.
    pub async fn published(&self) -> Vec<EventEnvelope> {
        self.state.read().await.published.clone()
    }

    /// Returns accepted envelopes of one type.
    pub async fn published_of_type(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.state
            .read()
            .await
            .published
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        if self.take_injected_failure() {
            metrics::counter!("bus_publish_failures_total").increment(1);
            return Err(BusError::Unavailable("injected publish failure".to_string()));
        }

        let mut state = self.state.write().await;
        state
            .subscribers
            .retain(|s| !s.wants(&envelope.event_type) || s.sender.send(envelope.clone()).is_ok());

        tracing::trace!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            "envelope published"
        );
        state.published.push(envelope);
        Ok(())
    }
}

/// A queue of envelopes; clones share the queue.
#[derive(Clone)]
pub struct Subscription {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<EventEnvelope>>>,
}

impl Subscription {
    /// Waits for the next envelope. Returns None once the bus is dropped.
    pub async fn recv(&self) -> Option<EventEnvelope> {
        self.receiver.lock().await.recv().await
    }

    /// Returns the next queued envelope without waiting.
    ///
    /// Returns None when the queue is empty or another consumer is receiving.
    pub fn try_recv(&self) -> Option<EventEnvelope> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }

    /// Converts the subscription into a stream.
    pub fn into_stream(self) -> EnvelopeStream {
        Box::pin(futures_util::stream::unfold(self, |sub| async move {
            sub.recv().await.map(|envelope| (envelope, sub))
        }))
    }
}
