//! Competing consumers of saga reply events.

use std::sync::Arc;
use std::time::Duration;

use messaging::{EventEnvelope, Subscription};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::coordinator::{HandleOutcome, SagaCoordinator};
use crate::store::SagaStore;

/// Feeds replies from a shared subscription into the coordinator.
///
/// Several workers may share one subscription; per-saga compare-and-swap
/// keeps them from stepping on each other.
pub struct SagaWorker<S: SagaStore> {
    id: usize,
    coordinator: Arc<SagaCoordinator<S>>,
    subscription: Subscription,
    redelivery_delay: Duration,
    max_redeliveries: u32,
}

impl<S: SagaStore + 'static> SagaWorker<S> {
    pub fn new(
        id: usize,
        coordinator: Arc<SagaCoordinator<S>>,
        subscription: Subscription,
        redelivery_delay: Duration,
    ) -> Self {
        Self {
            id,
            coordinator,
            subscription,
            redelivery_delay,
            max_redeliveries: 5,
        }
    }

    /// Handles one envelope, redelivering it while the outcome is `Deferred`.
    pub async fn process(&self, envelope: &EventEnvelope) -> HandleOutcome {
        let mut redeliveries = 0;
        loop {
            let outcome = self.coordinator.handle(envelope).await;
            match outcome {
                HandleOutcome::Deferred(ref reason) if redeliveries < self.max_redeliveries => {
                    redeliveries += 1;
                    tracing::warn!(
                        worker = self.id,
                        event_id = %envelope.event_id,
                        redeliveries,
                        %reason,
                        "reply deferred, redelivering"
                    );
                    tokio::time::sleep(self.redelivery_delay).await;
                }
                outcome => return outcome,
            }
        }
    }

    /// Consumes replies until the bus closes or `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(worker = self.id, "saga worker started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = self.subscription.recv() => {
                    let Some(envelope) = next else { break };
                    if let HandleOutcome::Deferred(reason) = self.process(&envelope).await {
                        // The sweeper re-issues the step, which produces a fresh reply.
                        tracing::error!(
                            worker = self.id,
                            event_id = %envelope.event_id,
                            %reason,
                            "giving up on reply"
                        );
                    }
                }
            }
        }
        tracing::debug!(worker = self.id, "saga worker stopped");
    }
}

/// Spawns `count` workers competing on `subscription`.
pub fn spawn_workers<S: SagaStore + 'static>(
    count: usize,
    coordinator: Arc<SagaCoordinator<S>>,
    subscription: Subscription,
    redelivery_delay: Duration,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|id| {
            let worker = SagaWorker::new(
                id,
                Arc::clone(&coordinator),
                subscription.clone(),
                redelivery_delay,
            );
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
