//! Publishes queued outbox messages to the bus.

use std::time::Duration;

use chrono::Utc;
use messaging::MessageBus;
use tokio::sync::watch;

use crate::retry::RetryConfig;
use crate::store::{Result, SagaStore};

const DEFAULT_BATCH_SIZE: usize = 100;

/// Counts from one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    pub failed: usize,
}

/// Moves outbox rows onto the bus, oldest first.
///
/// A failed publish is rescheduled with backoff and retried forever;
/// consumers tolerate the duplicates and reordering this can produce.
pub struct OutboxRelay<S: SagaStore, B: MessageBus> {
    store: S,
    bus: B,
    retry: RetryConfig,
    batch_size: usize,
}

impl<S: SagaStore, B: MessageBus> OutboxRelay<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self {
            store,
            bus,
            retry: RetryConfig::unbounded(Duration::from_millis(500), Duration::from_secs(60)),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Publishes one batch of due messages, ending the batch at the first
    /// failure.
    ///
    /// The failed row waits for its `retry_at`, so later rows of the same
    /// saga can go out ahead of it on the next pass.
    #[tracing::instrument(skip(self))]
    pub async fn relay_once(&self) -> Result<RelayReport> {
        let now = Utc::now();
        let pending = self.store.pending_outbox(now, self.batch_size).await?;
        let mut report = RelayReport::default();

        for message in pending {
            let event_type = message.envelope.event_type.clone();
            match self.bus.publish(message.envelope).await {
                Ok(()) => {
                    self.store.mark_published(message.id).await?;
                    metrics::counter!("outbox_published_total", "event_type" => event_type)
                        .increment(1);
                    report.published += 1;
                }
                Err(e) => {
                    let attempts = message.attempts + 1;
                    let retry_at = now + self.retry.chrono_delay_for(attempts);
                    self.store
                        .record_publish_failure(message.id, &e.to_string(), retry_at)
                        .await?;
                    metrics::counter!("outbox_publish_failures_total").increment(1);
                    tracing::warn!(
                        outbox_id = message.id,
                        saga_id = %message.saga_id,
                        %event_type,
                        attempts,
                        error = %e,
                        "outbox publish failed"
                    );
                    report.failed += 1;
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Relays every `interval` until `shutdown` flips to true.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(?interval, "outbox relay started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // Drain backlogs without waiting for the next tick.
                    loop {
                        match self.relay_once().await {
                            Ok(report) if report.published == self.batch_size => continue,
                            Ok(_) => break,
                            Err(e) => {
                                tracing::error!(error = %e, "outbox relay pass failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
        tracing::info!("outbox relay stopped");
    }
}
