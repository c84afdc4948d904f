//! Periodically drives sagas whose deadline has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::coordinator::{SagaCoordinator, SweepReport};
use crate::error::Result;
use crate::store::SagaStore;

const DEFAULT_BATCH_SIZE: usize = 100;

/// Re-issues retries, expires stuck steps and escalates slow compensations.
pub struct TimeoutSweeper<S: SagaStore> {
    coordinator: Arc<SagaCoordinator<S>>,
    batch_size: usize,
}

impl<S: SagaStore> TimeoutSweeper<S> {
    pub fn new(coordinator: Arc<SagaCoordinator<S>>) -> Self {
        Self {
            coordinator,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.coordinator.sweep(Utc::now(), self.batch_size).await
    }

    /// Sweeps every `interval` until `shutdown` flips to true.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(?interval, "timeout sweeper started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "sweep failed");
                    }
                }
            }
        }
        tracing::info!("timeout sweeper stopped");
    }
}
