//! Saga coordinator: loads sagas, runs the orchestrator and persists the
//! result with compare-and-swap.

use chrono::{DateTime, Utc};
use common::SagaId;
use messaging::{EventEnvelope, event_types};

use crate::config::SagaConfig;
use crate::error::{ProtocolError, Result, SagaError};
use crate::instance::{OrderPayload, OrderSaga};
use crate::messages::{
    PaymentSucceeded, PaymentWebhook, StepRejected, WebhookStatus, ensure_supported,
};
use crate::orchestrator::{
    CancelOutcome, Decision, DeadlineAction, IgnoreReason, Orchestrator, Transition,
};
use crate::order_purchase::{EVENT_VERSION, REASON_PAYMENT_DECLINED, WEBHOOK_SOURCE};
use crate::state::SagaState;
use crate::status::OrderStatus;
use crate::step::{StepName, parse_idempotency_key};
use crate::store::{SagaStore, StoreError};

/// What happened to an inbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The saga moved on; `state` is where it landed.
    Applied { state: SagaState },
    /// Duplicate, stale or out-of-order reply.
    Ignored(IgnoreReason),
    /// The envelope can never be applied. Drop it.
    Rejected(String),
    /// Infrastructure failure. Redeliver later.
    Deferred(String),
}

/// Counts from one sweeper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub reissued: usize,
    pub expired: usize,
    pub conflicts: usize,
}

enum SweepAction {
    Nothing,
    Reissued,
    Expire(EventEnvelope),
}

/// Drives order purchase sagas.
///
/// The coordinator is the only writer of saga records. Every write is a
/// compare-and-swap against the version that was read; on conflict the saga
/// is reloaded and the decision re-evaluated, a bounded number of times.
pub struct SagaCoordinator<S: SagaStore> {
    store: S,
    orchestrator: Orchestrator,
}

impl<S: SagaStore> SagaCoordinator<S> {
    /// Creates a new saga coordinator.
    pub fn new(store: S, config: SagaConfig) -> Self {
        Self {
            store,
            orchestrator: Orchestrator::new(config),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Creates a saga for a new order and queues its first command.
    #[tracing::instrument(
        skip(self, payload),
        fields(buyer_id = %payload.buyer_id, listing_id = %payload.listing_id)
    )]
    pub async fn start_saga(&self, payload: OrderPayload) -> Result<OrderSaga> {
        let Transition { saga, outbox, .. } =
            self.orchestrator.start(SagaId::new(), payload, Utc::now())?;
        self.store.create(&saga, outbox).await?;

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(saga_id = %saga.saga_id(), "saga started");
        Ok(saga)
    }

    pub async fn get_saga(&self, saga_id: SagaId) -> Result<Option<OrderSaga>> {
        Ok(self.store.load(saga_id).await?)
    }

    /// Buyer-facing status of an order.
    pub async fn order_status(&self, order_id: SagaId) -> Result<Option<OrderStatus>> {
        Ok(self
            .store
            .load(order_id)
            .await?
            .as_ref()
            .map(OrderStatus::from))
    }

    /// Applies a reply envelope to its saga.
    ///
    /// Never fails: errors are classified into `Rejected` (drop) and
    /// `Deferred` (redeliver) so the caller knows what to do with the message.
    pub async fn handle(&self, envelope: &EventEnvelope) -> HandleOutcome {
        match self.handle_at(envelope, Utc::now()).await {
            Ok(outcome) => outcome,
            Err(e) => classify(envelope, e),
        }
    }

    #[tracing::instrument(
        skip(self, envelope),
        fields(event_type = %envelope.event_type, event_id = %envelope.event_id)
    )]
    async fn handle_at(
        &self,
        envelope: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<HandleOutcome> {
        ensure_supported(envelope)?;
        let saga_id = envelope
            .correlation_id
            .map(SagaId::from_uuid)
            .ok_or_else(|| ProtocolError::MissingCorrelation(envelope.event_id.to_string()))?;

        let outcome = self
            .update(saga_id, now, |saga, now| {
                match self.orchestrator.handle(saga, envelope, now)? {
                    Decision::Ignored(reason) => Ok((HandleOutcome::Ignored(reason), None)),
                    Decision::Transition(transition) => Ok((
                        HandleOutcome::Applied {
                            state: transition.saga.state(),
                        },
                        Some(transition),
                    )),
                }
            })
            .await?;

        if let HandleOutcome::Ignored(reason) = outcome {
            metrics::counter!("saga_events_ignored_total", "reason" => reason.as_str())
                .increment(1);
            tracing::info!(%saga_id, %reason, "reply ignored");
        }
        Ok(outcome)
    }

    /// Applies a buyer's cancellation request.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, saga_id: SagaId) -> Result<CancelOutcome> {
        self.update(saga_id, Utc::now(), |saga, now| {
            self.orchestrator.cancel(saga, now)
        })
        .await
    }

    /// Resolves an asynchronous charge confirmation into a payment reply.
    ///
    /// The webhook names the charge by its idempotency key; the reply is
    /// caused by the command issued under that key, so the usual
    /// duplicate and staleness checks apply.
    #[tracing::instrument(skip(self, webhook), fields(idempotency_key = %webhook.idempotency_key))]
    pub async fn handle_payment_webhook(&self, webhook: PaymentWebhook) -> Result<HandleOutcome> {
        let (saga_id, step, _) = parse_idempotency_key(&webhook.idempotency_key)
            .ok_or_else(|| SagaError::InvalidWebhook("malformed idempotency key".to_string()))?;
        if step != StepName::Payment {
            return Err(SagaError::InvalidWebhook(format!(
                "key belongs to step {step}, not {}",
                StepName::Payment
            )));
        }

        let saga = self
            .store
            .load(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;
        let command = saga
            .steps()
            .iter()
            .filter(|s| s.name == StepName::Payment)
            .find_map(|s| s.command_for_key(&webhook.idempotency_key))
            .ok_or_else(|| SagaError::InvalidWebhook("no charge issued under key".to_string()))?;

        let builder = match webhook.status {
            WebhookStatus::Succeeded => {
                let payment_id = webhook.payment_id.ok_or_else(|| {
                    SagaError::InvalidWebhook("payment_id required on success".to_string())
                })?;
                EventEnvelope::builder(event_types::PAYMENT_SUCCEEDED, EVENT_VERSION)
                    .data(&PaymentSucceeded { payment_id })?
            }
            WebhookStatus::Failed => {
                let reason = webhook
                    .reason
                    .unwrap_or_else(|| "declined by provider".to_string());
                EventEnvelope::builder(event_types::PAYMENT_FAILED, EVENT_VERSION)
                    .data(&StepRejected::new(REASON_PAYMENT_DECLINED, reason))?
            }
        };
        let envelope = builder
            .source(WEBHOOK_SOURCE)
            .correlation_id(saga_id)
            .causation_id(command.command_id)
            .build();

        self.handle_at(&envelope, Utc::now()).await
    }

    /// Looks at up to `limit` sagas whose deadline is at or before `now`.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>, limit: usize) -> Result<SweepReport> {
        let due = self.store.find_due(now, limit).await?;
        let mut report = SweepReport {
            examined: due.len(),
            ..SweepReport::default()
        };

        for saga in due {
            let saga_id = saga.saga_id();
            match self.sweep_one(saga_id, now).await {
                Ok(SweepAction::Nothing) => {}
                Ok(SweepAction::Reissued) => report.reissued += 1,
                Ok(SweepAction::Expire(failure)) => match self.handle_at(&failure, now).await {
                    Ok(_) => report.expired += 1,
                    Err(e) if e.is_conflict() => report.conflicts += 1,
                    Err(e) => tracing::warn!(%saga_id, error = %e, "failed to expire step"),
                },
                Err(e) if e.is_conflict() => report.conflicts += 1,
                Err(e) => tracing::warn!(%saga_id, error = %e, "failed to sweep saga"),
            }
        }

        if report.reissued + report.expired > 0 {
            tracing::info!(
                examined = report.examined,
                reissued = report.reissued,
                expired = report.expired,
                "sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_one(&self, saga_id: SagaId, now: DateTime<Utc>) -> Result<SweepAction> {
        self.update(saga_id, now, |saga, now| {
            Ok(match self.orchestrator.on_deadline(saga, now)? {
                None => (SweepAction::Nothing, None),
                Some(DeadlineAction::Reissue(transition)) => {
                    (SweepAction::Reissued, Some(transition))
                }
                Some(DeadlineAction::Expire(failure)) => (SweepAction::Expire(failure), None),
            })
        })
        .await
    }

    /// Load, decide, compare-and-swap; reload and decide again on conflict.
    async fn update<T, F>(&self, saga_id: SagaId, now: DateTime<Utc>, mut decide: F) -> Result<T>
    where
        F: FnMut(&OrderSaga, DateTime<Utc>) -> Result<(T, Option<Transition>)>,
    {
        let max_attempts = self.orchestrator.config().conflict_retries.max(1);
        let mut attempt = 1;
        loop {
            let current = self
                .store
                .load(saga_id)
                .await?
                .ok_or(SagaError::NotFound(saga_id))?;
            let (value, transition) = decide(&current, now)?;
            let Some(Transition {
                saga,
                outbox,
                escalated,
            }) = transition
            else {
                return Ok(value);
            };

            match self
                .store
                .compare_and_swap(&saga, current.version(), outbox)
                .await
            {
                Ok(()) => {
                    observe(&current, &saga, &escalated);
                    return Ok(value);
                }
                Err(StoreError::ConcurrencyConflict { .. }) if attempt < max_attempts => {
                    metrics::counter!("saga_cas_conflicts_total").increment(1);
                    tracing::debug!(%saga_id, attempt, "lost compare-and-swap, re-evaluating");
                    attempt += 1;
                }
                Err(e) => {
                    if matches!(e, StoreError::ConcurrencyConflict { .. }) {
                        metrics::counter!("saga_cas_conflicts_total").increment(1);
                    }
                    return Err(e.into());
                }
            }
        }
    }
}

fn classify(envelope: &EventEnvelope, error: SagaError) -> HandleOutcome {
    match error {
        SagaError::Store(e) => {
            tracing::warn!(
                event_id = %envelope.event_id,
                error = %e,
                "store unavailable, deferring reply"
            );
            HandleOutcome::Deferred(e.to_string())
        }
        e => {
            tracing::warn!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                error = %e,
                "dropping reply"
            );
            HandleOutcome::Rejected(e.to_string())
        }
    }
}

/// Logs and records metrics for a persisted transition.
fn observe(before: &OrderSaga, after: &OrderSaga, escalated: &[StepName]) {
    let saga_id = after.saga_id();
    if before.state() != after.state() {
        tracing::info!(
            %saga_id,
            from = %before.state(),
            to = %after.state(),
            "saga transitioned"
        );
        match after.state() {
            SagaState::Completed => {
                metrics::counter!("saga_completed").increment(1);
                record_duration(after);
            }
            SagaState::Failed => {
                let reason = after
                    .failure()
                    .map(|f| f.reason_code.clone())
                    .unwrap_or_default();
                metrics::counter!("saga_failed", "reason" => reason.clone()).increment(1);
                record_duration(after);
                tracing::info!(%saga_id, %reason, "saga failed");
            }
            _ => {}
        }
    }

    for step in escalated {
        metrics::counter!("saga_compensation_escalations_total", "step" => step.as_str())
            .increment(1);
        tracing::error!(
            %saga_id,
            step = %step,
            "compensation exceeded its ceiling, manual intervention required"
        );
    }
}

fn record_duration(saga: &OrderSaga) {
    let elapsed = saga.updated_at() - saga.created_at();
    metrics::histogram!("saga_duration_seconds")
        .record(elapsed.num_milliseconds() as f64 / 1000.0);
}
