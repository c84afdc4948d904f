//! The order purchase state machine.
//!
//! Everything here is pure: each operation takes the current saga, an input
//! and the current time, and returns the next saga together with the
//! envelopes to publish. Persisting the result (compare-and-swap plus outbox)
//! is the coordinator's job.

use chrono::{DateTime, Utc};
use common::SagaId;
use messaging::{EventEnvelope, EventId, event_types};
use serde::{Deserialize, Serialize};

use crate::compensation::{Compensation, CompensationRegistry};
use crate::config::SagaConfig;
use crate::error::{ProtocolError, Result, SagaError};
use crate::instance::{OrderPayload, OrderSaga};
use crate::messages::{
    ChargePayment, NotifyBuyer, OrderConfirmed, OrderFailed, OrderOutcome, ReserveInventory,
    SagaCreated, SagaReply, StepRejected,
};
use crate::order_purchase::{
    EVENT_VERSION, REASON_CANCELLED, REASON_TIMEOUT, SAGA_SOURCE, SWEEPER_SOURCE,
};
use crate::retry::RetryConfig;
use crate::state::SagaState;
use crate::step::{IssuedCommand, StepName, StepRecord, StepStatus, idempotency_key};

/// A saga update ready to be persisted.
#[derive(Debug, Clone)]
pub struct Transition {
    /// The saga after the update, version already bumped.
    pub saga: OrderSaga,
    /// Commands and events to publish once the update is stored.
    pub outbox: Vec<EventEnvelope>,
    /// Compensations that crossed the escalation ceiling in this update.
    pub escalated: Vec<StepName>,
}

/// Why an inbound reply caused no transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The saga already finished.
    Terminal,
    /// The reply's causation id names no outstanding command: a duplicate,
    /// a reply to a superseded step, or one that arrived out of order.
    NotOutstanding,
    /// The reply type belongs to a different step than the command it answers.
    WrongStep,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::Terminal => "terminal",
            IgnoreReason::NotOutstanding => "not_outstanding",
            IgnoreReason::WrongStep => "wrong_step",
        }
    }
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of applying a reply to a saga.
#[derive(Debug, Clone)]
pub enum Decision {
    Ignored(IgnoreReason),
    Transition(Transition),
}

/// What the timeout sweeper should do with a saga whose deadline passed.
#[derive(Debug, Clone)]
pub enum DeadlineAction {
    /// Re-issue the pending step (and record any escalation).
    Reissue(Transition),
    /// Give up on the pending forward step: feed this synthesized failure
    /// reply through the normal reply path.
    Expire(EventEnvelope),
}

/// Result of a buyer's cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Nothing was in flight; the saga failed immediately.
    Cancelled,
    /// A step is in flight; the saga compensates once it resolves.
    Accepted,
    /// The saga is already compensating.
    AlreadyFailing,
}

/// Work in progress on a cloned saga.
struct Draft {
    saga: OrderSaga,
    outbox: Vec<EventEnvelope>,
    escalated: Vec<StepName>,
    cause: Option<EventId>,
    now: DateTime<Utc>,
}

impl Draft {
    fn new(saga: OrderSaga, cause: Option<EventId>, now: DateTime<Utc>) -> Self {
        Self {
            saga,
            outbox: Vec::new(),
            escalated: Vec::new(),
            cause,
            now,
        }
    }
}

/// Applies the order purchase rules to saga records.
#[derive(Debug, Clone, Default)]
pub struct Orchestrator {
    config: SagaConfig,
    registry: CompensationRegistry,
}

impl Orchestrator {
    pub fn new(config: SagaConfig) -> Self {
        Self {
            config,
            registry: CompensationRegistry::new(),
        }
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Creates a saga and issues the reservation command.
    pub fn start(
        &self,
        saga_id: SagaId,
        payload: OrderPayload,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        payload.validate()?;
        let created = serde_json::to_value(SagaCreated {
            order_id: saga_id,
            buyer_id: payload.buyer_id.clone(),
            listing_id: payload.listing_id.clone(),
            quantity: payload.quantity,
            price: payload.price,
            currency: payload.currency.clone(),
        })?;

        let mut draft = Draft::new(OrderSaga::new(saga_id, payload, now), None, now);
        let created_id = self.emit(&mut draft, event_types::ORDER_SAGA_CREATED, created);
        draft.cause = Some(created_id);

        self.issue(&mut draft, StepName::Reservation)?;
        draft.saga.transition_to(SagaState::ReservationPending, now)?;
        Ok(self.seal(draft))
    }

    /// Applies one reply to the saga.
    ///
    /// The reply is accepted only if its causation id names an unanswered
    /// command of the pending step; anything else is ignored, which makes
    /// duplicates and stale replies harmless.
    pub fn handle(
        &self,
        saga: &OrderSaga,
        envelope: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let reply = SagaReply::decode(envelope)?;
        let cause = envelope
            .causation_id
            .ok_or_else(|| ProtocolError::MissingCausation(envelope.event_id.to_string()))?;

        if saga.state().is_terminal() {
            return Ok(Decision::Ignored(IgnoreReason::Terminal));
        }
        let Some(step) = saga.pending_step() else {
            return Ok(Decision::Ignored(IgnoreReason::NotOutstanding));
        };
        if step.outstanding(cause).is_none() {
            return Ok(Decision::Ignored(IgnoreReason::NotOutstanding));
        }
        if step.name != reply.step() {
            return Ok(Decision::Ignored(IgnoreReason::WrongStep));
        }

        let step_name = step.name;
        let mut draft = Draft::new(saga.clone(), Some(envelope.event_id), now);
        let record = pending_record(&mut draft, step_name)?;
        record.mark_answered(cause);

        match reply {
            SagaReply::InventoryReserved(reserved) => {
                record.complete(StepStatus::Succeeded, now);
                draft.saga.context_mut().reservation_id = Some(reserved.reservation_id);
                if draft.saga.cancel_requested() {
                    self.begin_compensation(&mut draft, REASON_CANCELLED, "cancelled by buyer")?;
                } else {
                    self.issue(&mut draft, StepName::Payment)?;
                    draft.saga.transition_to(SagaState::PaymentPending, now)?;
                }
            }
            SagaReply::InventoryReservationFailed(rejection) => {
                record_failure(record, &rejection, now);
                let reason_code = self.reason_code(&draft.saga, &rejection);
                draft.saga.transition_to(SagaState::ReservationFailed, now)?;
                if self.registry.next_compensation(&draft.saga).is_some() {
                    // A timed-out reserve may still land; release by its keys.
                    self.begin_compensation(&mut draft, &reason_code, &rejection.reason)?;
                } else {
                    draft.saga.set_failure(reason_code, rejection.reason);
                    self.fail(&mut draft)?;
                }
            }
            SagaReply::PaymentSucceeded(succeeded) => {
                record.complete(StepStatus::Succeeded, now);
                draft.saga.context_mut().payment_id = Some(succeeded.payment_id);
                if draft.saga.cancel_requested() {
                    self.begin_compensation(&mut draft, REASON_CANCELLED, "cancelled by buyer")?;
                } else {
                    self.confirm(&mut draft)?;
                }
            }
            SagaReply::PaymentFailed(rejection) => {
                record_failure(record, &rejection, now);
                let reason_code = self.reason_code(&draft.saga, &rejection);
                draft.saga.transition_to(SagaState::PaymentFailed, now)?;
                self.begin_compensation(&mut draft, &reason_code, &rejection.reason)?;
            }
            SagaReply::InventoryReleased | SagaReply::PaymentRefunded => {
                record.complete(StepStatus::Compensated, now);
                self.compensate_next(&mut draft)?;
            }
            SagaReply::InventoryReleaseFailed(rejection)
            | SagaReply::PaymentRefundFailed(rejection) => {
                // Compensations are never abandoned; the sweeper re-issues at retry_at.
                record.last_error = Some(rejection.reason);
                let backoff = self.config.compensation_retry.chrono_delay_for(record.attempts);
                record.retry_at = Some(now + backoff);
            }
        }

        Ok(Decision::Transition(self.seal(draft)))
    }

    /// Decides what to do with a saga whose `next_deadline` has passed.
    ///
    /// Returns `None` when nothing is due yet.
    pub fn on_deadline(
        &self,
        saga: &OrderSaga,
        now: DateTime<Utc>,
    ) -> Result<Option<DeadlineAction>> {
        if saga.state().is_terminal() {
            return Ok(None);
        }
        let Some(step) = saga.pending_step() else {
            return Ok(None);
        };
        let retry_due = step.retry_at.is_some_and(|at| at <= now);
        let cause = step.commands.last().map(|c| c.command_id);

        if step.name.is_compensation() {
            let ceiling_passed =
                !step.escalated && now >= step.started_at + self.config.compensation_ceiling();
            if !ceiling_passed && !retry_due {
                return Ok(None);
            }

            let step_name = step.name;
            let mut draft = Draft::new(saga.clone(), cause, now);
            if ceiling_passed {
                pending_record(&mut draft, step_name)?.escalated = true;
                draft.escalated.push(step_name);
            }
            if retry_due {
                self.issue(&mut draft, step_name)?;
            }
            return Ok(Some(DeadlineAction::Reissue(self.seal(draft))));
        }

        let expired = now >= step.started_at + self.deadline_for(step.name);
        let exhausted = self.config.step_retry.is_exhausted(step.attempts);
        if expired || (retry_due && exhausted) {
            let Some(command) = step.latest_unanswered() else {
                return Ok(None);
            };
            let rejection = StepRejected::new(
                REASON_TIMEOUT,
                format!(
                    "no reply to {} after {} attempt(s)",
                    step.name, step.attempts
                ),
            );
            let envelope = EventEnvelope::builder(step.name.failure_type(), EVENT_VERSION)
                .source(SWEEPER_SOURCE)
                .correlation_id(saga.saga_id())
                .causation_id(command.command_id)
                .timestamp(now)
                .data(&rejection)?
                .build();
            return Ok(Some(DeadlineAction::Expire(envelope)));
        }

        if retry_due {
            let step_name = step.name;
            let mut draft = Draft::new(saga.clone(), cause, now);
            self.issue(&mut draft, step_name)?;
            return Ok(Some(DeadlineAction::Reissue(self.seal(draft))));
        }

        Ok(None)
    }

    /// Applies a buyer's cancellation request.
    ///
    /// Returns the transition to persist, if the request changes the saga.
    pub fn cancel(
        &self,
        saga: &OrderSaga,
        now: DateTime<Utc>,
    ) -> Result<(CancelOutcome, Option<Transition>)> {
        match saga.state() {
            SagaState::Created => {
                let mut draft = Draft::new(saga.clone(), None, now);
                draft.saga.set_failure(REASON_CANCELLED, "cancelled by buyer");
                self.fail(&mut draft)?;
                Ok((CancelOutcome::Cancelled, Some(self.seal(draft))))
            }
            SagaState::ReservationPending | SagaState::PaymentPending => {
                if saga.cancel_requested() {
                    return Ok((CancelOutcome::Accepted, None));
                }
                let mut draft = Draft::new(saga.clone(), None, now);
                draft.saga.request_cancel();
                Ok((CancelOutcome::Accepted, Some(self.seal(draft))))
            }
            SagaState::Compensating => Ok((CancelOutcome::AlreadyFailing, None)),
            actual => Err(SagaError::InvalidState {
                expected: "Created, ReservationPending, PaymentPending or Compensating",
                actual,
            }),
        }
    }

    /// When the sweeper must next look at `saga`.
    pub fn next_deadline(&self, saga: &OrderSaga) -> Option<DateTime<Utc>> {
        let step = saga.pending_step()?;
        if step.name.is_compensation() {
            let ceiling =
                (!step.escalated).then(|| step.started_at + self.config.compensation_ceiling());
            return match (step.retry_at, ceiling) {
                (Some(retry), Some(ceiling)) => Some(retry.min(ceiling)),
                (retry, ceiling) => retry.or(ceiling),
            };
        }
        let expiry = step.started_at + self.deadline_for(step.name);
        Some(step.retry_at.map_or(expiry, |retry| retry.min(expiry)))
    }

    fn deadline_for(&self, step: StepName) -> chrono::Duration {
        match step {
            StepName::Payment => self.config.payment_deadline(),
            _ => self.config.reservation_deadline(),
        }
    }

    fn retry_for(&self, step: StepName) -> &RetryConfig {
        if step.is_compensation() {
            &self.config.compensation_retry
        } else {
            &self.config.step_retry
        }
    }

    fn reason_code(&self, saga: &OrderSaga, rejection: &StepRejected) -> String {
        if saga.cancel_requested() {
            REASON_CANCELLED.to_string()
        } else {
            rejection.reason_code.clone()
        }
    }

    fn emit(&self, draft: &mut Draft, event_type: &str, data: serde_json::Value) -> EventId {
        let mut builder = EventEnvelope::builder(event_type, EVENT_VERSION)
            .source(SAGA_SOURCE)
            .correlation_id(draft.saga.saga_id())
            .timestamp(draft.now)
            .data_raw(data);
        if let Some(cause) = draft.cause {
            builder = builder.causation_id(cause);
        }
        let envelope = builder.build();
        let event_id = envelope.event_id;
        draft.outbox.push(envelope);
        event_id
    }

    /// Sends the next attempt of `step`, starting its record if needed.
    fn issue(&self, draft: &mut Draft, step: StepName) -> Result<()> {
        let now = draft.now;
        let attempt = draft.saga.pending_step_mut(step, now).attempts + 1;
        let key = idempotency_key(draft.saga.saga_id(), step, attempt);
        let data = self.command_data(&draft.saga, step, key.clone())?;
        let command_id = self.emit(draft, step.command_type(), data);
        let retry_at = now + self.retry_for(step).chrono_delay_for(attempt);

        let record = draft.saga.pending_step_mut(step, now);
        record.record_issue(IssuedCommand {
            command_id,
            attempt,
            idempotency_key: key,
            issued_at: now,
            answered: false,
        });
        record.retry_at = Some(retry_at);
        Ok(())
    }

    fn command_data(
        &self,
        saga: &OrderSaga,
        step: StepName,
        idempotency_key: String,
    ) -> Result<serde_json::Value> {
        let payload = saga.payload();
        let data = match step {
            StepName::Reservation => serde_json::to_value(ReserveInventory {
                saga_id: saga.saga_id(),
                listing_id: payload.listing_id.clone(),
                quantity: payload.quantity,
                idempotency_key,
            })?,
            StepName::Payment => serde_json::to_value(ChargePayment {
                saga_id: saga.saga_id(),
                buyer_id: payload.buyer_id.clone(),
                amount: payload
                    .total()
                    .ok_or_else(|| SagaError::InvalidOrder("order total overflows".to_string()))?,
                currency: payload.currency.clone(),
                idempotency_key,
            })?,
            StepName::ReleaseInventory => self
                .compensation(StepName::Reservation)?
                .build(saga, idempotency_key)?,
            StepName::RefundPayment => self
                .compensation(StepName::Payment)?
                .build(saga, idempotency_key)?,
        };
        Ok(data)
    }

    fn compensation(&self, forward: StepName) -> Result<&Compensation> {
        self.registry.compensation_for(forward).ok_or(SagaError::InvalidState {
            expected: "a compensable step",
            actual: SagaState::Compensating,
        })
    }

    fn begin_compensation(
        &self,
        draft: &mut Draft,
        reason_code: &str,
        message: &str,
    ) -> Result<()> {
        draft.saga.set_failure(reason_code, message);
        draft.saga.transition_to(SagaState::Compensating, draft.now)?;
        self.compensate_next(draft)
    }

    /// Issues the next outstanding compensation, or fails the saga once none is left.
    fn compensate_next(&self, draft: &mut Draft) -> Result<()> {
        match self.registry.next_compensation(&draft.saga) {
            Some(compensation) => {
                let step = compensation.step;
                self.issue(draft, step)
            }
            None => self.fail(draft),
        }
    }

    fn confirm(&self, draft: &mut Draft) -> Result<()> {
        let now = draft.now;
        draft.saga.transition_to(SagaState::Confirmed, now)?;
        draft.saga.transition_to(SagaState::Completed, now)?;

        let confirmed = serde_json::to_value(OrderConfirmed {
            order_id: draft.saga.order_id(),
            reservation_id: draft.saga.context().reservation_id.clone(),
            payment_id: draft.saga.context().payment_id.clone(),
        })?;
        self.emit(draft, event_types::ORDER_CONFIRMED, confirmed);
        self.notify(draft, OrderOutcome::Confirmed, None)
    }

    fn fail(&self, draft: &mut Draft) -> Result<()> {
        draft.saga.transition_to(SagaState::Failed, draft.now)?;

        let reason_code = draft
            .saga
            .failure()
            .map(|f| f.reason_code.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let failed = serde_json::to_value(OrderFailed {
            order_id: draft.saga.order_id(),
            reason_code: reason_code.clone(),
        })?;
        self.emit(draft, event_types::ORDER_FAILED, failed);
        self.notify(draft, OrderOutcome::Failed, Some(reason_code))
    }

    fn notify(
        &self,
        draft: &mut Draft,
        outcome: OrderOutcome,
        reason_code: Option<String>,
    ) -> Result<()> {
        let suffix = match outcome {
            OrderOutcome::Confirmed => "confirmed",
            OrderOutcome::Failed => "failed",
        };
        let notify = serde_json::to_value(NotifyBuyer {
            order_id: draft.saga.order_id(),
            buyer_id: draft.saga.payload().buyer_id.clone(),
            outcome,
            reason_code,
            idempotency_key: format!("{}:Notify:{suffix}", draft.saga.saga_id()),
        })?;
        self.emit(draft, event_types::NOTIFICATION_REQUESTED, notify);
        Ok(())
    }

    fn seal(&self, mut draft: Draft) -> Transition {
        let deadline = self.next_deadline(&draft.saga);
        draft.saga.seal(deadline, draft.now);
        Transition {
            saga: draft.saga,
            outbox: draft.outbox,
            escalated: draft.escalated,
        }
    }
}

fn pending_record(draft: &mut Draft, step: StepName) -> Result<&mut StepRecord> {
    let state = draft.saga.state();
    draft
        .saga
        .step_mut(step)
        .filter(|r| r.is_pending())
        .ok_or(SagaError::InvalidState {
            expected: "a pending step",
            actual: state,
        })
}

fn record_failure(record: &mut StepRecord, rejection: &StepRejected, now: DateTime<Utc>) {
    record.complete(StepStatus::Failed, now);
    record.last_error = Some(rejection.reason.clone());
    record.outcome_unknown = rejection.reason_code == REASON_TIMEOUT;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::{BuyerId, Currency, ListingId, Money};
    use messaging::SemVer;

    use super::*;

    fn payload() -> OrderPayload {
        OrderPayload::new(
            BuyerId::new("buyer-1"),
            ListingId::new("listing-1"),
            2,
            Money::from_cents(1250),
            Currency::parse("USD").unwrap(),
        )
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(SagaConfig::default())
    }

    fn command<'a>(outbox: &'a [EventEnvelope], event_type: &str) -> &'a EventEnvelope {
        outbox
            .iter()
            .find(|e| e.event_type == event_type)
            .unwrap_or_else(|| panic!("no {event_type} in outbox"))
    }

    fn reply(to: &EventEnvelope, event_type: &str, data: serde_json::Value) -> EventEnvelope {
        to.reply(event_type, EVENT_VERSION).data_raw(data).build()
    }

    fn apply(o: &Orchestrator, saga: &OrderSaga, envelope: &EventEnvelope) -> Transition {
        match o.handle(saga, envelope, Utc::now()).unwrap() {
            Decision::Transition(t) => {
                assert_monotonic(saga, &t.saga);
                t
            }
            Decision::Ignored(reason) => panic!("unexpected ignore: {reason}"),
        }
    }

    fn assert_monotonic(before: &OrderSaga, after: &OrderSaga) {
        assert_eq!(after.version(), before.version().next());
        for (old, new) in before.steps().iter().zip(after.steps()) {
            assert_eq!(old.name, new.name);
            assert!(
                old.status == new.status || old.status.can_advance_to(new.status),
                "{} went {:?} -> {:?}",
                old.name,
                old.status,
                new.status
            );
        }
    }

    fn rejected(code: &str) -> serde_json::Value {
        serde_json::json!({"reason_code": code, "reason": "rejected by test"})
    }

    /// Starts a saga and answers the reservation successfully.
    fn in_payment_pending(o: &Orchestrator) -> Transition {
        let started = o.start(SagaId::new(), payload(), Utc::now()).unwrap();
        let reserve = command(&started.outbox, event_types::INVENTORY_RESERVE_REQUESTED);
        apply(
            o,
            &started.saga,
            &reply(
                reserve,
                event_types::INVENTORY_RESERVED,
                serde_json::json!({"reservation_id": "RES-1"}),
            ),
        )
    }

    #[test]
    fn start_issues_reservation() {
        let now = Utc::now();
        let saga_id = SagaId::new();
        let t = orchestrator().start(saga_id, payload(), now).unwrap();

        assert_eq!(t.saga.state(), SagaState::ReservationPending);
        assert_eq!(t.saga.version().as_i64(), 1);
        assert_eq!(t.outbox.len(), 2);
        assert_eq!(t.outbox[0].event_type, event_types::ORDER_SAGA_CREATED);

        let reserve = &t.outbox[1];
        assert_eq!(reserve.event_type, event_types::INVENTORY_RESERVE_REQUESTED);
        assert_eq!(reserve.causation_id, Some(t.outbox[0].event_id));
        assert_eq!(reserve.correlation_id, Some(saga_id.as_uuid()));
        let data: ReserveInventory = reserve.decode().unwrap();
        assert_eq!(data.idempotency_key, format!("{saga_id}:Reservation:1"));
        assert_eq!(data.quantity, 2);

        // The first retry comes before the reservation deadline.
        assert_eq!(t.saga.next_deadline(), Some(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn start_rejects_invalid_payload() {
        let mut p = payload();
        p.quantity = 0;
        assert!(matches!(
            orchestrator().start(SagaId::new(), p, Utc::now()),
            Err(SagaError::InvalidOrder(_))
        ));
    }

    #[test]
    fn happy_path_completes_and_confirms() {
        let o = orchestrator();
        let t = in_payment_pending(&o);
        assert_eq!(t.saga.state(), SagaState::PaymentPending);

        let charge = command(&t.outbox, event_types::PAYMENT_CHARGE_REQUESTED);
        let data: ChargePayment = charge.decode().unwrap();
        assert_eq!(data.amount, Money::from_cents(2500));

        let done = apply(
            &o,
            &t.saga,
            &reply(
                charge,
                event_types::PAYMENT_SUCCEEDED,
                serde_json::json!({"payment_id": "PAY-1"}),
            ),
        );

        assert_eq!(done.saga.state(), SagaState::Completed);
        assert_eq!(done.saga.next_deadline(), None);
        assert!(
            done.saga
                .history()
                .iter()
                .any(|h| h.state == SagaState::Confirmed)
        );
        let types: Vec<_> = done.outbox.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            [event_types::ORDER_CONFIRMED, event_types::NOTIFICATION_REQUESTED]
        );
    }

    #[test]
    fn payment_failure_releases_inventory_then_fails() {
        let o = orchestrator();
        let t = in_payment_pending(&o);
        let charge = command(&t.outbox, event_types::PAYMENT_CHARGE_REQUESTED);

        let compensating = apply(
            &o,
            &t.saga,
            &reply(charge, event_types::PAYMENT_FAILED, rejected("payment_declined")),
        );
        assert_eq!(compensating.saga.state(), SagaState::Compensating);
        assert_eq!(compensating.outbox.len(), 1);
        let release = &compensating.outbox[0];
        assert_eq!(release.event_type, event_types::INVENTORY_RELEASE_REQUESTED);
        let data: crate::messages::ReleaseInventory = release.decode().unwrap();
        assert_eq!(data.reservation_id.as_deref(), Some("RES-1"));
        assert_eq!(data.reserve_keys.len(), 1);

        let failed = apply(
            &o,
            &compensating.saga,
            &reply(release, event_types::INVENTORY_RELEASED, serde_json::json!({})),
        );
        assert_eq!(failed.saga.state(), SagaState::Failed);
        assert_eq!(
            failed.saga.step_statuses(),
            [
                (StepName::Reservation, StepStatus::Succeeded),
                (StepName::Payment, StepStatus::Failed),
                (StepName::ReleaseInventory, StepStatus::Compensated),
            ]
        );
        assert_eq!(failed.saga.failure().unwrap().reason_code, "payment_declined");
        let failures = failed
            .outbox
            .iter()
            .filter(|e| e.event_type == event_types::ORDER_FAILED)
            .count();
        assert_eq!(failures, 1);
    }

    #[test]
    fn reservation_failure_fails_without_compensation() {
        let o = orchestrator();
        let started = o.start(SagaId::new(), payload(), Utc::now()).unwrap();
        let reserve = command(&started.outbox, event_types::INVENTORY_RESERVE_REQUESTED);

        let failed = apply(
            &o,
            &started.saga,
            &reply(
                reserve,
                event_types::INVENTORY_RESERVATION_FAILED,
                rejected("inventory_unavailable"),
            ),
        );

        assert_eq!(failed.saga.state(), SagaState::Failed);
        assert_eq!(
            failed.saga.step_statuses(),
            [(StepName::Reservation, StepStatus::Failed)]
        );
        assert!(
            failed
                .outbox
                .iter()
                .all(|e| e.event_type != event_types::INVENTORY_RELEASE_REQUESTED)
        );
        let states: Vec<_> = failed.saga.history().iter().map(|h| h.state).collect();
        assert_eq!(
            states,
            [
                SagaState::Created,
                SagaState::ReservationPending,
                SagaState::ReservationFailed,
                SagaState::Failed
            ]
        );
    }

    #[test]
    fn duplicate_and_stale_replies_are_ignored() {
        let o = orchestrator();
        let started = o.start(SagaId::new(), payload(), Utc::now()).unwrap();
        let reserve = command(&started.outbox, event_types::INVENTORY_RESERVE_REQUESTED);
        let reserved = reply(
            reserve,
            event_types::INVENTORY_RESERVED,
            serde_json::json!({"reservation_id": "RES-1"}),
        );
        let t = apply(&o, &started.saga, &reserved);

        let again = o.handle(&t.saga, &reserved, Utc::now()).unwrap();
        assert!(matches!(again, Decision::Ignored(IgnoreReason::NotOutstanding)));

        let stray = EventEnvelope::builder(event_types::PAYMENT_SUCCEEDED, EVENT_VERSION)
            .correlation_id(t.saga.saga_id())
            .causation_id(EventId::new())
            .data_raw(serde_json::json!({"payment_id": "PAY-X"}))
            .build();
        assert!(matches!(
            o.handle(&t.saga, &stray, Utc::now()).unwrap(),
            Decision::Ignored(IgnoreReason::NotOutstanding)
        ));

        let charge = command(&t.outbox, event_types::PAYMENT_CHARGE_REQUESTED);
        let mismatched = reply(
            charge,
            event_types::INVENTORY_RESERVED,
            serde_json::json!({"reservation_id": "R"}),
        );
        assert!(matches!(
            o.handle(&t.saga, &mismatched, Utc::now()).unwrap(),
            Decision::Ignored(IgnoreReason::WrongStep)
        ));
    }

    #[test]
    fn unsupported_version_and_missing_causation_are_protocol_errors() {
        let o = orchestrator();
        let started = o.start(SagaId::new(), payload(), Utc::now()).unwrap();
        let reserve = command(&started.outbox, event_types::INVENTORY_RESERVE_REQUESTED);

        let v2 = reserve
            .reply(event_types::INVENTORY_RESERVED, SemVer::new(2, 0, 0))
            .data_raw(serde_json::json!({"reservation_id": "RES-1"}))
            .build();
        assert!(matches!(
            o.handle(&started.saga, &v2, Utc::now()),
            Err(SagaError::Protocol(ProtocolError::UnsupportedVersion { .. }))
        ));

        let orphan = EventEnvelope::builder(event_types::INVENTORY_RESERVED, EVENT_VERSION)
            .data_raw(serde_json::json!({"reservation_id": "RES-1"}))
            .build();
        assert!(matches!(
            o.handle(&started.saga, &orphan, Utc::now()),
            Err(SagaError::Protocol(ProtocolError::MissingCausation(_)))
        ));
    }

    #[test]
    fn terminal_sagas_ignore_replies() {
        let o = orchestrator();
        let started = o.start(SagaId::new(), payload(), Utc::now()).unwrap();
        let reserve = command(&started.outbox, event_types::INVENTORY_RESERVE_REQUESTED);
        let failed = apply(
            &o,
            &started.saga,
            &reply(reserve, event_types::INVENTORY_RESERVATION_FAILED, rejected("x")),
        );

        let late = reply(
            reserve,
            event_types::INVENTORY_RESERVED,
            serde_json::json!({"reservation_id": "RES-1"}),
        );
        assert!(matches!(
            o.handle(&failed.saga, &late, Utc::now()).unwrap(),
            Decision::Ignored(IgnoreReason::Terminal)
        ));
    }

    #[test]
    fn deadline_reissues_with_fresh_key_then_expires() {
        let config = SagaConfig {
            step_retry: RetryConfig {
                max_attempts: 2,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(1),
                backoff_multiplier: 1.0,
            },
            ..SagaConfig::default()
        };
        let o = Orchestrator::new(config);
        let start = Utc::now();
        let started = o.start(SagaId::new(), payload(), start).unwrap();

        assert!(o.on_deadline(&started.saga, start).unwrap().is_none());

        let later = start + chrono::Duration::seconds(2);
        let Some(DeadlineAction::Reissue(retry)) = o.on_deadline(&started.saga, later).unwrap()
        else {
            panic!("expected a retry");
        };
        let reserve = command(&retry.outbox, event_types::INVENTORY_RESERVE_REQUESTED);
        let data: ReserveInventory = reserve.decode().unwrap();
        assert!(data.idempotency_key.ends_with(":Reservation:2"));
        assert_eq!(retry.saga.step(StepName::Reservation).unwrap().attempts, 2);
        assert_eq!(retry.saga.state(), SagaState::ReservationPending);

        let much_later = later + chrono::Duration::seconds(2);
        let Some(DeadlineAction::Expire(failure)) =
            o.on_deadline(&retry.saga, much_later).unwrap()
        else {
            panic!("expected expiry");
        };
        assert_eq!(failure.event_type, event_types::INVENTORY_RESERVATION_FAILED);
        assert_eq!(failure.source, SWEEPER_SOURCE);
        assert_eq!(failure.causation_id, Some(reserve.event_id));

        let compensating = apply(&o, &retry.saga, &failure);
        assert_eq!(compensating.saga.state(), SagaState::Compensating);
        assert_eq!(compensating.saga.failure().unwrap().reason_code, REASON_TIMEOUT);
        assert!(compensating.saga.step(StepName::Reservation).unwrap().outcome_unknown);

        let release = command(&compensating.outbox, event_types::INVENTORY_RELEASE_REQUESTED);
        let data: crate::messages::ReleaseInventory = release.decode().unwrap();
        assert_eq!(data.reservation_id, None);
        assert_eq!(data.reserve_keys.len(), 2);
    }

    #[test]
    fn payment_timeout_refunds_before_release() {
        let o = orchestrator();
        let t = in_payment_pending(&o);
        let expired_at = Utc::now() + chrono::Duration::seconds(301);

        let Some(DeadlineAction::Expire(failure)) = o.on_deadline(&t.saga, expired_at).unwrap()
        else {
            panic!("expected expiry");
        };
        let compensating = apply(&o, &t.saga, &failure);
        assert!(compensating.saga.step(StepName::Payment).unwrap().outcome_unknown);

        let refund = command(&compensating.outbox, event_types::PAYMENT_REFUND_REQUESTED);
        let data: crate::messages::RefundPayment = refund.decode().unwrap();
        assert_eq!(data.payment_id, None);
        assert_eq!(data.charge_keys.len(), 1);

        let refunded = apply(
            &o,
            &compensating.saga,
            &reply(refund, event_types::PAYMENT_REFUNDED, serde_json::json!({})),
        );
        let release = command(&refunded.outbox, event_types::INVENTORY_RELEASE_REQUESTED);
        let failed = apply(
            &o,
            &refunded.saga,
            &reply(release, event_types::INVENTORY_RELEASED, serde_json::json!({})),
        );

        assert_eq!(failed.saga.state(), SagaState::Failed);
        assert_eq!(
            failed.saga.step_statuses(),
            [
                (StepName::Reservation, StepStatus::Succeeded),
                (StepName::Payment, StepStatus::Failed),
                (StepName::RefundPayment, StepStatus::Compensated),
                (StepName::ReleaseInventory, StepStatus::Compensated),
            ]
        );
    }

    #[test]
    fn failed_compensation_is_retried_and_escalated() {
        let o = orchestrator();
        let t = in_payment_pending(&o);
        let charge = command(&t.outbox, event_types::PAYMENT_CHARGE_REQUESTED);
        let compensating = apply(
            &o,
            &t.saga,
            &reply(charge, event_types::PAYMENT_FAILED, rejected("payment_declined")),
        );
        let release = command(&compensating.outbox, event_types::INVENTORY_RELEASE_REQUESTED);

        let waiting = apply(
            &o,
            &compensating.saga,
            &reply(release, event_types::INVENTORY_RELEASE_FAILED, rejected("unavailable")),
        );
        assert_eq!(waiting.saga.state(), SagaState::Compensating);
        assert!(waiting.outbox.is_empty());
        let step = waiting.saga.step(StepName::ReleaseInventory).unwrap();
        assert_eq!(step.last_error.as_deref(), Some("rejected by test"));
        let retry_at = step.retry_at.unwrap();

        let Some(DeadlineAction::Reissue(retried)) =
            o.on_deadline(&waiting.saga, retry_at).unwrap()
        else {
            panic!("expected a retry");
        };
        assert!(retried.escalated.is_empty());
        assert_eq!(retried.saga.step(StepName::ReleaseInventory).unwrap().attempts, 2);

        let past_ceiling = Utc::now() + chrono::Duration::hours(1);
        let Some(DeadlineAction::Reissue(escalated)) =
            o.on_deadline(&retried.saga, past_ceiling).unwrap()
        else {
            panic!("expected escalation");
        };
        assert_eq!(escalated.escalated, [StepName::ReleaseInventory]);
        assert!(escalated.saga.step(StepName::ReleaseInventory).unwrap().escalated);
        assert_eq!(escalated.saga.state(), SagaState::Compensating);
    }

    #[test]
    fn cancel_during_reservation_compensates_after_success() {
        let o = orchestrator();
        let started = o.start(SagaId::new(), payload(), Utc::now()).unwrap();

        let (outcome, t) = o.cancel(&started.saga, Utc::now()).unwrap();
        assert_eq!(outcome, CancelOutcome::Accepted);
        let requested = t.unwrap();
        assert!(requested.saga.cancel_requested());
        assert!(requested.outbox.is_empty());

        let (again, none) = o.cancel(&requested.saga, Utc::now()).unwrap();
        assert_eq!(again, CancelOutcome::Accepted);
        assert!(none.is_none());

        let reserve = command(&started.outbox, event_types::INVENTORY_RESERVE_REQUESTED);
        let compensating = apply(
            &o,
            &requested.saga,
            &reply(
                reserve,
                event_types::INVENTORY_RESERVED,
                serde_json::json!({"reservation_id": "RES-1"}),
            ),
        );
        assert_eq!(compensating.saga.state(), SagaState::Compensating);
        assert_eq!(compensating.saga.failure().unwrap().reason_code, REASON_CANCELLED);
        command(&compensating.outbox, event_types::INVENTORY_RELEASE_REQUESTED);

        let (outcome, none) = o.cancel(&compensating.saga, Utc::now()).unwrap();
        assert_eq!(outcome, CancelOutcome::AlreadyFailing);
        assert!(none.is_none());
    }

    #[test]
    fn cancel_during_payment_refunds_a_late_success() {
        let o = orchestrator();
        let t = in_payment_pending(&o);
        let (_, requested) = o.cancel(&t.saga, Utc::now()).unwrap();
        let requested = requested.unwrap();

        let charge = command(&t.outbox, event_types::PAYMENT_CHARGE_REQUESTED);
        let compensating = apply(
            &o,
            &requested.saga,
            &reply(
                charge,
                event_types::PAYMENT_SUCCEEDED,
                serde_json::json!({"payment_id": "PAY-1"}),
            ),
        );

        assert_eq!(compensating.saga.state(), SagaState::Compensating);
        let refund = command(&compensating.outbox, event_types::PAYMENT_REFUND_REQUESTED);
        let data: crate::messages::RefundPayment = refund.decode().unwrap();
        assert_eq!(data.payment_id.as_deref(), Some("PAY-1"));
    }

    #[test]
    fn cancel_rejects_finished_sagas() {
        let o = orchestrator();
        let started = o.start(SagaId::new(), payload(), Utc::now()).unwrap();
        let reserve = command(&started.outbox, event_types::INVENTORY_RESERVE_REQUESTED);
        let failed = apply(
            &o,
            &started.saga,
            &reply(reserve, event_types::INVENTORY_RESERVATION_FAILED, rejected("x")),
        );

        assert!(matches!(
            o.cancel(&failed.saga, Utc::now()),
            Err(SagaError::InvalidState {
                actual: SagaState::Failed,
                ..
            })
        ));
    }

    #[test]
    fn cancel_before_any_command_fails_immediately() {
        let o = orchestrator();
        let saga = OrderSaga::new(SagaId::new(), payload(), Utc::now());

        let (outcome, t) = o.cancel(&saga, Utc::now()).unwrap();
        let t = t.unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled);
        assert_eq!(t.saga.state(), SagaState::Failed);
        assert!(t.saga.steps().is_empty());
        command(&t.outbox, event_types::ORDER_FAILED);
    }
}
