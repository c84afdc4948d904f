//! Persisted saga record.

use chrono::{DateTime, Utc};
use common::{BuyerId, Currency, ListingId, Money, SagaId, Version};
use serde::{Deserialize, Serialize};

use crate::error::SagaError;
use crate::state::SagaState;
use crate::step::{StepName, StepRecord, StepStatus};

/// What the buyer asked to purchase. Immutable once the saga starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub buyer_id: BuyerId,
    pub listing_id: ListingId,
    pub quantity: u32,
    /// Unit price.
    pub price: Money,
    pub currency: Currency,
}

impl OrderPayload {
    pub fn new(
        buyer_id: BuyerId,
        listing_id: ListingId,
        quantity: u32,
        price: Money,
        currency: Currency,
    ) -> Self {
        Self {
            buyer_id,
            listing_id,
            quantity,
            price,
            currency,
        }
    }

    /// Amount to charge: unit price times quantity.
    pub fn total(&self) -> Option<Money> {
        self.price.checked_mul(self.quantity)
    }

    pub fn validate(&self) -> Result<(), SagaError> {
        if self.buyer_id.as_str().trim().is_empty() {
            return Err(SagaError::InvalidOrder("buyer_id is required".to_string()));
        }
        if self.listing_id.as_str().trim().is_empty() {
            return Err(SagaError::InvalidOrder("listing_id is required".to_string()));
        }
        if self.quantity == 0 {
            return Err(SagaError::InvalidOrder(
                "quantity must be at least 1".to_string(),
            ));
        }
        if !self.price.is_positive() {
            return Err(SagaError::InvalidOrder("price must be positive".to_string()));
        }
        if self.total().is_none() {
            return Err(SagaError::InvalidOrder("order total overflows".to_string()));
        }
        Ok(())
    }
}

/// Identifiers handed back by capabilities, needed to undo their work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaContext {
    pub reservation_id: Option<String>,
    pub payment_id: Option<String>,
}

/// Why a saga failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason_code: String,
    pub message: String,
}

/// An entry of the state machine's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: SagaState,
    pub entered_at: DateTime<Utc>,
}

/// One order attempt.
///
/// Only the orchestrator mutates a saga, always on a clone that is then
/// written back with compare-and-swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSaga {
    saga_id: SagaId,
    order_id: SagaId,
    state: SagaState,
    steps: Vec<StepRecord>,
    payload: OrderPayload,
    #[serde(default)]
    context: SagaContext,
    failure: Option<Failure>,
    #[serde(default)]
    cancel_requested: bool,
    history: Vec<StateChange>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: Version,
    next_deadline: Option<DateTime<Utc>>,
}

impl OrderSaga {
    /// Creates an unsaved saga in `Created`, version 0.
    pub fn new(saga_id: SagaId, payload: OrderPayload, now: DateTime<Utc>) -> Self {
        Self {
            saga_id,
            order_id: saga_id,
            state: SagaState::Created,
            steps: Vec::new(),
            payload,
            context: SagaContext::default(),
            failure: None,
            cancel_requested: false,
            history: vec![StateChange {
                state: SagaState::Created,
                entered_at: now,
            }],
            created_at: now,
            updated_at: now,
            version: Version::initial(),
            next_deadline: None,
        }
    }
}

// Query methods
impl OrderSaga {
    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn order_id(&self) -> SagaId {
        self.order_id
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn payload(&self) -> &OrderPayload {
        &self.payload
    }

    pub fn context(&self) -> &SagaContext {
        &self.context
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Earliest instant at which the timeout sweeper must look at this saga.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.next_deadline
    }

    /// The latest record for the named step.
    pub fn step(&self, name: StepName) -> Option<&StepRecord> {
        self.steps.iter().rev().find(|s| s.name == name)
    }

    /// The step currently awaiting a reply. At most one step is pending.
    pub fn pending_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.is_pending())
    }

    /// `(name, status)` for every step, in the order they were started.
    pub fn step_statuses(&self) -> Vec<(StepName, StepStatus)> {
        self.steps.iter().map(|s| (s.name, s.status)).collect()
    }
}

// Mutation, reserved for the orchestrator.
impl OrderSaga {
    pub(crate) fn step_mut(&mut self, name: StepName) -> Option<&mut StepRecord> {
        self.steps.iter_mut().rev().find(|s| s.name == name)
    }

    /// Returns the pending record for `name`, starting one if none is pending.
    pub(crate) fn pending_step_mut(
        &mut self,
        name: StepName,
        now: DateTime<Utc>,
    ) -> &mut StepRecord {
        let index = match self
            .steps
            .iter()
            .position(|s| s.name == name && s.is_pending())
        {
            Some(index) => index,
            None => {
                self.steps.push(StepRecord::new(name, now));
                self.steps.len() - 1
            }
        };
        &mut self.steps[index]
    }

    pub(crate) fn transition_to(
        &mut self,
        next: SagaState,
        now: DateTime<Utc>,
    ) -> Result<(), SagaError> {
        if !self.state.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(StateChange {
            state: next,
            entered_at: now,
        });
        Ok(())
    }

    pub(crate) fn context_mut(&mut self) -> &mut SagaContext {
        &mut self.context
    }

    pub(crate) fn set_failure(
        &mut self,
        reason_code: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.failure = Some(Failure {
            reason_code: reason_code.into(),
            message: message.into(),
        });
    }

    pub(crate) fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    /// Stamps a finished update: bumps the version and the update time.
    pub(crate) fn seal(&mut self, next_deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.version = self.version.next();
        self.updated_at = now;
        self.next_deadline = next_deadline;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> OrderPayload {
        OrderPayload::new(
            BuyerId::new("buyer-1"),
            ListingId::new("listing-1"),
            2,
            Money::from_cents(1250),
            Currency::parse("usd").unwrap(),
        )
    }

    #[test]
    fn new_saga_starts_in_created() {
        let now = Utc::now();
        let saga = OrderSaga::new(SagaId::new(), payload(), now);

        assert_eq!(saga.state(), SagaState::Created);
        assert_eq!(saga.order_id(), saga.saga_id());
        assert_eq!(saga.version(), Version::initial());
        assert_eq!(saga.history().len(), 1);
        assert!(saga.steps().is_empty());
        assert!(saga.pending_step().is_none());
    }

    #[test]
    fn total_multiplies_quantity() {
        assert_eq!(payload().total(), Some(Money::from_cents(2500)));
    }

    #[test]
    fn validate_rejects_bad_orders() {
        let mut p = payload();
        p.quantity = 0;
        assert!(matches!(p.validate(), Err(SagaError::InvalidOrder(_))));

        let mut p = payload();
        p.price = Money::zero();
        assert!(p.validate().is_err());

        let mut p = payload();
        p.buyer_id = BuyerId::new("  ");
        assert!(p.validate().is_err());

        assert!(payload().validate().is_ok());
    }

    #[test]
    fn transition_records_history_and_rejects_illegal_moves() {
        let now = Utc::now();
        let mut saga = OrderSaga::new(SagaId::new(), payload(), now);

        saga.transition_to(SagaState::ReservationPending, now).unwrap();
        assert_eq!(saga.history().len(), 2);

        let err = saga.transition_to(SagaState::Created, now).unwrap_err();
        assert!(matches!(err, SagaError::InvalidTransition { .. }));
        assert_eq!(saga.state(), SagaState::ReservationPending);
    }

    #[test]
    fn pending_step_mut_reuses_pending_record() {
        let now = Utc::now();
        let mut saga = OrderSaga::new(SagaId::new(), payload(), now);

        saga.pending_step_mut(StepName::Reservation, now).attempts = 1;
        saga.pending_step_mut(StepName::Reservation, now).attempts = 2;

        assert_eq!(saga.steps().len(), 1);
        assert_eq!(saga.step(StepName::Reservation).unwrap().attempts, 2);
    }

    #[test]
    fn serde_round_trip_preserves_record() {
        let saga = OrderSaga::new(SagaId::new(), payload(), Utc::now());
        let json = serde_json::to_value(&saga).unwrap();
        let back: OrderSaga = serde_json::from_value(json).unwrap();
        assert_eq!(saga, back);
    }
}
