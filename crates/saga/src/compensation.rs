//! Compensation registry: which command undoes which forward step.

use std::collections::HashMap;

use messaging::event_types;

use crate::instance::OrderSaga;
use crate::messages::{RefundPayment, ReleaseInventory};
use crate::step::{StepName, StepStatus};

type CommandBuilder = fn(&OrderSaga, String) -> Result<serde_json::Value, serde_json::Error>;

/// The inverse of one forward step.
#[derive(Clone, Copy)]
pub struct Compensation {
    /// The step that runs the inverse command.
    pub step: StepName,
    /// Command type of the inverse command.
    pub command_type: &'static str,
    /// The forward step may have taken effect even when it did not report
    /// success (e.g. a reserve or charge that timed out).
    pub partial_success_possible: bool,
    builder: CommandBuilder,
}

impl Compensation {
    /// Builds the inverse command's payload from the saga's payload and context.
    pub fn build(
        &self,
        saga: &OrderSaga,
        idempotency_key: String,
    ) -> Result<serde_json::Value, serde_json::Error> {
        (self.builder)(saga, idempotency_key)
    }
}

impl std::fmt::Debug for Compensation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compensation")
            .field("step", &self.step)
            .field("command_type", &self.command_type)
            .field("partial_success_possible", &self.partial_success_possible)
            .finish()
    }
}

/// Static mapping from forward steps to their compensations.
#[derive(Debug, Clone)]
pub struct CompensationRegistry {
    entries: HashMap<StepName, Compensation>,
}

impl Default for CompensationRegistry {
    fn default() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            StepName::Reservation,
            Compensation {
                step: StepName::ReleaseInventory,
                command_type: event_types::INVENTORY_RELEASE_REQUESTED,
                partial_success_possible: true,
                builder: build_release,
            },
        );
        entries.insert(
            StepName::Payment,
            Compensation {
                step: StepName::RefundPayment,
                command_type: event_types::PAYMENT_REFUND_REQUESTED,
                partial_success_possible: true,
                builder: build_refund,
            },
        );
        Self { entries }
    }
}

impl CompensationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compensation_for(&self, step: StepName) -> Option<&Compensation> {
        self.entries.get(&step)
    }

    /// The next compensation the saga still has to run, if any.
    ///
    /// Forward steps are visited in reverse start order. A step needs undoing
    /// when it succeeded, or when its outcome is unknown and it can partially
    /// succeed.
    pub fn next_compensation(&self, saga: &OrderSaga) -> Option<&Compensation> {
        saga.steps()
            .iter()
            .rev()
            .filter(|s| !s.name.is_compensation())
            .filter_map(|forward| {
                let compensation = self.compensation_for(forward.name)?;
                let needed = match forward.status {
                    StepStatus::Succeeded => true,
                    StepStatus::Failed => {
                        forward.outcome_unknown && compensation.partial_success_possible
                    }
                    StepStatus::Pending | StepStatus::Compensated => false,
                };
                let done = saga
                    .step(compensation.step)
                    .is_some_and(|c| c.status == StepStatus::Compensated);
                (needed && !done).then_some(compensation)
            })
            .next()
    }
}

fn build_release(
    saga: &OrderSaga,
    idempotency_key: String,
) -> Result<serde_json::Value, serde_json::Error> {
    let payload = saga.payload();
    serde_json::to_value(ReleaseInventory {
        saga_id: saga.saga_id(),
        listing_id: payload.listing_id.clone(),
        quantity: payload.quantity,
        reservation_id: saga.context().reservation_id.clone(),
        reserve_keys: saga
            .step(StepName::Reservation)
            .map(|s| s.idempotency_keys())
            .unwrap_or_default(),
        idempotency_key,
    })
}

fn build_refund(
    saga: &OrderSaga,
    idempotency_key: String,
) -> Result<serde_json::Value, serde_json::Error> {
    let payload = saga.payload();
    serde_json::to_value(RefundPayment {
        saga_id: saga.saga_id(),
        buyer_id: payload.buyer_id.clone(),
        amount: payload.total().unwrap_or(payload.price),
        currency: payload.currency.clone(),
        payment_id: saga.context().payment_id.clone(),
        charge_keys: saga
            .step(StepName::Payment)
            .map(|s| s.idempotency_keys())
            .unwrap_or_default(),
        idempotency_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_forward_step_has_a_compensation() {
        let registry = CompensationRegistry::new();

        let release = registry.compensation_for(StepName::Reservation).unwrap();
        assert_eq!(release.step, StepName::ReleaseInventory);
        assert!(release.partial_success_possible);

        let refund = registry.compensation_for(StepName::Payment).unwrap();
        assert_eq!(refund.step, StepName::RefundPayment);
        assert_eq!(refund.command_type, event_types::PAYMENT_REFUND_REQUESTED);
        assert!(refund.partial_success_possible);

        assert!(registry.compensation_for(StepName::RefundPayment).is_none());
    }
}
