//! Saga state machine.

use serde::{Deserialize, Serialize};

/// The state of an order purchase saga.
///
/// State transitions:
/// ```text
/// Created ──► ReservationPending ──┬──► PaymentPending ──┬──► Confirmed ──► Completed
///    │                             │                     ├──► PaymentFailed ──┐
///    │                             │                     └──► Compensating ◄──┘
///    │                             ├──► Compensating ──► Failed
///    │                             └──► ReservationFailed ──┬──► Failed
///    │                                                      └──► Compensating
///    └──► Failed
/// ```
///
/// `Confirmed`, `ReservationFailed` and `PaymentFailed` are transient: the
/// orchestrator passes through them within a single update, and they show up
/// only in the saga's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    /// Saga record created, no command issued yet.
    #[default]
    Created,

    /// Waiting for the inventory service to reserve stock.
    ReservationPending,

    /// Inventory could not be reserved.
    ReservationFailed,

    /// Waiting for the payment service to charge the buyer.
    PaymentPending,

    /// The charge failed or timed out.
    PaymentFailed,

    /// Both forward steps succeeded.
    Confirmed,

    /// Undoing completed steps in reverse order.
    Compensating,

    /// The purchase did not happen (terminal state).
    Failed,

    /// The purchase went through (terminal state).
    Completed,
}

impl SagaState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Failed)
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SagaState) -> bool {
        use SagaState::*;
        matches!(
            (self, next),
            (Created, ReservationPending)
                | (Created, Failed)
                | (ReservationPending, PaymentPending)
                | (ReservationPending, ReservationFailed)
                | (ReservationPending, Compensating)
                | (ReservationFailed, Failed)
                | (ReservationFailed, Compensating)
                | (PaymentPending, Confirmed)
                | (PaymentPending, PaymentFailed)
                | (PaymentPending, Compensating)
                | (PaymentFailed, Compensating)
                | (Confirmed, Completed)
                | (Compensating, Failed)
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Created => "Created",
            SagaState::ReservationPending => "ReservationPending",
            SagaState::ReservationFailed => "ReservationFailed",
            SagaState::PaymentPending => "PaymentPending",
            SagaState::PaymentFailed => "PaymentFailed",
            SagaState::Confirmed => "Confirmed",
            SagaState::Compensating => "Compensating",
            SagaState::Failed => "Failed",
            SagaState::Completed => "Completed",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
