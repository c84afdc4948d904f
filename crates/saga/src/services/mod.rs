//! Capabilities the saga drives, their in-memory implementations, and the
//! adapters that turn command envelopes into capability calls.

pub mod adapter;
pub mod dispatcher;
pub mod inventory;
pub mod notification;
pub mod payment;

use thiserror::Error;

pub use adapter::CapabilityAdapter;
pub use dispatcher::{Ack, CommandDispatcher};
pub use inventory::{
    InMemoryInventoryService, InventoryAdapter, InventoryCapability, Reservation,
};
pub use notification::{
    InMemoryNotificationService, Notification, NotificationAdapter, NotificationCapability,
};
pub use payment::{ChargeOutcome, InMemoryPaymentService, PaymentAdapter, PaymentCapability};

/// Failure reported by a capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// The capability refused the request. Terminal for the step.
    #[error("rejected ({reason_code}): {reason}")]
    Rejected { reason_code: String, reason: String },

    /// The capability could not be reached. Worth retrying.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl CapabilityError {
    pub fn rejected(reason_code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason_code: reason_code.into(),
            reason: reason.into(),
        }
    }
}
