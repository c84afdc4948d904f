//! Saga error types.

use common::SagaId;
use idempotency::IdempotencyError;
use messaging::{BusError, SemVer};
use thiserror::Error;

use crate::state::SagaState;
use crate::store::StoreError;

/// An inbound message the saga cannot interpret.
///
/// These are dropped by the consumer instead of retried: redelivering the
/// same envelope can never succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The envelope's schema version is outside the supported range.
    #[error("unsupported version {version} for {event_type}")]
    UnsupportedVersion { event_type: String, version: SemVer },

    /// The event type is not one the consumer handles.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The envelope carries no correlation id, so it cannot be routed to a saga.
    #[error("envelope {0} has no correlation id")]
    MissingCorrelation(String),

    /// The envelope carries no causation id, so it cannot be matched to a command.
    #[error("envelope {0} has no causation id")]
    MissingCausation(String),

    /// The payload did not match the schema for its type.
    #[error("malformed {event_type} payload: {reason}")]
    MalformedData { event_type: String, reason: String },
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Saga is in an invalid state for the requested operation.
    #[error("Invalid saga state: expected {expected}, actual {actual}")]
    InvalidState {
        expected: &'static str,
        actual: SagaState,
    },

    /// A state change the saga state machine does not allow.
    #[error("Invalid saga transition: {from} -> {to}")]
    InvalidTransition { from: SagaState, to: SagaState },

    /// The order request failed validation.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// No saga exists with the given id.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A payment webhook that does not match any issued charge.
    #[error("Invalid webhook: {0}")]
    InvalidWebhook(String),

    /// An inbound envelope could not be interpreted.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Saga state store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if the operation lost a compare-and-swap race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SagaError::Store(StoreError::ConcurrencyConflict { .. }))
    }
}

/// Errors raised while executing a capability command.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The command could not be interpreted; it is dropped.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The idempotency store is unreachable; the command must be redelivered.
    #[error("Idempotency store error: {0}")]
    Idempotency(#[from] IdempotencyError),

    /// The reply could not be published; the command must be redelivered.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AdapterError {
    /// Returns true if redelivering the command may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Idempotency(_) | AdapterError::Bus(_))
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
