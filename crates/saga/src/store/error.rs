use common::{SagaId, Version};
use thiserror::Error;

/// Errors that can occur when interacting with the saga state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed: the saga moved on since it was loaded.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// No saga exists with this id.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A saga with this id already exists.
    #[error("Saga already exists: {0}")]
    AlreadyExists(SagaId),

    /// The record handed to the store breaks a storage invariant.
    #[error("Invalid saga record: {0}")]
    InvalidRecord(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored document could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
