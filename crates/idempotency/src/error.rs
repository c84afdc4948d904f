use thiserror::Error;

/// Errors that can occur when interacting with the idempotency store.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A configured duration does not fit the timestamp range.
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
}

/// Result type for idempotency store operations.
pub type Result<T> = std::result::Result<T, IdempotencyError>;
