use thiserror::Error;

/// Errors raised by the bus client.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker could not accept the message; the caller should retry later.
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    /// The subscription was closed by the bus.
    #[error("subscription closed")]
    Closed,

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
