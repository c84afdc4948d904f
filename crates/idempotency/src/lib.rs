//! Idempotency store.
//!
//! Capability adapters claim a command's idempotency key before executing
//! side effects and record the outcome afterwards. A redelivered command finds
//! the key already processed and gets the stored outcome back instead of
//! running again.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{IdempotencyError, Result};
pub use memory::InMemoryIdempotencyStore;
pub use postgres::PostgresIdempotencyStore;
pub use store::{CheckOutcome, IdempotencyConfig, IdempotencyStore};
