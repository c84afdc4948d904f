//! Shared identifiers and value objects used across the order saga crates.

pub mod ids;
pub mod money;
pub mod version;

pub use ids::{BuyerId, ListingId, SagaId};
pub use money::{Currency, CurrencyError, Money};
pub use version::Version;
