//! Event envelopes and the bus client shared by the saga orchestrator and the
//! capability adapters.
//!
//! Commands and events travel in the same [`EventEnvelope`]. Every envelope
//! carries a semantic `event_version`; consumers declare the
//! [`VersionRange`] they understand and reject anything outside it.

pub mod bus;
pub mod envelope;
pub mod error;
pub mod event_types;
pub mod version;

pub use bus::{EnvelopeStream, InMemoryBus, MessageBus, Subscription};
pub use envelope::{EventEnvelope, EventEnvelopeBuilder, EventId};
pub use error::{BusError, Result};
pub use version::{SemVer, SemVerError, VersionRange};
