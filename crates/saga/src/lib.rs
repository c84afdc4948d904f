//! Order purchase saga.
//!
//! A purchase reserves inventory, then charges the buyer. If either step
//! fails, the steps that already happened are compensated in reverse order.
//!
//! The saga is an explicit, persisted state machine driven by asynchronous
//! replies:
//! - [`Orchestrator`] is the pure transition function,
//! - [`SagaCoordinator`] loads sagas, applies the orchestrator and stores the
//!   result together with its outbox using compare-and-swap,
//! - [`OutboxRelay`], [`TimeoutSweeper`] and [`SagaWorker`] run in the
//!   background to publish commands, enforce deadlines and consume replies,
//! - the [`services`] module holds the capabilities the saga drives and the
//!   adapters that execute its commands idempotently.

pub mod compensation;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod instance;
pub mod messages;
pub mod orchestrator;
pub mod order_purchase;
pub mod relay;
pub mod retry;
pub mod services;
pub mod state;
pub mod status;
pub mod step;
pub mod store;
pub mod sweeper;
pub mod worker;

pub use compensation::{Compensation, CompensationRegistry};
pub use config::SagaConfig;
pub use coordinator::{HandleOutcome, SagaCoordinator, SweepReport};
pub use error::{AdapterError, ProtocolError, SagaError};
pub use instance::{Failure, OrderPayload, OrderSaga, SagaContext, StateChange};
pub use messages::{PaymentWebhook, WebhookStatus};
pub use orchestrator::{
    CancelOutcome, Decision, DeadlineAction, IgnoreReason, Orchestrator, Transition,
};
pub use relay::{OutboxRelay, RelayReport};
pub use retry::RetryConfig;
pub use services::{
    Ack, CapabilityAdapter, CapabilityError, ChargeOutcome, CommandDispatcher,
    InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
    InventoryAdapter, InventoryCapability, NotificationAdapter, NotificationCapability,
    PaymentAdapter, PaymentCapability,
};
pub use state::SagaState;
pub use status::{BuyerStatus, OrderStatus};
pub use step::{StepName, StepRecord, StepStatus};
pub use store::{InMemorySagaStore, PostgresSagaStore, SagaStore, StoreError};
pub use sweeper::TimeoutSweeper;
pub use worker::{SagaWorker, spawn_workers};
