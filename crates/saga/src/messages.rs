//! Payloads of the commands and events exchanged by the order purchase saga.
//!
//! Commands are addressed to a capability and always carry the idempotency
//! key of the attempt. Replies are decoded into [`SagaReply`], a tagged union
//! over the declared reply types.

use common::{BuyerId, Currency, ListingId, Money, SagaId};
use messaging::{EventEnvelope, event_types};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::order_purchase::SUPPORTED_VERSIONS;
use crate::step::StepName;

// Commands

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveInventory {
    pub saga_id: SagaId,
    pub listing_id: ListingId,
    pub quantity: u32,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargePayment {
    pub saga_id: SagaId,
    pub buyer_id: BuyerId,
    pub amount: Money,
    pub currency: Currency,
    pub idempotency_key: String,
}

/// Undoes every reservation attempt of a saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInventory {
    pub saga_id: SagaId,
    pub listing_id: ListingId,
    pub quantity: u32,
    pub reservation_id: Option<String>,
    /// Idempotency keys of every reservation attempt.
    pub reserve_keys: Vec<String>,
    pub idempotency_key: String,
}

/// Undoes every charge attempt of a saga, including ones never answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundPayment {
    pub saga_id: SagaId,
    pub buyer_id: BuyerId,
    pub amount: Money,
    pub currency: Currency,
    pub payment_id: Option<String>,
    /// Idempotency keys of every charge attempt.
    pub charge_keys: Vec<String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderOutcome {
    Confirmed,
    Failed,
}

/// Fire-and-forget buyer notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyBuyer {
    pub order_id: SagaId,
    pub buyer_id: BuyerId,
    pub outcome: OrderOutcome,
    pub reason_code: Option<String>,
    pub idempotency_key: String,
}

// Outcome events

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaCreated {
    pub order_id: SagaId,
    pub buyer_id: BuyerId,
    pub listing_id: ListingId,
    pub quantity: u32,
    pub price: Money,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: SagaId,
    pub reservation_id: Option<String>,
    pub payment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFailed {
    pub order_id: SagaId,
    pub reason_code: String,
}

// Replies

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReserved {
    pub reservation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSucceeded {
    pub payment_id: String,
}

/// Body of every `…failed` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRejected {
    pub reason_code: String,
    pub reason: String,
}

impl StepRejected {
    pub fn new(reason_code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.into(),
            reason: reason.into(),
        }
    }
}

/// Acknowledgement with no data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledged {}

/// Terminal status reported by the payment provider's webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Succeeded,
    Failed,
}

/// Asynchronous charge confirmation, keyed by the charge's idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentWebhook {
    pub idempotency_key: String,
    pub status: WebhookStatus,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A reply the orchestrator consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaReply {
    InventoryReserved(InventoryReserved),
    InventoryReservationFailed(StepRejected),
    InventoryReleased,
    InventoryReleaseFailed(StepRejected),
    PaymentSucceeded(PaymentSucceeded),
    PaymentFailed(StepRejected),
    PaymentRefunded,
    PaymentRefundFailed(StepRejected),
}

impl SagaReply {
    /// Decodes a reply envelope, rejecting unsupported versions and unknown types.
    pub fn decode(envelope: &EventEnvelope) -> Result<Self, ProtocolError> {
        ensure_supported(envelope)?;
        let reply = match envelope.event_type.as_str() {
            event_types::INVENTORY_RESERVED => SagaReply::InventoryReserved(data(envelope)?),
            event_types::INVENTORY_RESERVATION_FAILED => {
                SagaReply::InventoryReservationFailed(data(envelope)?)
            }
            event_types::INVENTORY_RELEASED => SagaReply::InventoryReleased,
            event_types::INVENTORY_RELEASE_FAILED => {
                SagaReply::InventoryReleaseFailed(data(envelope)?)
            }
            event_types::PAYMENT_SUCCEEDED => SagaReply::PaymentSucceeded(data(envelope)?),
            event_types::PAYMENT_FAILED => SagaReply::PaymentFailed(data(envelope)?),
            event_types::PAYMENT_REFUNDED => SagaReply::PaymentRefunded,
            event_types::PAYMENT_REFUND_FAILED => SagaReply::PaymentRefundFailed(data(envelope)?),
            other => return Err(ProtocolError::UnknownEventType(other.to_string())),
        };
        Ok(reply)
    }

    /// The step this reply answers.
    pub fn step(&self) -> StepName {
        match self {
            SagaReply::InventoryReserved(_) | SagaReply::InventoryReservationFailed(_) => {
                StepName::Reservation
            }
            SagaReply::PaymentSucceeded(_) | SagaReply::PaymentFailed(_) => StepName::Payment,
            SagaReply::InventoryReleased | SagaReply::InventoryReleaseFailed(_) => {
                StepName::ReleaseInventory
            }
            SagaReply::PaymentRefunded | SagaReply::PaymentRefundFailed(_) => {
                StepName::RefundPayment
            }
        }
    }
}

/// Fails closed on any version outside the supported range.
pub fn ensure_supported(envelope: &EventEnvelope) -> Result<(), ProtocolError> {
    if SUPPORTED_VERSIONS.contains(&envelope.event_version) {
        Ok(())
    } else {
        Err(ProtocolError::UnsupportedVersion {
            event_type: envelope.event_type.clone(),
            version: envelope.event_version,
        })
    }
}

/// Decodes an envelope's data, mapping schema mismatches to a protocol error.
pub fn data<T: DeserializeOwned>(envelope: &EventEnvelope) -> Result<T, ProtocolError> {
    envelope
        .decode()
        .map_err(|e| ProtocolError::MalformedData {
            event_type: envelope.event_type.clone(),
            reason: e.to_string(),
        })
}
