//! Buyer-facing view of a saga.

use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::instance::OrderSaga;
use crate::order_purchase::BUYER_FAILURE_MESSAGE;
use crate::state::SagaState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuyerStatus {
    Processing,
    Confirmed,
    Failed,
}

/// What a buyer sees about their order. Never carries internal error detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_id: SagaId,
    pub status: BuyerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&OrderSaga> for OrderStatus {
    fn from(saga: &OrderSaga) -> Self {
        match saga.state() {
            SagaState::Completed => Self {
                order_id: saga.order_id(),
                status: BuyerStatus::Confirmed,
                reason_code: None,
                message: None,
            },
            SagaState::Failed => Self {
                order_id: saga.order_id(),
                status: BuyerStatus::Failed,
                reason_code: saga.failure().map(|f| f.reason_code.clone()),
                message: Some(BUYER_FAILURE_MESSAGE.to_string()),
            },
            _ => Self {
                order_id: saga.order_id(),
                status: BuyerStatus::Processing,
                reason_code: None,
                message: None,
            },
        }
    }
}
