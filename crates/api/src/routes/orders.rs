//! Order placement, status and cancellation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{BuyerId, Currency, ListingId, Money, SagaId};
use saga::{BuyerStatus, CancelOutcome, OrderPayload, OrderSaga, OrderStatus, SagaStore};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub buyer_id: String,
    pub listing_id: String,
    /// Defaults to a single unit.
    pub quantity: Option<u32>,
    pub price_cents: i64,
    pub currency: String,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct OrderCreatedResponse {
    pub order_id: String,
    pub status: BuyerStatus,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub order_id: String,
    pub outcome: CancelOutcome,
}

// -- Handlers --

/// POST /orders — place an order and start its purchase saga.
#[tracing::instrument(
    skip(state, req),
    fields(buyer_id = %req.buyer_id, listing_id = %req.listing_id)
)]
pub async fn create<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderCreatedResponse>), ApiError> {
    let currency = Currency::parse(&req.currency)
        .map_err(|e| ApiError::BadRequest(format!("Invalid currency: {e}")))?;
    let payload = OrderPayload::new(
        BuyerId::new(req.buyer_id),
        ListingId::new(req.listing_id),
        req.quantity.unwrap_or(1),
        Money::from_cents(req.price_cents),
        currency,
    );

    let saga = state.coordinator.start_saga(payload).await?;
    let response = OrderCreatedResponse {
        order_id: saga.order_id().to_string(),
        status: OrderStatus::from(&saga).status,
    };

    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /orders/:id — buyer-facing status of an order.
#[tracing::instrument(skip(state))]
pub async fn get<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderStatus>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let status = state
        .coordinator
        .order_status(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))?;
    Ok(Json(status))
}

/// GET /orders/:id/saga — the full saga record, for operators.
#[tracing::instrument(skip(state))]
pub async fn saga<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderSaga>, ApiError> {
    let saga_id = parse_order_id(&id)?;
    let saga = state
        .coordinator
        .get_saga(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;
    Ok(Json(saga))
}

/// POST /orders/:id/cancel — ask for the order to be abandoned.
#[tracing::instrument(skip(state))]
pub async fn cancel<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let order_id = parse_order_id(&id)?;
    let outcome = state.coordinator.cancel(order_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            order_id: order_id.to_string(),
            outcome,
        }),
    ))
}

fn parse_order_id(id: &str) -> Result<SagaId, ApiError> {
    let uuid = uuid::Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))?;
    Ok(SagaId::from_uuid(uuid))
}
