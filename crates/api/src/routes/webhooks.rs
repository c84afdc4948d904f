//! Payment provider callbacks.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga::{HandleOutcome, PaymentWebhook, SagaState, SagaStore};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// `applied` or `ignored`.
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SagaState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// POST /webhooks/payment — asynchronous charge confirmation.
///
/// Duplicate and late callbacks are acknowledged without effect so the
/// provider stops retrying them.
#[tracing::instrument(skip(state, webhook), fields(idempotency_key = %webhook.idempotency_key))]
pub async fn payment<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(webhook): Json<PaymentWebhook>,
) -> Result<Json<WebhookResponse>, ApiError> {
    match state.coordinator.handle_payment_webhook(webhook).await? {
        HandleOutcome::Applied { state } => Ok(Json(WebhookResponse {
            outcome: "applied",
            state: Some(state),
            reason: None,
        })),
        HandleOutcome::Ignored(reason) => Ok(Json(WebhookResponse {
            outcome: "ignored",
            state: None,
            reason: Some(reason.as_str()),
        })),
        HandleOutcome::Rejected(reason) => Err(ApiError::BadRequest(reason)),
        HandleOutcome::Deferred(reason) => Err(ApiError::Unavailable(reason)),
    }
}
