//! Liveness endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga::SagaStore;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// `postgres` or `memory`.
    pub store: &'static str,
}

/// GET /health
pub async fn check<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        store: state.store_backend,
    })
}
