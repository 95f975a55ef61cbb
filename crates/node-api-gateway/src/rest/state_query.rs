//! `/api/localstatequery/*` handlers.

use super::AppState;
use crate::domain::error::GatewayResult;
use crate::domain::types::{CurrentEraResponse, SystemStartResponse, TipResponse};
use axum::extract::State;
use axum::Json;

pub async fn current_era(State(state): State<AppState>) -> GatewayResult<Json<CurrentEraResponse>> {
    state.queries.current_era().await.map(Json)
}

pub async fn system_start(
    State(state): State<AppState>,
) -> GatewayResult<Json<SystemStartResponse>> {
    state.queries.system_start().await.map(Json)
}

/// Era, epoch, block number and chain point from one ledger snapshot.
pub async fn tip(State(state): State<AppState>) -> GatewayResult<Json<TipResponse>> {
    state.queries.tip().await.map(Json)
}

pub async fn era_history(State(state): State<AppState>) -> GatewayResult<Json<serde_json::Value>> {
    state.queries.era_history().await.map(Json)
}

pub async fn protocol_params(
    State(state): State<AppState>,
) -> GatewayResult<Json<serde_json::Value>> {
    state.queries.protocol_params().await.map(Json)
}
