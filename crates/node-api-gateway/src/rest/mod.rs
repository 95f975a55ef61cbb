//! REST surface: state queries, mempool inspection, submission and the
//! chain-sync WebSocket, all under `/api`.

pub mod state_query;
pub mod tx_monitor;
pub mod tx_submission;

use crate::domain::config::GatewayConfig;
use crate::domain::error::GatewayError;
use crate::middleware::{create_cors_layer, GatewayMetrics, TracingLayer};
use crate::node::{QueryFacade, SessionManager, SubmissionCoordinator};
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub queries: Arc<QueryFacade>,
    pub submissions: Arc<SubmissionCoordinator>,
    pub metrics: Arc<GatewayMetrics>,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            queries: Arc::new(QueryFacade::new(Arc::clone(&sessions))),
            submissions: Arc::new(SubmissionCoordinator::new(Arc::clone(&sessions))),
            metrics: Arc::clone(sessions.metrics()),
            sessions,
        }
    }
}

/// Routes without middleware, relative to `/api`.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/localstatequery/current-era", get(state_query::current_era))
        .route("/localstatequery/system-start", get(state_query::system_start))
        .route("/localstatequery/tip", get(state_query::tip))
        .route("/localstatequery/era-history", get(state_query::era_history))
        .route("/localstatequery/protocol-params", get(state_query::protocol_params))
        .route("/localtxmonitor/sizes", get(tx_monitor::sizes))
        .route("/localtxmonitor/has_tx/:tx_hash", get(tx_monitor::has_tx))
        .route("/localtxmonitor/txs", get(tx_monitor::txs))
        .route("/localtxsubmission/tx", post(tx_submission::submit_tx))
        .route("/chainsync/sync", get(crate::ws::chain_sync))
}

/// The full REST router with the middleware stack from `config`.
pub fn router(state: AppState, config: &GatewayConfig) -> Router {
    let metrics = Arc::clone(&state.metrics);

    Router::new()
        .nest("/api", api_routes())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.limits.max_body_size))
        .layer(TimeoutLayer::new(config.limits.request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer(&config.cors))
        .layer(TracingLayer::new(metrics))
        .with_state(state)
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Connection(_) | GatewayError::Session(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Rejected(_) | GatewayError::Malformed(_) => StatusCode::BAD_REQUEST,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "kind": self.kind(),
            "error": self.to_string(),
        });
        if let GatewayError::Rejected(reason) = &self {
            body["reason"] = reason.display().into();
            body["reason_cbor"] = hex::encode(reason.as_bytes()).into();
        }
        (self.status_code(), Json(body)).into_response()
    }
}
