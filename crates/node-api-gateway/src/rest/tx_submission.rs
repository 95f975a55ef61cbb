//! `POST /api/localtxsubmission/tx`: raw CBOR in, hash or rejection out.

use super::AppState;
use crate::domain::error::GatewayError;
use crate::node::SubmissionOutcome;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use tracing::debug;

pub const CBOR_CONTENT_TYPE: &str = "application/cbor";

fn header_has(headers: &HeaderMap, name: header::HeaderName, value: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|part| part.trim().starts_with(value)))
}

pub async fn submit_tx(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !header_has(&headers, header::CONTENT_TYPE, CBOR_CONTENT_TYPE) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Json(serde_json::json!({
                "kind": "malformed",
                "error": format!("content type must be {CBOR_CONTENT_TYPE}"),
            })),
        )
            .into_response();
    }

    match state.submissions.submit(&body).await {
        SubmissionOutcome::Accepted { tx_hash } => {
            (StatusCode::ACCEPTED, Json(tx_hash)).into_response()
        }
        SubmissionOutcome::Rejected { reason } => {
            if header_has(&headers, header::ACCEPT, CBOR_CONTENT_TYPE) {
                debug!("returning raw rejection reason");
                (
                    StatusCode::BAD_REQUEST,
                    [(header::CONTENT_TYPE, CBOR_CONTENT_TYPE)],
                    reason.to_bytes(),
                )
                    .into_response()
            } else {
                GatewayError::Rejected(reason).into_response()
            }
        }
        SubmissionOutcome::TransportFailure { cause } => cause.into_response(),
        SubmissionOutcome::Malformed { reason } => GatewayError::Malformed(reason).into_response(),
    }
}
