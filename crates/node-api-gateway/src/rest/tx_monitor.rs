//! `/api/localtxmonitor/*` handlers. Each request works on one mempool snapshot.

use super::AppState;
use crate::domain::error::{GatewayError, GatewayResult};
use crate::domain::types::{HasTxResponse, MempoolSizesResponse, MempoolTxResponse, TxHash};
use axum::extract::{Path, State};
use axum::Json;

pub async fn sizes(State(state): State<AppState>) -> GatewayResult<Json<MempoolSizesResponse>> {
    let sizes = state.sessions.mempool_sizes().await?;
    Ok(Json(MempoolSizesResponse {
        capacity: sizes.capacity,
        size: sizes.size,
        tx_count: sizes.tx_count,
    }))
}

pub async fn has_tx(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> GatewayResult<Json<HasTxResponse>> {
    let hash: TxHash = tx_hash
        .parse()
        .map_err(|e| GatewayError::Malformed(format!("invalid tx hash {tx_hash:?}: {e}")))?;
    let has_tx = state.sessions.mempool_contains(hash).await?;
    Ok(Json(HasTxResponse { has_tx }))
}

/// Every transaction of the current snapshot, in node order.
pub async fn txs(State(state): State<AppState>) -> GatewayResult<Json<Vec<MempoolTxResponse>>> {
    let entries = state.sessions.mempool_snapshot().await?;
    entries
        .iter()
        .map(|entry| {
            Ok(MempoolTxResponse {
                tx_hash: entry.hash()?.to_hex(),
                tx_bytes: hex::encode(entry.raw()),
            })
        })
        .collect::<GatewayResult<Vec<_>>>()
        .map(Json)
}
