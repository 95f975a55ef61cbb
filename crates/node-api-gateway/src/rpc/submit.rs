//! `submit_*` methods: submission, mempool reads and confirmation waits.

use super::{reject, rpc_error, RpcSink, TxPredicate};
use crate::domain::error::{codes, ApiError, ErrorKind, GatewayError, GatewayResult};
use crate::node::{
    BatchOutcome, ConfirmationWatch, MempoolEntry, MempoolWatch, PreparedFollow, SessionManager,
    SubmissionCoordinator, SubmissionOutcome, TrackedRef,
};
use crate::responder::StreamResponder;
use crate::rest::AppState;
use bytes::Bytes;
use jsonrpsee::core::{async_trait, RpcResult, SubscriptionResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::PendingSubscriptionSink;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitTxResponse {
    pub refs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Mempool,
    Unspecified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadMempoolResponse {
    pub stages: Vec<Stage>,
}

#[rpc(server, namespace = "submit")]
pub trait SubmitApi {
    /// Submit hex-encoded transactions, each independently.
    #[method(name = "submitTx")]
    async fn submit_tx(&self, txs: Vec<String>) -> RpcResult<SubmitTxResponse>;

    /// Whether each reference is currently in the mempool.
    #[method(name = "readMempool")]
    async fn read_mempool(&self, txs: Vec<String>) -> RpcResult<ReadMempoolResponse>;

    /// One `confirmed` item per reference once it appears in a block.
    #[subscription(name = "waitForTx" => "waitForTxItem", unsubscribe = "unwaitForTx", item = serde_json::Value)]
    async fn wait_for_tx(&self, refs: Vec<String>) -> SubscriptionResult;

    /// Transactions entering the mempool.
    #[subscription(name = "watchMempool" => "watchMempoolItem", unsubscribe = "unwatchMempool", item = serde_json::Value)]
    async fn watch_mempool(&self, predicate: Option<TxPredicate>) -> SubscriptionResult;
}

pub struct SubmitRpc {
    sessions: Arc<SessionManager>,
    submissions: Arc<SubmissionCoordinator>,
}

impl SubmitRpc {
    pub fn new(state: &AppState) -> Self {
        Self {
            sessions: Arc::clone(&state.sessions),
            submissions: Arc::clone(&state.submissions),
        }
    }
}

fn decode_refs(refs: &[String]) -> GatewayResult<Vec<TrackedRef>> {
    refs.iter()
        .map(|r| TrackedRef::from_bytes(hex::decode(r.trim_start_matches("0x"))?))
        .collect()
}

/// Submit every decodable input as one batch and slot hex failures back in.
async fn submit_hex(submissions: &SubmissionCoordinator, txs: &[String]) -> BatchOutcome {
    let decoded: Vec<Result<Bytes, GatewayError>> = txs
        .iter()
        .map(|tx| {
            hex::decode(tx.trim_start_matches("0x"))
                .map(Bytes::from)
                .map_err(GatewayError::from)
        })
        .collect();
    let valid: Vec<Bytes> = decoded.iter().filter_map(|d| d.as_ref().ok().cloned()).collect();
    let mut submitted = submissions.submit_batch(&valid).await.slots.into_iter();

    let slots = decoded
        .into_iter()
        .map(|d| match d {
            Ok(_) => submitted.next().unwrap_or_else(|| SubmissionOutcome::TransportFailure {
                cause: GatewayError::Session(crate::node::NodeError::Protocol(
                    "missing batch slot".into(),
                )),
            }),
            Err(e) => SubmissionOutcome::Malformed {
                reason: e.to_string(),
            },
        })
        .collect();
    BatchOutcome { slots }
}

fn batch_error(batch: &BatchOutcome) -> ApiError {
    let kind = batch.failure_kind().unwrap_or(ErrorKind::Session);
    let code = match kind {
        ErrorKind::Rejected => codes::TRANSACTION_REJECTED,
        ErrorKind::Malformed => codes::INVALID_PARAMS,
        ErrorKind::Timeout => codes::TIMEOUT,
        ErrorKind::Connection | ErrorKind::Session => codes::NODE_UNAVAILABLE,
        ErrorKind::Configuration => codes::INTERNAL_ERROR,
    };
    let failed = batch.slots.iter().filter(|s| !s.is_accepted()).count();
    ApiError::with_data(
        code,
        format!("{failed} of {} transactions failed", batch.slots.len()),
        serde_json::json!({
            "kind": kind,
            "refs": batch.refs(),
            "outcomes": batch.slots,
        }),
    )
}

#[async_trait]
impl SubmitApiServer for SubmitRpc {
    #[instrument(skip(self, txs), fields(count = txs.len()))]
    async fn submit_tx(&self, txs: Vec<String>) -> RpcResult<SubmitTxResponse> {
        let batch = submit_hex(&self.submissions, &txs).await;
        if batch.is_success() {
            Ok(SubmitTxResponse { refs: batch.refs() })
        } else {
            Err(batch_error(&batch).into())
        }
    }

    #[instrument(skip(self, txs), fields(count = txs.len()))]
    async fn read_mempool(&self, txs: Vec<String>) -> RpcResult<ReadMempoolResponse> {
        let tracked = decode_refs(&txs).map_err(rpc_error)?;
        let entries = self.sessions.mempool_snapshot().await.map_err(rpc_error)?;
        let in_mempool = entries
            .iter()
            .map(MempoolEntry::hash)
            .collect::<GatewayResult<HashSet<_>>>()
            .map_err(rpc_error)?;

        let stages = tracked
            .iter()
            .map(|t| {
                if in_mempool.contains(&t.hash) {
                    Stage::Mempool
                } else {
                    Stage::Unspecified
                }
            })
            .collect();
        Ok(ReadMempoolResponse { stages })
    }

    async fn wait_for_tx(
        &self,
        pending: PendingSubscriptionSink,
        refs: Vec<String>,
    ) -> SubscriptionResult {
        let tracked = match decode_refs(&refs) {
            Ok(tracked) => tracked,
            Err(e) => {
                reject(pending, e).await;
                return Ok(());
            }
        };
        let mut prepared = match self.submissions.prepare_confirmation().await {
            Ok(prepared) => prepared,
            Err(e) => {
                reject(pending, e).await;
                return Ok(());
            }
        };
        let sink = pending.accept().await?;

        if let Err(e) = prepared.begin().await {
            return Err(prepared.session.finish(e).await.into());
        }
        let PreparedFollow {
            session,
            mut events,
            ..
        } = prepared;
        info!(session = %session.id(), refs = tracked.len(), "waiting for confirmations");

        let watch = ConfirmationWatch::new(&mut events, tracked);
        let end = StreamResponder::new(&session, watch, RpcSink::new(sink))
            .run(|confirmation| {
                Some(serde_json::json!({
                    "ref": hex::encode(&confirmation.reference),
                    "stage": "confirmed",
                }))
            })
            .await;
        session.finish(end).await.into_result()?;
        Ok(())
    }

    async fn watch_mempool(
        &self,
        pending: PendingSubscriptionSink,
        predicate: Option<TxPredicate>,
    ) -> SubscriptionResult {
        let predicate = predicate.unwrap_or_default();
        let session = match self.sessions.open().await {
            Ok(session) => session,
            Err(e) => {
                reject(pending, e).await;
                return Ok(());
            }
        };
        let sink = pending.accept().await?;

        let watch = match MempoolWatch::start(&session).await {
            Ok(watch) => watch,
            Err(e) => return Err(session.finish(e).await.into()),
        };
        let end = StreamResponder::new(&session, watch, RpcSink::new(sink))
            .run(|entry| {
                let hash = entry.hash().ok()?;
                if !predicate.matches(&hash) {
                    return None;
                }
                Some(serde_json::json!({
                    "tx": {
                        "raw": hex::encode(entry.raw()),
                        "hash": hash,
                        "kind": entry.kind().ok()?.name(),
                        "stage": "mempool",
                    }
                }))
            })
            .await;
        session.finish(end).await.into_result()?;
        Ok(())
    }
}
