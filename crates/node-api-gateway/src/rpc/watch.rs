//! `watch_*` methods: transactions as they land in blocks.

use super::{reject, RpcSink, TxPredicate};
use crate::domain::error::GatewayResult;
use crate::domain::types::{ChainPoint, TxHash};
use crate::node::{EventStream, FollowFrom, PreparedFollow, ProtocolEvent, SessionManager};
use crate::responder::{EventSource, StreamResponder};
use crate::rest::AppState;
use crate::ledger;
use async_trait::async_trait;
use bytes::Bytes;
use jsonrpsee::core::SubscriptionResult;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::PendingSubscriptionSink;
use std::collections::VecDeque;
use std::sync::Arc;

#[rpc(server, namespace = "watch")]
pub trait WatchApi {
    /// Every block transaction matching `predicate`, from the tip onwards.
    #[subscription(name = "watchTx" => "watchTxItem", unsubscribe = "unwatchTx", item = serde_json::Value)]
    async fn watch_tx(&self, predicate: Option<TxPredicate>) -> SubscriptionResult;
}

pub struct WatchRpc {
    sessions: Arc<SessionManager>,
}

impl WatchRpc {
    pub fn new(state: &AppState) -> Self {
        Self {
            sessions: Arc::clone(&state.sessions),
        }
    }
}

/// A matching transaction and the block it came in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTx {
    pub hash: TxHash,
    pub raw: Bytes,
    pub block: ChainPoint,
}

impl BlockTx {
    pub fn render(&self) -> serde_json::Value {
        serde_json::json!({
            "action": "apply",
            "tx": {
                "hash": self.hash,
                "raw": hex::encode(&self.raw),
            },
            "block": {
                "slot": self.block.slot,
                "hash": hex::encode(&self.block.hash),
            },
        })
    }
}

/// Flattens rolled-forward blocks into their matching transactions.
pub struct TxWatch<'a> {
    events: &'a mut EventStream,
    predicate: TxPredicate,
    pending: VecDeque<BlockTx>,
}

impl<'a> TxWatch<'a> {
    pub fn new(events: &'a mut EventStream, predicate: TxPredicate) -> Self {
        Self {
            events,
            predicate,
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl<'a> EventSource for TxWatch<'a> {
    type Item = BlockTx;

    async fn next_item(&mut self) -> GatewayResult<Option<BlockTx>> {
        loop {
            if let Some(tx) = self.pending.pop_front() {
                return Ok(Some(tx));
            }
            let Some(event) = self.events.next_item().await? else {
                return Ok(None);
            };
            if let ProtocolEvent::RollForward { block, .. } = event {
                let point = block.point();
                for raw in block.transactions {
                    let Ok(hash) = ledger::tx_hash(&raw) else { continue };
                    if self.predicate.matches(&hash) {
                        self.pending.push_back(BlockTx {
                            hash,
                            raw,
                            block: point.clone(),
                        });
                    }
                }
            }
        }
    }
}

#[async_trait]
impl WatchApiServer for WatchRpc {
    async fn watch_tx(
        &self,
        pending: PendingSubscriptionSink,
        predicate: Option<TxPredicate>,
    ) -> SubscriptionResult {
        let mut prepared = match self.sessions.prepare_follow(FollowFrom::Tip).await {
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
        let watch = TxWatch::new(&mut events, predicate.unwrap_or_default());
        let end = StreamResponder::new(&session, watch, RpcSink::new(sink))
            .run(|tx| Some(tx.render()))
            .await;
        session.finish(end).await.into_result()?;
        Ok(())
    }
}
