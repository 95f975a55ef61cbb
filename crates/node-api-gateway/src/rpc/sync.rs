//! `sync_*` methods: block fetch, paged history and tip following.

use super::{reject, rpc_error, BlockRef, RpcSink};
use crate::domain::config::RpcConfig;
use crate::domain::error::{GatewayError, GatewayResult};
use crate::domain::types::ChainPoint;
use crate::node::{
    BlockSummary, EventStream, FollowFrom, PreparedFollow, ProtocolEvent, ScopedSession,
    SessionManager,
};
use crate::responder::StreamResponder;
use crate::rest::AppState;
use jsonrpsee::core::{async_trait, RpcResult, SubscriptionResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::PendingSubscriptionSink;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchBlockResponse {
    pub blocks: Vec<BlockSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpHistoryResponse {
    pub blocks: Vec<BlockSummary>,
    /// Where the next page starts, absent once the tip is reached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<BlockRef>,
}

#[rpc(server, namespace = "sync")]
pub trait SyncApi {
    /// Blocks at the given points, or the tip block when none are given.
    #[method(name = "fetchBlock")]
    async fn fetch_block(&self, refs: Option<Vec<BlockRef>>) -> RpcResult<FetchBlockResponse>;

    /// Up to `max_items` blocks from `start_token` on (from origin when absent).
    /// `max_items` is clamped to the configured page limit.
    #[method(name = "dumpHistory")]
    async fn dump_history(
        &self,
        start_token: Option<BlockRef>,
        max_items: u32,
    ) -> RpcResult<DumpHistoryResponse>;

    /// `apply` / `reset` actions from the intersection (or tip) onwards.
    #[subscription(name = "followTip" => "followTipItem", unsubscribe = "unfollowTip", item = serde_json::Value)]
    async fn follow_tip(&self, intersect: Option<Vec<BlockRef>>) -> SubscriptionResult;
}

pub struct SyncRpc {
    sessions: Arc<SessionManager>,
    max_page_items: u32,
}

impl SyncRpc {
    pub fn new(state: &AppState, config: &RpcConfig) -> Self {
        Self {
            sessions: Arc::clone(&state.sessions),
            max_page_items: config.max_page_items,
        }
    }
}

async fn fetch(session: &ScopedSession, refs: Vec<BlockRef>) -> GatewayResult<Vec<BlockSummary>> {
    let points: Vec<ChainPoint> = if refs.is_empty() {
        let tip = session.call(session.chain_sync().current_tip()).await?;
        if tip.point.is_origin() {
            return Ok(Vec::new());
        }
        vec![tip.point]
    } else {
        refs.into_iter().map(ChainPoint::from).collect()
    };

    let mut blocks = Vec::with_capacity(points.len());
    for point in &points {
        let block = session.call(session.block_fetch().block(point)).await?;
        blocks.push(block.summary());
    }
    Ok(blocks)
}

/// Next event within the call deadline, cut short if the session faults.
async fn next_event(session: &ScopedSession, events: &mut EventStream) -> GatewayResult<Option<ProtocolEvent>> {
    match session.call(async { Ok(events.next_event().await) }).await? {
        Some(ProtocolEvent::SessionError { cause }) => Err(cause),
        other => Ok(other),
    }
}

/// One history page. `start` is inclusive, so a returned `next_token` can
/// be passed back as the next page's start.
async fn dump(
    session: &ScopedSession,
    events: &mut EventStream,
    start: Option<ChainPoint>,
    max_items: usize,
) -> GatewayResult<DumpHistoryResponse> {
    let from = start.clone().unwrap_or_else(ChainPoint::origin);
    let intersect = vec![from.clone()];
    let range = session
        .call(session.chain_sync().available_block_range(intersect.clone()))
        .await?;

    let mut blocks = Vec::new();
    if let Some(point) = &start {
        let block = session.call(session.block_fetch().block(point)).await?;
        blocks.push(block.summary());
    }
    if range.end == from {
        debug!(start = %from, "history range is empty");
        return Ok(DumpHistoryResponse {
            blocks,
            next_token: None,
        });
    }

    events.sync(session, intersect).await?;
    while blocks.len() < max_items {
        match next_event(session, events).await? {
            Some(ProtocolEvent::RollForward { block, tip }) => {
                // The node tip may have moved below the range end after a rollback.
                let at_end = block.point() == range.end || block.point() == tip.point;
                blocks.push(block.summary());
                if at_end {
                    return Ok(DumpHistoryResponse {
                        blocks,
                        next_token: None,
                    });
                }
            }
            Some(_) => {}
            None => {
                return Ok(DumpHistoryResponse {
                    blocks,
                    next_token: None,
                })
            }
        }
    }

    let next_token = loop {
        match next_event(session, events).await? {
            Some(ProtocolEvent::RollForward { block, .. }) => break Some(block.point().into()),
            Some(_) => {}
            None => break None,
        }
    };
    Ok(DumpHistoryResponse { blocks, next_token })
}

pub fn render_follow(event: ProtocolEvent) -> Option<serde_json::Value> {
    match event {
        ProtocolEvent::RollForward { block, .. } => Some(serde_json::json!({
            "action": "apply",
            "block": block.summary(),
        })),
        ProtocolEvent::RollBackward { point, .. } => Some(serde_json::json!({
            "action": "reset",
            "point": BlockRef::from(point),
        })),
        ProtocolEvent::SessionError { .. } => None,
    }
}

#[async_trait]
impl SyncApiServer for SyncRpc {
    #[instrument(skip(self, refs))]
    async fn fetch_block(&self, refs: Option<Vec<BlockRef>>) -> RpcResult<FetchBlockResponse> {
        let session = self.sessions.open().await.map_err(rpc_error)?;
        let blocks = fetch(&session, refs.unwrap_or_default()).await;
        let blocks = session.finish(blocks).await.map_err(rpc_error)?;
        Ok(FetchBlockResponse { blocks })
    }

    #[instrument(skip(self, start_token))]
    async fn dump_history(
        &self,
        start_token: Option<BlockRef>,
        max_items: u32,
    ) -> RpcResult<DumpHistoryResponse> {
        if max_items == 0 {
            return Err(rpc_error(GatewayError::malformed("max_items must be positive")));
        }
        let page_items = max_items.min(self.max_page_items);
        if page_items < max_items {
            warn!(requested = max_items, served = page_items, "history page clamped");
        }
        let start = start_token
            .map(ChainPoint::from)
            .filter(|point| !point.is_origin());
        let (session, mut events) = self.sessions.open_bridged().await.map_err(rpc_error)?;
        let page = dump(&session, &mut events, start, page_items as usize).await;
        let page = session.finish(page).await.map_err(rpc_error)?;
        info!(blocks = page.blocks.len(), more = page.next_token.is_some(), "history page served");
        Ok(page)
    }

    async fn follow_tip(
        &self,
        pending: PendingSubscriptionSink,
        intersect: Option<Vec<BlockRef>>,
    ) -> SubscriptionResult {
        let from = match intersect {
            Some(points) if !points.is_empty() => {
                FollowFrom::Points(points.into_iter().map(ChainPoint::from).collect())
            }
            _ => FollowFrom::Tip,
        };
        let mut prepared = match self.sessions.prepare_follow(from).await {
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
            session, events, ..
        } = prepared;
        let end = StreamResponder::new(&session, events, RpcSink::new(sink))
            .run(render_follow)
            .await;
        session.finish(end).await.into_result()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Tip;
    use crate::node::NodeError;

    #[test]
    fn test_follow_reset_uses_block_ref() {
        let item = render_follow(ProtocolEvent::RollBackward {
            point: ChainPoint::new(20, vec![0xaa]),
            tip: Tip::new(ChainPoint::new(40, vec![0xbb]), 2),
        })
        .unwrap();
        assert_eq!(item, serde_json::json!({"action": "reset", "point": {"index": 20, "hash": "aa"}}));
    }

    #[test]
    fn test_follow_skips_error_events() {
        let item = render_follow(ProtocolEvent::SessionError {
            cause: GatewayError::Session(NodeError::SessionClosed),
        });
        assert!(item.is_none());
    }
}
