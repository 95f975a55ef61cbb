//! Streaming JSON-RPC surface.
//!
//! One jsonrpsee service per namespace: `build`, `query`, `submit`, `sync`
//! and `watch`. Subscriptions are accepted before chain-sync starts and run
//! through a [`StreamResponder`](crate::responder::StreamResponder) whose
//! sink is the subscription itself.

pub mod build;
pub mod query;
pub mod submit;
pub mod sync;
pub mod watch;

pub use build::{BuildApiServer, BuildRpc};
pub use query::{QueryApiServer, QueryRpc};
pub use submit::{SubmitApiServer, SubmitRpc};
pub use sync::{SyncApiServer, SyncRpc};
pub use watch::{WatchApiServer, WatchRpc};

use crate::domain::config::RpcConfig;
use crate::domain::error::{ApiError, GatewayError, ServiceError};
use crate::domain::types::{hex_bytes, ChainPoint, TxHash};
use crate::responder::{SinkClosed, StreamSink};
use crate::rest::AppState;
use async_trait::async_trait;
use jsonrpsee::types::ErrorObjectOwned;
use jsonrpsee::{
    Methods, PendingSubscriptionSink, RpcModule, SubscriptionMessage, SubscriptionSink,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Every namespace merged into one module.
pub fn rpc_module(state: &AppState, config: &RpcConfig) -> Result<RpcModule<()>, ServiceError> {
    let services: [Methods; 5] = [
        BuildRpc::new(state).into_rpc().into(),
        QueryRpc::new(state).into_rpc().into(),
        SubmitRpc::new(state).into_rpc().into(),
        SyncRpc::new(state, config).into_rpc().into(),
        WatchRpc::new(state).into_rpc().into(),
    ];
    let mut module = RpcModule::new(());
    for methods in services {
        module
            .merge(methods)
            .map_err(|e| ServiceError::Server(format!("cannot register rpc methods: {e}")))?;
    }
    Ok(module)
}

pub(crate) fn rpc_error(e: GatewayError) -> ErrorObjectOwned {
    ApiError::from(e).into()
}

/// Refuse a subscription that failed before it was accepted.
pub(crate) async fn reject(pending: PendingSubscriptionSink, e: GatewayError) {
    debug!(error = %e, "subscription refused");
    pending.reject(rpc_error(e)).await;
}

/// A chain point as the RPC services name it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub index: u64,
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
}

impl From<BlockRef> for ChainPoint {
    fn from(r: BlockRef) -> Self {
        ChainPoint::new(r.index, r.hash)
    }
}

impl From<ChainPoint> for BlockRef {
    fn from(p: ChainPoint) -> Self {
        Self {
            index: p.slot,
            hash: p.hash,
        }
    }
}

/// Transaction filter of the watch subscriptions. No hashes means everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TxPredicate {
    #[serde(default)]
    pub hashes: Option<Vec<TxHash>>,
}

impl TxPredicate {
    pub fn matches(&self, hash: &TxHash) -> bool {
        self.hashes.as_ref().map_or(true, |hashes| hashes.contains(hash))
    }
}

/// Subscription side of a stream.
pub struct RpcSink {
    sink: SubscriptionSink,
}

impl RpcSink {
    pub fn new(sink: SubscriptionSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl StreamSink for RpcSink {
    async fn send(&mut self, item: serde_json::Value) -> Result<(), SinkClosed> {
        let message = SubscriptionMessage::from_json(&item).map_err(|_| SinkClosed)?;
        self.sink.send(message).await.map_err(|_| SinkClosed)
    }

    /// The error reaches the client as the subscription's closing
    /// notification, built from the method's return value.
    async fn send_error(&mut self, error: &GatewayError) {
        debug!(method = self.sink.method_name(), error = %error, "closing subscription with error");
    }

    async fn closed(&mut self) {
        self.sink.closed().await
    }
}
