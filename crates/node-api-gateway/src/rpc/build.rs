//! `build_*` methods: chain facts a transaction builder needs.

use super::rpc_error;
use crate::domain::types::ChainTipResponse;
use crate::node::QueryFacade;
use crate::rest::AppState;
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use std::sync::Arc;
use tracing::instrument;

#[rpc(server, namespace = "build")]
pub trait BuildApi {
    /// The chain-sync tip as `{slot, height, hash}`.
    #[method(name = "getChainTip")]
    async fn get_chain_tip(&self) -> RpcResult<ChainTipResponse>;
}

pub struct BuildRpc {
    queries: Arc<QueryFacade>,
}

impl BuildRpc {
    pub fn new(state: &AppState) -> Self {
        Self {
            queries: Arc::clone(&state.queries),
        }
    }
}

#[async_trait]
impl BuildApiServer for BuildRpc {
    #[instrument(skip(self))]
    async fn get_chain_tip(&self) -> RpcResult<ChainTipResponse> {
        self.queries.chain_tip().await.map_err(rpc_error)
    }
}
