//! `query_*` methods: ledger state reads.

use super::rpc_error;
use crate::domain::types::TxHash;
use crate::node::{ParamsResponse, QueryFacade, TxInput, UtxosResponse};
use crate::rest::AppState;
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

/// Output reference as the client sends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct UtxoKey {
    pub hash: TxHash,
    pub index: u32,
}

impl From<UtxoKey> for TxInput {
    fn from(key: UtxoKey) -> Self {
        TxInput {
            tx_hash: key.hash,
            index: key.index,
        }
    }
}

#[rpc(server, namespace = "query")]
pub trait QueryApi {
    #[method(name = "readParams")]
    async fn read_params(&self) -> RpcResult<ParamsResponse>;

    /// One item per key, in request order.
    #[method(name = "readUtxos")]
    async fn read_utxos(&self, keys: Vec<UtxoKey>) -> RpcResult<UtxosResponse>;
}

pub struct QueryRpc {
    queries: Arc<QueryFacade>,
}

impl QueryRpc {
    pub fn new(state: &AppState) -> Self {
        Self {
            queries: Arc::clone(&state.queries),
        }
    }
}

#[async_trait]
impl QueryApiServer for QueryRpc {
    #[instrument(skip(self))]
    async fn read_params(&self) -> RpcResult<ParamsResponse> {
        self.queries.read_params().await.map_err(rpc_error)
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn read_utxos(&self, keys: Vec<UtxoKey>) -> RpcResult<UtxosResponse> {
        let inputs = keys.into_iter().map(TxInput::from).collect();
        self.queries.utxos_by_input(inputs).await.map_err(rpc_error)
    }
}
