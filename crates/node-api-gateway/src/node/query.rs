//! One-shot ledger queries.
//!
//! Every operation opens its own session, acquires the volatile tip once,
//! issues the calls it needs and closes the session again. Multi-field
//! answers are read inside that single acquire.

use super::protocol::{SystemStart, TxInput};
use super::session::{ScopedSession, SessionManager};
use crate::domain::error::{GatewayError, GatewayResult};
use crate::domain::types::{
    hex_bytes, ChainPoint, ChainTipResponse, CurrentEraResponse, SystemStartResponse,
    TipResponse, TxHash,
};
use chrono::{Duration as ChronoDuration, NaiveDate, SecondsFormat};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

/// A chain point in the RPC shapes, slot plus hex hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTip {
    pub slot: u64,
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
}

impl From<ChainPoint> for LedgerTip {
    fn from(point: ChainPoint) -> Self {
        Self {
            slot: point.slot,
            hash: point.hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamsResponse {
    pub ledger_tip: LedgerTip,
    pub values: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoItem {
    pub tx_hash: TxHash,
    pub index: u32,
    /// Output CBOR, absent when the ledger has no such output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxosResponse {
    pub items: Vec<UtxoItem>,
    pub ledger_tip: LedgerTip,
}

pub struct QueryFacade {
    sessions: Arc<SessionManager>,
}

impl QueryFacade {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Open, acquire, run `query`, release and close.
    async fn acquired<T, F>(&self, query: F) -> GatewayResult<T>
    where
        F: for<'s> FnOnce(&'s ScopedSession) -> BoxFuture<'s, GatewayResult<T>>,
    {
        let session = self.sessions.open().await?;
        let result = async {
            session.call(session.state_query().acquire(None)).await?;
            let value = query(&session).await?;
            session.call(session.state_query().release()).await?;
            Ok::<_, GatewayError>(value)
        }
        .await;
        session.finish(result).await
    }

    #[instrument(skip(self))]
    pub async fn current_era(&self) -> GatewayResult<CurrentEraResponse> {
        let era = self
            .acquired(|s| s.call(s.state_query().current_era()).boxed())
            .await?;
        Ok(CurrentEraResponse {
            id: era.id(),
            name: era.name().to_string(),
        })
    }

    #[instrument(skip(self))]
    pub async fn system_start(&self) -> GatewayResult<SystemStartResponse> {
        let start = self
            .acquired(|s| s.call(s.state_query().system_start()).boxed())
            .await?;
        Ok(SystemStartResponse {
            year: start.year,
            day: start.day,
            picoseconds: start.picoseconds,
            timestamp: rfc3339(&start),
        })
    }

    #[instrument(skip(self))]
    pub async fn tip(&self) -> GatewayResult<TipResponse> {
        self.acquired(|s| {
            async move {
                let era = s.call(s.state_query().current_era()).await?;
                let epoch_no = s.call(s.state_query().epoch_no()).await?;
                let block_no = s.call(s.state_query().chain_block_no()).await?;
                let point = s.call(s.state_query().chain_point()).await?;
                Ok(TipResponse {
                    era: era.name().to_string(),
                    epoch_no,
                    block_no,
                    slot_no: point.slot,
                    hash: hex::encode(&point.hash),
                })
            }
            .boxed()
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn protocol_params(&self) -> GatewayResult<serde_json::Value> {
        self.acquired(|s| s.call(s.state_query().current_protocol_params()).boxed())
            .await
    }

    #[instrument(skip(self))]
    pub async fn era_history(&self) -> GatewayResult<serde_json::Value> {
        self.acquired(|s| s.call(s.state_query().era_history()).boxed())
            .await
    }

    /// Resolve outputs for `inputs`, one item per input in request order.
    #[instrument(skip(self, inputs), fields(count = inputs.len()))]
    pub async fn utxos_by_input(&self, inputs: Vec<TxInput>) -> GatewayResult<UtxosResponse> {
        self.acquired(move |s| {
            async move {
                let utxos = s.call(s.state_query().utxo_by_input(&inputs)).await?;
                let point = s.call(s.state_query().chain_point()).await?;
                let items = inputs
                    .iter()
                    .map(|input| UtxoItem {
                        tx_hash: input.tx_hash,
                        index: input.index,
                        output: utxos
                            .iter()
                            .find(|u| u.input == *input)
                            .map(|u| hex::encode(&u.output)),
                    })
                    .collect();
                Ok(UtxosResponse {
                    items,
                    ledger_tip: point.into(),
                })
            }
            .boxed()
        })
        .await
    }

    /// The chain-sync tip, which may run ahead of the ledger state.
    #[instrument(skip(self))]
    pub async fn chain_tip(&self) -> GatewayResult<ChainTipResponse> {
        let session = self.sessions.open().await?;
        let tip = session.call(session.chain_sync().current_tip()).await;
        let tip = session.finish(tip).await?;
        Ok(ChainTipResponse {
            slot: tip.point.slot,
            height: tip.block_number,
            hash: hex::encode(&tip.point.hash),
        })
    }

    #[instrument(skip(self))]
    pub async fn read_params(&self) -> GatewayResult<ParamsResponse> {
        self.acquired(|s| {
            async move {
                let values = s.call(s.state_query().current_protocol_params()).await?;
                let point = s.call(s.state_query().chain_point()).await?;
                Ok(ParamsResponse {
                    ledger_tip: point.into(),
                    values,
                })
            }
            .boxed()
        })
        .await
    }
}

/// Render a node system start (year, 1-based day of year, picoseconds into
/// the day) as RFC 3339.
pub fn rfc3339(start: &SystemStart) -> Option<String> {
    let date = NaiveDate::from_yo_opt(start.year, start.day)?;
    let nanos = i64::try_from(start.picoseconds / 1_000).ok()?;
    let at = date.and_hms_opt(0, 0, 0)? + ChronoDuration::nanoseconds(nanos);
    Some(at.and_utc().to_rfc3339_opts(SecondsFormat::AutoSi, true))
}
