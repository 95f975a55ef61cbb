//! Interface of the node-protocol engine.
//!
//! The gateway never speaks the node's wire protocol itself. A host process
//! plugs in a [`NodeConnector`] that dials the node, runs the handshake and
//! hands back a [`NodeSession`] exposing one client per mini-protocol.

use crate::domain::config::NodeTarget;
use crate::domain::types::{hex_bytes, ChainPoint, Era, RejectReason, Tip, TxHash};
use crate::ledger;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Errors raised by the node-protocol engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("cannot dial node: {0}")]
    Dial(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("session closed")]
    SessionClosed,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no intersection found for the requested points")]
    IntersectNotFound,
    #[error("transaction rejected by node")]
    Rejected(RejectReason),
    #[error("node did not answer within {0:?}")]
    Timeout(Duration),
    #[error("unknown block representation (type {0})")]
    UnknownBlock(u32),
}

/// Negotiated connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeParams {
    pub network_magic: u32,
    pub node_to_client: bool,
    pub keep_alive: bool,
}

/// Options for one session.
#[derive(Clone)]
pub struct SessionOptions {
    pub params: HandshakeParams,
    /// Receives chain-sync callbacks once [`ChainSyncClient::sync`] runs
    pub chain_sync: Option<Arc<dyn ChainSyncHandler>>,
}

/// Dials the node. One call, one session.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn open(
        &self,
        target: &NodeTarget,
        options: SessionOptions,
    ) -> Result<Arc<dyn NodeSession>, NodeError>;
}

/// One live connection and its mini-protocol clients.
#[async_trait]
pub trait NodeSession: Send + Sync {
    fn chain_sync(&self) -> &dyn ChainSyncClient;
    fn state_query(&self) -> &dyn StateQueryClient;
    fn tx_monitor(&self) -> &dyn TxMonitorClient;
    fn tx_submission(&self) -> &dyn TxSubmissionClient;
    fn block_fetch(&self) -> &dyn BlockFetchClient;

    /// Connection-level failures raised outside any call.
    ///
    /// Returns the receiver once; later calls return `None`.
    fn take_errors(&self) -> Option<mpsc::Receiver<NodeError>>;

    /// Close the connection. Idempotent; pending calls resolve with
    /// [`NodeError::SessionClosed`].
    async fn close(&self);
}

#[async_trait]
pub trait ChainSyncClient: Send + Sync {
    async fn current_tip(&self) -> Result<Tip, NodeError>;

    /// Find the intersection and start the read loop that drives the
    /// session's [`ChainSyncHandler`]. Returns once the intersection is known.
    async fn sync(&self, intersect: Vec<ChainPoint>) -> Result<(), NodeError>;

    async fn available_block_range(
        &self,
        intersect: Vec<ChainPoint>,
    ) -> Result<BlockRange, NodeError>;
}

#[async_trait]
pub trait StateQueryClient: Send + Sync {
    /// Acquire a ledger snapshot; `None` means the volatile tip.
    async fn acquire(&self, point: Option<ChainPoint>) -> Result<(), NodeError>;
    async fn release(&self) -> Result<(), NodeError>;

    async fn current_era(&self) -> Result<Era, NodeError>;
    async fn system_start(&self) -> Result<SystemStart, NodeError>;
    async fn epoch_no(&self) -> Result<u64, NodeError>;
    async fn chain_block_no(&self) -> Result<u64, NodeError>;
    async fn chain_point(&self) -> Result<ChainPoint, NodeError>;
    async fn current_protocol_params(&self) -> Result<serde_json::Value, NodeError>;
    async fn era_history(&self) -> Result<serde_json::Value, NodeError>;
    async fn utxo_by_input(&self, inputs: &[TxInput]) -> Result<Vec<Utxo>, NodeError>;
}

#[async_trait]
pub trait TxMonitorClient: Send + Sync {
    /// Acquire a mempool snapshot. After a release, blocks until the mempool
    /// differs from the previously acquired snapshot. Returns the snapshot slot.
    async fn acquire(&self) -> Result<u64, NodeError>;
    async fn release(&self) -> Result<(), NodeError>;
    /// Next transaction of the acquired snapshot, `None` once it is drained.
    async fn next_tx(&self) -> Result<Option<Bytes>, NodeError>;
    async fn sizes(&self) -> Result<MempoolSizes, NodeError>;
    async fn has_tx(&self, hash: &TxHash) -> Result<bool, NodeError>;
}

#[async_trait]
pub trait TxSubmissionClient: Send + Sync {
    /// Submit one transaction. Rejections come back as [`NodeError::Rejected`].
    async fn submit_tx(&self, kind: u16, tx: Bytes) -> Result<(), NodeError>;
}

#[async_trait]
pub trait BlockFetchClient: Send + Sync {
    async fn block(&self, point: &ChainPoint) -> Result<Block, NodeError>;
}

/// Chain-sync callbacks, invoked from the session's read loop in delivery order.
///
/// The read loop awaits each callback before reading the next message.
#[async_trait]
pub trait ChainSyncHandler: Send + Sync {
    async fn roll_forward(
        &self,
        fetch: &dyn BlockFetchClient,
        data: BlockData,
        tip: Tip,
    ) -> Result<(), NodeError>;

    async fn roll_backward(&self, point: ChainPoint, tip: Tip) -> Result<(), NodeError>;
}

/// What a roll-forward carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockData {
    Block(Block),
    Header(BlockHeader),
    Unknown { block_type: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub era: Era,
    pub slot: u64,
    pub hash: Vec<u8>,
    pub number: u64,
    /// Raw transaction CBOR in block order
    pub transactions: Vec<Bytes>,
}

impl Block {
    pub fn point(&self) -> ChainPoint {
        ChainPoint::new(self.slot, self.hash.clone())
    }

    /// JSON view of the block with transactions reduced to their hashes.
    ///
    /// Transactions that do not decode are left out.
    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            era: self.era.name(),
            slot: self.slot,
            hash: self.hash.clone(),
            number: self.number,
            transactions: self
                .transactions
                .iter()
                .filter_map(|raw| ledger::tx_hash(raw).ok())
                .collect(),
        }
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            era: self.era,
            slot: self.slot,
            hash: self.hash.clone(),
            number: self.number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockSummary {
    pub era: &'static str,
    pub slot: u64,
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
    pub number: u64,
    pub transactions: Vec<TxHash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub era: Era,
    pub slot: u64,
    pub hash: Vec<u8>,
    pub number: u64,
}

impl BlockHeader {
    pub fn point(&self) -> ChainPoint {
        ChainPoint::new(self.slot, self.hash.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRange {
    pub start: ChainPoint,
    pub end: ChainPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStart {
    pub year: i32,
    pub day: u32,
    pub picoseconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolSizes {
    pub capacity: u32,
    pub size: u32,
    pub tx_count: u32,
}

/// Reference to a transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxInput {
    pub tx_hash: TxHash,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub input: TxInput,
    /// Output CBOR as the node returned it
    pub output: Bytes,
}
