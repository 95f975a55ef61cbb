//! In-memory node.
//!
//! A [`NodeConnector`] backed by a chain, a mempool and a ledger held in
//! process memory. It follows the mini-protocol rules the gateway relies on
//! (intersect first, blocking mempool re-acquire, pending calls failing once
//! the session closes) and records what clients asked of it, so it serves
//! both local development and the test suite.

use super::protocol::{
    Block, BlockData, BlockFetchClient, BlockRange, ChainSyncClient, ChainSyncHandler,
    HandshakeParams, MempoolSizes, NodeConnector, NodeError, NodeSession, SessionOptions,
    StateQueryClient, SystemStart, TxInput, TxMonitorClient, TxSubmissionClient, Utxo,
};
use crate::domain::config::{network_magic_for, NodeTarget};
use crate::domain::types::{ChainPoint, Era, RejectReason, Tip, TxHash};
use crate::ledger;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Slots between minted blocks.
pub const SLOT_SPACING: u64 = 20;
const EPOCH_LENGTH: u64 = 432_000;
const DEFAULT_MEMPOOL_CAPACITY: u32 = 178_176;

/// One tx-monitor call as the node saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCall {
    Acquire,
    Release,
    /// `true` when an entry was returned
    NextTx(bool),
    /// A `next_tx` the node refused
    NextTxRefused,
    /// `true` when the held snapshot had the transaction
    HasTx(bool),
}

struct Ledger {
    era: Era,
    chain: Vec<Block>,
    forks: u64,
    mempool: Vec<Bytes>,
    mempool_capacity: u32,
    rejects: HashMap<TxHash, RejectReason>,
    utxos: HashMap<TxInput, Bytes>,
    protocol_params: serde_json::Value,
    era_history: serde_json::Value,
    system_start: SystemStart,
    network_magic: u32,
    connect_failure: Option<NodeError>,
    headers_only: bool,
    query_delay: Option<Duration>,
    submissions: Vec<(u16, Bytes)>,
    monitor_calls: Vec<MonitorCall>,
    fault_senders: Vec<mpsc::Sender<NodeError>>,
}

impl Ledger {
    fn tip(&self) -> Tip {
        match self.chain.last() {
            Some(block) => Tip::new(block.point(), block.number),
            None => Tip::new(ChainPoint::origin(), 0),
        }
    }

    /// Index of the first block after the first known point.
    fn intersect(&self, points: &[ChainPoint]) -> Option<(ChainPoint, usize)> {
        points.iter().find_map(|point| {
            if point.is_origin() {
                return Some((point.clone(), 0));
            }
            self.chain
                .iter()
                .position(|b| b.slot == point.slot && b.hash == point.hash)
                .map(|idx| (point.clone(), idx + 1))
        })
    }
}

struct NodeState {
    ledger: Mutex<Ledger>,
    chain_version: watch::Sender<u64>,
    mempool_version: watch::Sender<u64>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    read_loops: AtomicUsize,
}

impl NodeState {
    fn bump(version: &watch::Sender<u64>) {
        version.send_modify(|v| *v += 1);
    }
}

/// Handle to an in-memory node. Clones share the same node.
#[derive(Clone)]
pub struct MemoryNode {
    state: Arc<NodeState>,
}

impl Default for MemoryNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNode {
    /// An empty Conway-era mainnet node.
    pub fn new() -> Self {
        let ledger = Ledger {
            era: Era::Conway,
            chain: Vec::new(),
            forks: 0,
            mempool: Vec::new(),
            mempool_capacity: DEFAULT_MEMPOOL_CAPACITY,
            rejects: HashMap::new(),
            utxos: HashMap::new(),
            protocol_params: serde_json::json!({
                "minFeeA": 44,
                "minFeeB": 155_381,
                "maxTxSize": 16_384,
                "keyDeposit": 2_000_000,
                "poolDeposit": 500_000_000,
            }),
            era_history: serde_json::json!([
                { "era": "Byron", "start": { "slot": 0, "epoch": 0 } },
                { "era": "Shelley", "start": { "slot": 4_492_800, "epoch": 208 } },
            ]),
            system_start: SystemStart {
                year: 2017,
                day: 266,
                picoseconds: 78_291_000_000_000_000,
            },
            network_magic: network_magic_for("mainnet").unwrap_or_default(),
            connect_failure: None,
            headers_only: false,
            query_delay: None,
            submissions: Vec::new(),
            monitor_calls: Vec::new(),
            fault_senders: Vec::new(),
        };
        let (chain_version, _) = watch::channel(0);
        let (mempool_version, _) = watch::channel(0);
        Self {
            state: Arc::new(NodeState {
                ledger: Mutex::new(ledger),
                chain_version,
                mempool_version,
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                read_loops: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_network_magic(self, magic: u32) -> Self {
        self.state.ledger.lock().network_magic = magic;
        self
    }

    /// Append a block carrying `transactions` and return it.
    pub fn mint_block(&self, transactions: Vec<Bytes>) -> Block {
        let block = {
            let mut ledger = self.state.ledger.lock();
            let (slot, number) = match ledger.chain.last() {
                Some(last) => (last.slot + SLOT_SPACING, last.number + 1),
                None => (SLOT_SPACING, 1),
            };
            let mut seed = Vec::with_capacity(24);
            seed.extend_from_slice(&slot.to_be_bytes());
            seed.extend_from_slice(&number.to_be_bytes());
            seed.extend_from_slice(&ledger.forks.to_be_bytes());
            let block = Block {
                era: ledger.era,
                slot,
                hash: ledger::content_hash(&seed).as_bytes().to_vec(),
                number,
                transactions,
            };
            ledger.chain.push(block.clone());
            block
        };
        NodeState::bump(&self.state.chain_version);
        block
    }

    /// Mint `count` empty blocks.
    pub fn extend_chain(&self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.mint_block(Vec::new())).collect()
    }

    /// Move every mempool transaction into a new block.
    pub fn confirm_mempool(&self) -> Block {
        let txs = std::mem::take(&mut self.state.ledger.lock().mempool);
        NodeState::bump(&self.state.mempool_version);
        self.mint_block(txs)
    }

    /// Drop blocks so that `keep` remain. Followers see a roll-backward.
    pub fn rollback(&self, keep: usize) {
        {
            let mut ledger = self.state.ledger.lock();
            ledger.chain.truncate(keep);
            ledger.forks += 1;
        }
        NodeState::bump(&self.state.chain_version);
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.state.ledger.lock().chain.clone()
    }

    pub fn tip(&self) -> Tip {
        self.state.ledger.lock().tip()
    }

    /// Put a transaction into the mempool without going through submission.
    pub fn add_to_mempool(&self, raw: impl Into<Bytes>) {
        self.state.ledger.lock().mempool.push(raw.into());
        NodeState::bump(&self.state.mempool_version);
    }

    pub fn mempool(&self) -> Vec<Bytes> {
        self.state.ledger.lock().mempool.clone()
    }

    /// Reject submissions of the transaction with `hash`.
    pub fn reject(&self, hash: TxHash, reason: RejectReason) {
        self.state.ledger.lock().rejects.insert(hash, reason);
    }

    pub fn insert_utxo(&self, input: TxInput, output: impl Into<Bytes>) {
        self.state.ledger.lock().utxos.insert(input, output.into());
    }

    pub fn set_protocol_params(&self, params: serde_json::Value) {
        self.state.ledger.lock().protocol_params = params;
    }

    /// Make every following dial fail with `error`.
    pub fn fail_connections(&self, error: Option<NodeError>) {
        self.state.ledger.lock().connect_failure = error;
    }

    /// Deliver roll-forwards as headers, leaving the block to fetch.
    pub fn headers_only(&self, enabled: bool) {
        self.state.ledger.lock().headers_only = enabled;
    }

    /// Delay every state query by `delay`.
    pub fn delay_queries(&self, delay: Option<Duration>) {
        self.state.ledger.lock().query_delay = delay;
    }

    /// Raise a connection-level error on every open session.
    pub fn inject_fault(&self, error: NodeError) {
        let mut ledger = self.state.ledger.lock();
        ledger.fault_senders.retain(|tx| !tx.is_closed());
        for tx in &ledger.fault_senders {
            let _ = tx.try_send(error.clone());
        }
    }

    pub fn submissions(&self) -> Vec<(u16, Bytes)> {
        self.state.ledger.lock().submissions.clone()
    }

    pub fn monitor_calls(&self) -> Vec<MonitorCall> {
        self.state.ledger.lock().monitor_calls.clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.opened.load(Ordering::Acquire)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.closed.load(Ordering::Acquire)
    }

    pub fn sessions_live(&self) -> usize {
        self.sessions_opened() - self.sessions_closed()
    }

    /// Chain-sync read loops still running.
    pub fn read_loops(&self) -> usize {
        self.state.read_loops.load(Ordering::Acquire)
    }
}

#[async_trait]
impl NodeConnector for MemoryNode {
    async fn open(
        &self,
        target: &NodeTarget,
        options: SessionOptions,
    ) -> Result<Arc<dyn NodeSession>, NodeError> {
        let (errors_tx, errors_rx) = mpsc::channel(4);
        {
            let mut ledger = self.state.ledger.lock();
            if let Some(failure) = &ledger.connect_failure {
                return Err(failure.clone());
            }
            check_handshake(&options.params, ledger.network_magic)?;
            ledger.fault_senders.push(errors_tx);
        }
        self.state.opened.fetch_add(1, Ordering::AcqRel);
        debug!(target = %target, "memory node session opened");

        let (closed, _) = watch::channel(false);
        Ok(Arc::new(MemorySession {
            chain: ChainReader {
                state: Arc::clone(&self.state),
            },
            handler: Mutex::new(options.chain_sync),
            closed,
            is_closed: AtomicBool::new(false),
            errors: Mutex::new(Some(errors_rx)),
            read_loop: Mutex::new(None),
            monitor: Mutex::new(MonitorState::default()),
        }))
    }
}

fn check_handshake(params: &HandshakeParams, magic: u32) -> Result<(), NodeError> {
    if !params.node_to_client {
        return Err(NodeError::Handshake("node-to-node is not served".into()));
    }
    if params.network_magic != magic {
        return Err(NodeError::Handshake(format!(
            "network magic mismatch: node {magic}, client {}",
            params.network_magic
        )));
    }
    Ok(())
}

/// Block lookup, shared by the session and its read loop.
#[derive(Clone)]
struct ChainReader {
    state: Arc<NodeState>,
}

#[async_trait]
impl BlockFetchClient for ChainReader {
    async fn block(&self, point: &ChainPoint) -> Result<Block, NodeError> {
        self.state
            .ledger
            .lock()
            .chain
            .iter()
            .find(|b| b.slot == point.slot && b.hash == point.hash)
            .cloned()
            .ok_or_else(|| NodeError::Protocol(format!("no block at {point}")))
    }
}

#[derive(Default)]
struct MonitorState {
    acquired: bool,
    exhausted: bool,
    snapshot: VecDeque<Bytes>,
    /// Hashes of the whole held snapshot, read or not
    held: HashSet<TxHash>,
    acquired_version: u64,
    released_version: Option<u64>,
}

struct MemorySession {
    chain: ChainReader,
    handler: Mutex<Option<Arc<dyn ChainSyncHandler>>>,
    closed: watch::Sender<bool>,
    is_closed: AtomicBool,
    errors: Mutex<Option<mpsc::Receiver<NodeError>>>,
    read_loop: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<MonitorState>,
}

impl MemorySession {
    fn state(&self) -> &NodeState {
        &self.chain.state
    }

    /// Run `call` unless the session is or becomes closed.
    async fn guarded<T, F>(&self, call: F) -> Result<T, NodeError>
    where
        F: Future<Output = Result<T, NodeError>>,
    {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(NodeError::SessionClosed);
        }
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(NodeError::SessionClosed),
            res = call => res,
        }
    }

    async fn query<T>(&self, read: impl FnOnce(&Ledger) -> T) -> Result<T, NodeError> {
        self.guarded(async {
            let delay = self.state().ledger.lock().query_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(read(&self.state().ledger.lock()))
        })
        .await
    }

    fn log_monitor(&self, call: MonitorCall) {
        self.state().ledger.lock().monitor_calls.push(call);
    }
}

#[async_trait]
impl NodeSession for MemorySession {
    fn chain_sync(&self) -> &dyn ChainSyncClient {
        self
    }

    fn state_query(&self) -> &dyn StateQueryClient {
        self
    }

    fn tx_monitor(&self) -> &dyn TxMonitorClient {
        self
    }

    fn tx_submission(&self) -> &dyn TxSubmissionClient {
        self
    }

    fn block_fetch(&self) -> &dyn BlockFetchClient {
        &self.chain
    }

    fn take_errors(&self) -> Option<mpsc::Receiver<NodeError>> {
        self.errors.lock().take()
    }

    async fn close(&self) {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.send_replace(true);
        self.handler.lock().take();
        if let Some(task) = self.read_loop.lock().take() {
            task.abort();
        }
        self.state().closed.fetch_add(1, Ordering::AcqRel);
        debug!("memory node session closed");
    }
}

#[async_trait]
impl ChainSyncClient for MemorySession {
    async fn current_tip(&self) -> Result<Tip, NodeError> {
        self.guarded(async { Ok(self.state().ledger.lock().tip()) })
            .await
    }

    async fn sync(&self, intersect: Vec<ChainPoint>) -> Result<(), NodeError> {
        self.guarded(async {
            let (point, next, headers_only) = {
                let ledger = self.state().ledger.lock();
                let (point, next) = ledger
                    .intersect(&intersect)
                    .ok_or(NodeError::IntersectNotFound)?;
                (point, next, ledger.headers_only)
            };
            let handler = self
                .handler
                .lock()
                .take()
                .ok_or_else(|| NodeError::Protocol("chain sync has no handler".into()))?;

            let guard = ReadLoopGuard::enter(Arc::clone(&self.chain.state));
            let task = tokio::spawn(read_loop(
                guard,
                self.chain.clone(),
                handler,
                point,
                next,
                headers_only,
            ));
            *self.read_loop.lock() = Some(task);
            Ok(())
        })
        .await
    }

    async fn available_block_range(
        &self,
        intersect: Vec<ChainPoint>,
    ) -> Result<BlockRange, NodeError> {
        self.guarded(async {
            let ledger = self.state().ledger.lock();
            let (point, next) = if intersect.is_empty() {
                (ChainPoint::origin(), 0)
            } else {
                ledger
                    .intersect(&intersect)
                    .ok_or(NodeError::IntersectNotFound)?
            };
            let end = ledger.tip().point;
            let start = ledger.chain.get(next).map(Block::point).unwrap_or(point);
            Ok(BlockRange { start, end })
        })
        .await
    }
}

/// Counts a running read loop; dropped when the task ends or is aborted.
struct ReadLoopGuard(Arc<NodeState>);

impl ReadLoopGuard {
    fn enter(state: Arc<NodeState>) -> Self {
        state.read_loops.fetch_add(1, Ordering::AcqRel);
        Self(state)
    }
}

impl Drop for ReadLoopGuard {
    fn drop(&mut self) {
        self.0.read_loops.fetch_sub(1, Ordering::AcqRel);
    }
}

enum Step {
    Forward(Block, Tip),
    Backward(ChainPoint, Tip, usize),
    Wait,
}

async fn read_loop(
    guard: ReadLoopGuard,
    chain: ChainReader,
    handler: Arc<dyn ChainSyncHandler>,
    intersect: ChainPoint,
    mut next: usize,
    headers_only: bool,
) {
    let state = Arc::clone(&guard.0);
    let mut changes = state.chain_version.subscribe();
    let mut last = intersect.clone();

    let tip = state.ledger.lock().tip();
    if let Err(e) = handler.roll_backward(intersect, tip).await {
        debug!(error = %e, "chain sync consumer gone");
        return;
    }

    loop {
        changes.borrow_and_update();
        let step = {
            let ledger = state.ledger.lock();
            let diverged = next > ledger.chain.len()
                || (next > 0 && ledger.chain[next - 1].point() != last);
            if diverged {
                let point = ledger
                    .chain
                    .last()
                    .map(Block::point)
                    .unwrap_or_else(ChainPoint::origin);
                Step::Backward(point, ledger.tip(), ledger.chain.len())
            } else if let Some(block) = ledger.chain.get(next) {
                Step::Forward(block.clone(), ledger.tip())
            } else {
                Step::Wait
            }
        };

        let delivered = match step {
            Step::Forward(block, tip) => {
                next += 1;
                last = block.point();
                trace!(slot = block.slot, "roll forward");
                let data = if headers_only {
                    BlockData::Header(block.header())
                } else {
                    BlockData::Block(block)
                };
                handler.roll_forward(&chain, data, tip).await
            }
            Step::Backward(point, tip, len) => {
                next = len;
                last = point.clone();
                trace!(slot = point.slot, "roll backward");
                handler.roll_backward(point, tip).await
            }
            Step::Wait => {
                if changes.changed().await.is_err() {
                    return;
                }
                Ok(())
            }
        };
        if let Err(e) = delivered {
            debug!(error = %e, "chain sync read loop stopped");
            return;
        }
    }
}

#[async_trait]
impl StateQueryClient for MemorySession {
    async fn acquire(&self, _point: Option<ChainPoint>) -> Result<(), NodeError> {
        self.guarded(async { Ok(()) }).await
    }

    async fn release(&self) -> Result<(), NodeError> {
        self.guarded(async { Ok(()) }).await
    }

    async fn current_era(&self) -> Result<Era, NodeError> {
        self.query(|l| l.era).await
    }

    async fn system_start(&self) -> Result<SystemStart, NodeError> {
        self.query(|l| l.system_start).await
    }

    async fn epoch_no(&self) -> Result<u64, NodeError> {
        self.query(|l| l.tip().point.slot / EPOCH_LENGTH).await
    }

    async fn chain_block_no(&self) -> Result<u64, NodeError> {
        self.query(|l| l.tip().block_number).await
    }

    async fn chain_point(&self) -> Result<ChainPoint, NodeError> {
        self.query(|l| l.tip().point).await
    }

    async fn current_protocol_params(&self) -> Result<serde_json::Value, NodeError> {
        self.query(|l| l.protocol_params.clone()).await
    }

    async fn era_history(&self) -> Result<serde_json::Value, NodeError> {
        self.query(|l| l.era_history.clone()).await
    }

    async fn utxo_by_input(&self, inputs: &[TxInput]) -> Result<Vec<Utxo>, NodeError> {
        self.query(|l| {
            inputs
                .iter()
                .filter_map(|input| {
                    l.utxos.get(input).map(|output| Utxo {
                        input: *input,
                        output: output.clone(),
                    })
                })
                .collect()
        })
        .await
    }
}

#[async_trait]
impl TxMonitorClient for MemorySession {
    async fn acquire(&self) -> Result<u64, NodeError> {
        self.guarded(async {
            let released = {
                let monitor = self.monitor.lock();
                if monitor.acquired {
                    return Err(NodeError::Protocol("mempool snapshot already held".into()));
                }
                monitor.released_version
            };
            let mut version = self.state().mempool_version.subscribe();
            if let Some(previous) = released {
                version
                    .wait_for(|v| *v != previous)
                    .await
                    .map_err(|_| NodeError::SessionClosed)?;
            }

            let (snapshot, slot) = {
                let ledger = self.state().ledger.lock();
                (ledger.mempool.clone(), ledger.tip().point.slot)
            };
            let mut monitor = self.monitor.lock();
            monitor.acquired = true;
            monitor.exhausted = false;
            monitor.held = snapshot
                .iter()
                .filter_map(|raw| ledger::tx_hash(raw).ok())
                .collect();
            monitor.snapshot = snapshot.into();
            monitor.acquired_version = *version.borrow();
            drop(monitor);
            self.log_monitor(MonitorCall::Acquire);
            Ok(slot)
        })
        .await
    }

    async fn release(&self) -> Result<(), NodeError> {
        self.guarded(async {
            let mut monitor = self.monitor.lock();
            if monitor.acquired {
                monitor.acquired = false;
                monitor.released_version = Some(monitor.acquired_version);
                monitor.snapshot.clear();
                monitor.held.clear();
            }
            drop(monitor);
            self.log_monitor(MonitorCall::Release);
            Ok(())
        })
        .await
    }

    async fn next_tx(&self) -> Result<Option<Bytes>, NodeError> {
        self.guarded(async {
            let mut monitor = self.monitor.lock();
            if !monitor.acquired || monitor.exhausted {
                drop(monitor);
                self.log_monitor(MonitorCall::NextTxRefused);
                return Err(NodeError::Protocol(
                    "next_tx needs a fresh mempool snapshot".into(),
                ));
            }
            let entry = monitor.snapshot.pop_front();
            monitor.exhausted = entry.is_none();
            drop(monitor);
            self.log_monitor(MonitorCall::NextTx(entry.is_some()));
            Ok(entry)
        })
        .await
    }

    async fn sizes(&self) -> Result<MempoolSizes, NodeError> {
        self.guarded(async {
            let ledger = self.state().ledger.lock();
            let size: usize = ledger.mempool.iter().map(Bytes::len).sum();
            Ok(MempoolSizes {
                capacity: ledger.mempool_capacity,
                size: u32::try_from(size).unwrap_or(u32::MAX),
                tx_count: u32::try_from(ledger.mempool.len()).unwrap_or(u32::MAX),
            })
        })
        .await
    }

    async fn has_tx(&self, hash: &TxHash) -> Result<bool, NodeError> {
        self.guarded(async {
            let monitor = self.monitor.lock();
            if !monitor.acquired {
                return Err(NodeError::Protocol("has_tx needs an acquired snapshot".into()));
            }
            let found = monitor.held.contains(hash);
            drop(monitor);
            self.log_monitor(MonitorCall::HasTx(found));
            Ok(found)
        })
        .await
    }
}

#[async_trait]
impl TxSubmissionClient for MemorySession {
    async fn submit_tx(&self, kind: u16, tx: Bytes) -> Result<(), NodeError> {
        self.guarded(async {
            let mut ledger = self.state().ledger.lock();
            ledger.submissions.push((kind, tx.clone()));

            let classified = ledger::classify_tx(&tx)
                .and_then(|k| ledger::parse_tx(k, &tx))
                .map_err(|e| NodeError::Rejected(RejectReason::new(reject_text(&e.to_string()))))?;
            if u16::from(classified.kind.id()) != kind {
                return Err(NodeError::Rejected(RejectReason::new(reject_text(
                    "era mismatch",
                ))));
            }
            if let Some(reason) = ledger.rejects.get(&classified.hash) {
                return Err(NodeError::Rejected(reason.clone()));
            }
            ledger.mempool.push(tx);
            drop(ledger);
            NodeState::bump(&self.state().mempool_version);
            Ok(())
        })
        .await
    }
}

/// A rejection reason encoded as a one-element CBOR array holding a text string.
fn reject_text(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = vec![0x81];
    match bytes.len() {
        len @ 0..=23 => out.push(0x60 | len as u8),
        len @ 24..=255 => out.extend_from_slice(&[0x78, len as u8]),
        len => {
            let len = u16::try_from(len).unwrap_or(u16::MAX);
            out.push(0x79);
            out.extend_from_slice(&len.to_be_bytes());
        }
    }
    out.extend_from_slice(&bytes[..bytes.len().min(usize::from(u16::MAX))]);
    out
}
