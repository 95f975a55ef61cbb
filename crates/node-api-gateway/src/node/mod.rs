//! Node-facing core: sessions, the chain-sync bridge, the mempool cursor,
//! submission and queries.

pub mod bridge;
pub mod memory;
pub mod mempool;
pub mod protocol;
pub mod query;
pub mod session;
pub mod submit;

pub use bridge::{EventBridge, EventStream, FollowFrom, PreparedFollow, ProtocolEvent};
pub use memory::MemoryNode;
pub use mempool::{CursorState, MempoolCursor, MempoolEntry, MempoolWatch};
pub use protocol::{
    Block, BlockData, BlockFetchClient, BlockHeader, BlockSummary, BlockRange, ChainSyncClient,
    ChainSyncHandler, HandshakeParams, MempoolSizes, NodeConnector, NodeError, NodeSession,
    SessionOptions, StateQueryClient, SystemStart, TxInput, TxMonitorClient, TxSubmissionClient,
    Utxo,
};
pub use query::{LedgerTip, ParamsResponse, QueryFacade, UtxoItem, UtxosResponse};
pub use session::{ScopedSession, SessionManager, SessionState};
pub use submit::{
    BatchOutcome, Confirmation, ConfirmationWatch, SubmissionCoordinator, SubmissionOutcome,
    TrackedRef,
};
