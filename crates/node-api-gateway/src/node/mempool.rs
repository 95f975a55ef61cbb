//! Mempool cursor over the tx-monitor mini-protocol.
//!
//! The monitor protocol hands out snapshots: acquire, read entries until the
//! node says there are no more, release, acquire again. The second acquire
//! blocks on the node until the mempool changes. [`MempoolCursor`] enforces
//! that order locally so the node never sees `next_tx` on a drained snapshot.

use super::protocol::{MempoolSizes, NodeError};
use super::session::{ScopedSession, SessionManager};
use crate::domain::error::{GatewayError, GatewayResult};
use crate::domain::types::TxHash;
use crate::ledger::{self, LedgerError, Tx, TxKind};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Not holding a snapshot
    Idle,
    /// Snapshot held, nothing read yet
    Acquired,
    /// Snapshot held, entries being read
    Draining,
    /// Snapshot held and fully read
    Exhausted,
}

/// One mempool transaction. Kind and hash are derived on first access.
#[derive(Debug)]
pub struct MempoolEntry {
    raw: Bytes,
    parsed: OnceLock<Result<Tx, LedgerError>>,
}

impl MempoolEntry {
    pub fn new(raw: Bytes) -> Self {
        Self {
            raw,
            parsed: OnceLock::new(),
        }
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    fn parsed(&self) -> &Result<Tx, LedgerError> {
        self.parsed.get_or_init(|| {
            let kind = ledger::classify_tx(&self.raw)?;
            ledger::parse_tx(kind, &self.raw)
        })
    }

    pub fn kind(&self) -> GatewayResult<TxKind> {
        self.parsed()
            .as_ref()
            .map(|tx| tx.kind)
            .map_err(undecodable)
    }

    pub fn hash(&self) -> GatewayResult<TxHash> {
        self.parsed()
            .as_ref()
            .map(|tx| tx.hash)
            .map_err(undecodable)
    }
}

fn undecodable(e: &LedgerError) -> GatewayError {
    GatewayError::Session(NodeError::Protocol(format!(
        "node returned an undecodable transaction: {e}"
    )))
}

pub struct MempoolCursor<'s> {
    session: &'s ScopedSession,
    state: CursorState,
}

impl<'s> MempoolCursor<'s> {
    /// Acquire the first snapshot.
    pub async fn start(session: &'s ScopedSession) -> GatewayResult<Self> {
        let mut cursor = Self {
            session,
            state: CursorState::Idle,
        };
        cursor.acquire().await?;
        Ok(cursor)
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Acquire a snapshot. After the first one this waits for a mempool change.
    pub async fn acquire(&mut self) -> GatewayResult<()> {
        if self.state != CursorState::Idle {
            return Err(misuse("acquire while holding a snapshot"));
        }
        let slot = self
            .session
            .call_unbounded(self.session.tx_monitor().acquire())
            .await?;
        trace!(session = %self.session.id(), slot, "mempool snapshot acquired");
        self.state = CursorState::Acquired;
        Ok(())
    }

    pub async fn release(&mut self) -> GatewayResult<()> {
        if self.state == CursorState::Idle {
            return Ok(());
        }
        self.session
            .call(self.session.tx_monitor().release())
            .await?;
        self.state = CursorState::Idle;
        Ok(())
    }

    /// Release and acquire the next snapshot.
    pub async fn refresh(&mut self) -> GatewayResult<()> {
        self.release().await?;
        self.acquire().await
    }

    /// Next entry of the held snapshot, `None` when it is exhausted.
    pub async fn next_entry(&mut self) -> GatewayResult<Option<MempoolEntry>> {
        match self.state {
            CursorState::Idle => return Err(misuse("next_tx without a snapshot")),
            CursorState::Exhausted => {
                return Err(misuse("next_tx on an exhausted snapshot; refresh first"))
            }
            CursorState::Acquired | CursorState::Draining => {}
        }
        match self
            .session
            .call(self.session.tx_monitor().next_tx())
            .await?
        {
            Some(raw) => {
                self.state = CursorState::Draining;
                Ok(Some(MempoolEntry::new(raw)))
            }
            None => {
                self.state = CursorState::Exhausted;
                Ok(None)
            }
        }
    }

    /// Read the rest of the held snapshot.
    pub async fn drain(&mut self) -> GatewayResult<Vec<MempoolEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Capacity and occupancy of the held snapshot.
    pub async fn sizes(&self) -> GatewayResult<MempoolSizes> {
        if self.state == CursorState::Idle {
            return Err(misuse("sizes without a snapshot"));
        }
        self.session.call(self.session.tx_monitor().sizes()).await
    }

    /// Ask the node whether the held snapshot has `hash`. Leaves the read
    /// position untouched.
    pub async fn contains(&self, hash: &TxHash) -> GatewayResult<bool> {
        if self.state == CursorState::Idle {
            return Err(misuse("has_tx without a snapshot"));
        }
        self.session.call(self.session.tx_monitor().has_tx(hash)).await
    }
}

fn misuse(what: &str) -> GatewayError {
    GatewayError::Session(NodeError::Protocol(format!("mempool cursor misuse: {what}")))
}

impl SessionManager {
    pub async fn mempool_sizes(&self) -> GatewayResult<MempoolSizes> {
        let session = self.open().await?;
        let result = async {
            let mut cursor = MempoolCursor::start(&session).await?;
            let sizes = cursor.sizes().await?;
            cursor.release().await?;
            Ok::<_, GatewayError>(sizes)
        }
        .await;
        session.finish(result).await
    }

    /// Whether a transaction with content hash `hash` is in the mempool.
    pub async fn mempool_contains(&self, hash: TxHash) -> GatewayResult<bool> {
        let session = self.open().await?;
        let result = async {
            let mut cursor = MempoolCursor::start(&session).await?;
            let found = cursor.contains(&hash).await?;
            debug!(%hash, found, "mempool membership checked");
            cursor.release().await?;
            Ok::<_, GatewayError>(found)
        }
        .await;
        session.finish(result).await
    }

    /// Every entry of one snapshot.
    pub async fn mempool_snapshot(&self) -> GatewayResult<Vec<MempoolEntry>> {
        let session = self.open().await?;
        let result = async {
            let mut cursor = MempoolCursor::start(&session).await?;
            let entries = cursor.drain().await?;
            cursor.release().await?;
            Ok::<_, GatewayError>(entries)
        }
        .await;
        session.finish(result).await
    }
}

/// Continuous mempool watch: yields each entry not seen in the previous snapshot.
pub struct MempoolWatch<'s> {
    cursor: MempoolCursor<'s>,
    previous: HashSet<TxHash>,
    current: HashSet<TxHash>,
}

impl<'s> MempoolWatch<'s> {
    pub async fn start(session: &'s ScopedSession) -> GatewayResult<Self> {
        Ok(Self {
            cursor: MempoolCursor::start(session).await?,
            previous: HashSet::new(),
            current: HashSet::new(),
        })
    }

    pub async fn next_new_entry(&mut self) -> GatewayResult<MempoolEntry> {
        loop {
            match self.cursor.next_entry().await? {
                Some(entry) => {
                    let hash = entry.hash()?;
                    if self.current.insert(hash) && !self.previous.contains(&hash) {
                        return Ok(entry);
                    }
                }
                None => {
                    self.previous = std::mem::take(&mut self.current);
                    debug!(known = self.previous.len(), "mempool snapshot drained, waiting for change");
                    self.cursor.refresh().await?;
                }
            }
        }
    }
}
