//! Transaction submission and confirmation tracking.

use super::bridge::{EventStream, FollowFrom, PreparedFollow, ProtocolEvent};
use super::session::{ScopedSession, SessionManager};
use crate::domain::error::{ErrorKind, GatewayError, GatewayResult};
use crate::domain::types::{ChainPoint, RejectReason, TxHash};
use crate::ledger::{self, Tx};
use bytes::Bytes;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of submitting one transaction.
#[derive(Debug, Clone)]
pub enum SubmissionOutcome {
    /// The node took the transaction; the hash was computed locally
    Accepted { tx_hash: TxHash },
    /// The node refused it; the reason bytes are verbatim
    Rejected { reason: RejectReason },
    /// The submission never got an answer (connection, timeout, session)
    TransportFailure { cause: GatewayError },
    /// Undecodable input, never sent to the node
    Malformed { reason: String },
}

impl SubmissionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmissionOutcome::Accepted { .. })
    }

    pub fn tx_hash(&self) -> Option<TxHash> {
        match self {
            SubmissionOutcome::Accepted { tx_hash } => Some(*tx_hash),
            _ => None,
        }
    }

    /// Failure kind, `None` when accepted.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            SubmissionOutcome::Accepted { .. } => None,
            SubmissionOutcome::Rejected { .. } => Some(ErrorKind::Rejected),
            SubmissionOutcome::TransportFailure { cause } => Some(cause.kind()),
            SubmissionOutcome::Malformed { .. } => Some(ErrorKind::Malformed),
        }
    }

    pub fn into_result(self) -> GatewayResult<TxHash> {
        match self {
            SubmissionOutcome::Accepted { tx_hash } => Ok(tx_hash),
            SubmissionOutcome::Rejected { reason } => Err(GatewayError::Rejected(reason)),
            SubmissionOutcome::TransportFailure { cause } => Err(cause),
            SubmissionOutcome::Malformed { reason } => Err(GatewayError::Malformed(reason)),
        }
    }
}

impl Serialize for SubmissionOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            SubmissionOutcome::Accepted { tx_hash } => {
                map.serialize_entry("status", "accepted")?;
                map.serialize_entry("tx_hash", tx_hash)?;
            }
            SubmissionOutcome::Rejected { reason } => {
                map.serialize_entry("status", "rejected")?;
                map.serialize_entry("reason", &reason.display())?;
                map.serialize_entry("reason_cbor", &hex::encode(reason.as_bytes()))?;
            }
            SubmissionOutcome::TransportFailure { cause } => {
                map.serialize_entry("status", "transport_failure")?;
                map.serialize_entry("kind", &cause.kind())?;
                map.serialize_entry("error", &cause.to_string())?;
            }
            SubmissionOutcome::Malformed { reason } => {
                map.serialize_entry("status", "malformed")?;
                map.serialize_entry("error", reason)?;
            }
        }
        map.end()
    }
}

/// Outcomes of a batch, one slot per input in input order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub slots: Vec<SubmissionOutcome>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.slots.iter().all(SubmissionOutcome::is_accepted)
    }

    /// Hex hash per slot, empty for failed slots.
    pub fn refs(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|slot| slot.tx_hash().map(|h| h.to_hex()).unwrap_or_default())
            .collect()
    }

    /// The most significant failure kind in the batch.
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        let kinds: Vec<ErrorKind> = self.slots.iter().filter_map(|s| s.error_kind()).collect();
        [
            ErrorKind::Rejected,
            ErrorKind::Connection,
            ErrorKind::Session,
            ErrorKind::Timeout,
            ErrorKind::Malformed,
        ]
        .into_iter()
        .find(|k| kinds.contains(k))
        .or_else(|| kinds.first().copied())
    }
}

/// Classify and parse `raw`, rejecting anything the node could not take.
pub fn validate(raw: &[u8]) -> GatewayResult<Tx> {
    let kind = ledger::classify_tx(raw)?;
    Ok(ledger::parse_tx(kind, raw)?)
}

pub struct SubmissionCoordinator {
    sessions: Arc<SessionManager>,
}

impl SubmissionCoordinator {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Validate and submit on an existing session.
    pub async fn submit_on(session: &ScopedSession, raw: &[u8]) -> SubmissionOutcome {
        match validate(raw) {
            Ok(tx) => Self::forward(session, &tx).await,
            Err(e) => malformed(e),
        }
    }

    async fn forward(session: &ScopedSession, tx: &Tx) -> SubmissionOutcome {
        let kind = u16::from(tx.kind.id());
        let result = session
            .call(session.tx_submission().submit_tx(kind, tx.cbor.clone()))
            .await;

        let outcome = match result {
            Ok(()) => {
                info!(session = %session.id(), tx_hash = %tx.hash, era = %tx.kind, "transaction accepted");
                SubmissionOutcome::Accepted { tx_hash: tx.hash }
            }
            Err(GatewayError::Rejected(reason)) => {
                warn!(session = %session.id(), tx_hash = %tx.hash, reason = %reason, "transaction rejected");
                SubmissionOutcome::Rejected { reason }
            }
            Err(cause) => {
                warn!(session = %session.id(), tx_hash = %tx.hash, error = %cause, "transaction submission failed");
                SubmissionOutcome::TransportFailure { cause }
            }
        };
        session.metrics().record_submission(
            outcome.is_accepted(),
            matches!(outcome, SubmissionOutcome::Rejected { .. }),
        );
        outcome
    }

    /// Submit one transaction on its own session.
    ///
    /// Malformed input is reported without opening a session.
    #[instrument(skip(self, raw), fields(len = raw.len()))]
    pub async fn submit(&self, raw: &[u8]) -> SubmissionOutcome {
        let tx = match validate(raw) {
            Ok(tx) => tx,
            Err(e) => {
                debug!(error = %e, "refusing malformed transaction");
                return malformed(e);
            }
        };
        let session = match self.sessions.open().await {
            Ok(session) => session,
            Err(cause) => return SubmissionOutcome::TransportFailure { cause },
        };
        let outcome = Self::forward(&session, &tx).await;
        session.finish(outcome).await
    }

    /// Submit each input independently on one shared session.
    #[instrument(skip(self, raws), fields(count = raws.len()))]
    pub async fn submit_batch(&self, raws: &[Bytes]) -> BatchOutcome {
        let validated: Vec<GatewayResult<Tx>> = raws.iter().map(|raw| validate(raw)).collect();
        let mut slots = Vec::with_capacity(raws.len());

        if validated.iter().all(Result::is_err) {
            slots.extend(validated.into_iter().filter_map(Result::err).map(malformed));
            return BatchOutcome { slots };
        }

        let session = match self.sessions.open().await {
            Ok(session) => session,
            Err(cause) => {
                slots.extend(validated.into_iter().map(|v| match v {
                    Ok(_) => SubmissionOutcome::TransportFailure {
                        cause: cause.clone(),
                    },
                    Err(e) => malformed(e),
                }));
                return BatchOutcome { slots };
            }
        };

        for item in validated {
            let outcome = match item {
                Ok(tx) => Self::forward(&session, &tx).await,
                Err(e) => malformed(e),
            };
            slots.push(outcome);
        }
        session.finish(BatchOutcome { slots }).await
    }

    /// Open a bridged session starting at the current tip, for
    /// [`ConfirmationWatch`].
    pub async fn prepare_confirmation(&self) -> GatewayResult<PreparedFollow> {
        self.sessions.prepare_follow(FollowFrom::Tip).await
    }
}

fn malformed(e: GatewayError) -> SubmissionOutcome {
    SubmissionOutcome::Malformed {
        reason: e.to_string(),
    }
}

/// A transaction the client waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRef {
    /// What the client sent, echoed back on confirmation
    pub reference: Vec<u8>,
    pub hash: TxHash,
}

impl TrackedRef {
    /// Raw transaction bytes are hashed; 32 bytes are taken as a hash.
    pub fn from_bytes(reference: Vec<u8>) -> GatewayResult<Self> {
        let hash = match validate(&reference) {
            Ok(tx) => tx.hash,
            Err(e) => TxHash::from_slice(&reference).ok_or_else(|| {
                GatewayError::Malformed(format!(
                    "reference is neither a transaction nor a hash: {e}"
                ))
            })?,
        };
        Ok(Self { reference, hash })
    }
}

/// A tracked transaction seen in a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub reference: Vec<u8>,
    pub tx_hash: TxHash,
    pub block: ChainPoint,
}

/// Scans rolled-forward blocks for tracked transactions.
///
/// Each tracked reference is confirmed once; the watch ends when all are.
pub struct ConfirmationWatch<'a> {
    events: &'a mut EventStream,
    tracked: Vec<TrackedRef>,
    pending: VecDeque<Confirmation>,
}

impl<'a> ConfirmationWatch<'a> {
    pub fn new(events: &'a mut EventStream, tracked: Vec<TrackedRef>) -> Self {
        Self {
            events,
            tracked,
            pending: VecDeque::new(),
        }
    }

    /// Next confirmation, `None` once every reference is confirmed or the
    /// event stream ends.
    pub async fn next_confirmation(&mut self) -> GatewayResult<Option<Confirmation>> {
        loop {
            if let Some(confirmation) = self.pending.pop_front() {
                return Ok(Some(confirmation));
            }
            if self.tracked.is_empty() {
                return Ok(None);
            }
            match self.events.next_event().await {
                None => return Ok(None),
                Some(ProtocolEvent::RollForward { block, .. }) => {
                    let point = block.point();
                    for raw in &block.transactions {
                        let hash = match ledger::tx_hash(raw) {
                            Ok(hash) => hash,
                            Err(e) => {
                                debug!(block = %point, error = %e, "skipping undecodable block transaction");
                                continue;
                            }
                        };
                        let (matched, rest) = std::mem::take(&mut self.tracked)
                            .into_iter()
                            .partition::<Vec<_>, _>(|t| t.hash == hash);
                        self.tracked = rest;
                        self.pending.extend(matched.into_iter().map(|tracked| Confirmation {
                            reference: tracked.reference,
                            tx_hash: hash,
                            block: point.clone(),
                        }));
                    }
                }
                Some(ProtocolEvent::RollBackward { .. }) => {}
                Some(ProtocolEvent::SessionError { cause }) => return Err(cause),
            }
        }
    }
}
