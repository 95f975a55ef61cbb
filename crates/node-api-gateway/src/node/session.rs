//! Per-request node sessions.
//!
//! [`SessionManager::open`] dials the node and returns a [`ScopedSession`],
//! which owns the connection for exactly one inbound request. The session is
//! closed once: explicitly through [`ScopedSession::close`] /
//! [`ScopedSession::finish`], or on drop for exit paths that never reach
//! either (panics, cancelled futures).

use super::bridge::EventStream;
use super::protocol::{
    BlockFetchClient, ChainSyncClient, ChainSyncHandler, HandshakeParams, NodeConnector,
    NodeError, NodeSession, SessionOptions, StateQueryClient, TxMonitorClient,
    TxSubmissionClient,
};
use crate::domain::config::{ConfigError, NodeConfig, NodeTarget};
use crate::domain::correlation::CorrelationId;
use crate::domain::error::{GatewayError, GatewayResult};
use crate::middleware::GatewayMetrics;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of one session as observed by its waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// A connection-level error arrived outside any call
    Faulted(NodeError),
    Closed,
}

/// Opens request-scoped sessions against one configured node.
pub struct SessionManager {
    connector: Arc<dyn NodeConnector>,
    target: NodeTarget,
    params: HandshakeParams,
    call_timeout: Duration,
    event_buffer: usize,
    metrics: Arc<GatewayMetrics>,
}

impl SessionManager {
    /// Resolve the node target and handshake parameters from `config`.
    ///
    /// A missing or contradictory target fails here, before any request runs.
    pub fn new(
        config: &NodeConfig,
        connector: Arc<dyn NodeConnector>,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, ConfigError> {
        let target = config.target()?;
        let params = HandshakeParams {
            network_magic: config.network_magic()?,
            node_to_client: true,
            keep_alive: config.keep_alive && target.is_tcp(),
        };
        Ok(Self {
            connector,
            target,
            params,
            call_timeout: config.call_timeout,
            event_buffer: config.event_buffer.max(1),
            metrics,
        })
    }

    pub fn target(&self) -> &NodeTarget {
        &self.target
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Open a session without chain-sync callbacks.
    pub async fn open(&self) -> GatewayResult<ScopedSession> {
        self.open_with(None).await
    }

    /// Open a session whose chain-sync callbacks feed a fresh event bridge.
    pub async fn open_bridged(&self) -> GatewayResult<(ScopedSession, EventStream)> {
        let (bridge, events) = super::bridge::EventBridge::channel(self.event_buffer);
        let session = self.open_with(Some(bridge)).await?;
        Ok((session, events))
    }

    async fn open_with(
        &self,
        chain_sync: Option<Arc<dyn ChainSyncHandler>>,
    ) -> GatewayResult<ScopedSession> {
        let id = CorrelationId::new();

        if let NodeTarget::Unix(path) = &self.target {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                self.metrics.record_session_failed();
                return Err(GatewayError::Connection(format!(
                    "socket path {} does not exist",
                    path.display()
                )));
            }
        }

        let options = SessionOptions {
            params: self.params,
            chain_sync,
        };
        let opened = tokio::time::timeout(self.call_timeout, self.connector.open(&self.target, options)).await;
        let inner = match opened {
            Ok(Ok(inner)) => inner,
            Ok(Err(e)) => {
                self.metrics.record_session_failed();
                warn!(session = %id, target = %self.target, error = %e, "cannot open node session");
                return Err(match e {
                    NodeError::Timeout(after) => GatewayError::Timeout(after),
                    other => GatewayError::Connection(other.to_string()),
                });
            }
            Err(_) => {
                self.metrics.record_session_failed();
                warn!(session = %id, target = %self.target, "node handshake timed out");
                return Err(GatewayError::Timeout(self.call_timeout));
            }
        };

        self.metrics.record_session_opened();
        debug!(session = %id, target = %self.target, "node session opened");
        Ok(ScopedSession::start(
            id,
            inner,
            self.call_timeout,
            Arc::clone(&self.metrics),
        ))
    }
}

struct Shared {
    closed: AtomicBool,
    state: watch::Sender<SessionState>,
}

/// A node session owned by one request.
pub struct ScopedSession {
    id: CorrelationId,
    inner: Arc<dyn NodeSession>,
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
    call_timeout: Duration,
    metrics: Arc<GatewayMetrics>,
}

impl ScopedSession {
    fn start(
        id: CorrelationId,
        inner: Arc<dyn NodeSession>,
        call_timeout: Duration,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Open);
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            state,
        });
        let listener = inner
            .take_errors()
            .map(|errors| tokio::spawn(listen_for_faults(id, errors, Arc::clone(&shared))));

        Self {
            id,
            inner,
            shared,
            listener: Mutex::new(listener),
            call_timeout,
            metrics,
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn chain_sync(&self) -> &dyn ChainSyncClient {
        self.inner.chain_sync()
    }

    pub fn state_query(&self) -> &dyn StateQueryClient {
        self.inner.state_query()
    }

    pub fn tx_monitor(&self) -> &dyn TxMonitorClient {
        self.inner.tx_monitor()
    }

    pub fn tx_submission(&self) -> &dyn TxSubmissionClient {
        self.inner.tx_submission()
    }

    pub fn block_fetch(&self) -> &dyn BlockFetchClient {
        self.inner.block_fetch()
    }

    /// Resolves once the session faults or closes.
    pub async fn fault(&self) -> GatewayError {
        let mut rx = self.shared.state.subscribe();
        let state = match rx.wait_for(|s| *s != SessionState::Open).await {
            Ok(state) => state.clone(),
            Err(_) => SessionState::Closed,
        };
        match state {
            SessionState::Faulted(e) => GatewayError::Session(e),
            _ => GatewayError::Session(NodeError::SessionClosed),
        }
    }

    /// Run a node call under the session deadline, cut short by a fault.
    pub async fn call<T, F>(&self, call: F) -> GatewayResult<T>
    where
        F: Future<Output = Result<T, NodeError>>,
    {
        tokio::select! {
            biased;
            fault = self.fault() => Err(fault),
            res = tokio::time::timeout(self.call_timeout, call) => match res {
                Ok(r) => r.map_err(GatewayError::from),
                Err(_) => Err(GatewayError::Timeout(self.call_timeout)),
            },
        }
    }

    /// Like [`call`](Self::call) without a deadline, for calls that wait on
    /// the node by design (mempool re-acquire).
    pub async fn call_unbounded<T, F>(&self, call: F) -> GatewayResult<T>
    where
        F: Future<Output = Result<T, NodeError>>,
    {
        tokio::select! {
            biased;
            fault = self.fault() => Err(fault),
            res = call => res.map_err(GatewayError::from),
        }
    }

    /// Close the session. Safe to call more than once.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.state.send_replace(SessionState::Closed);
        self.inner.close().await;
        self.metrics.record_session_closed();

        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            // The listener exits on the Closed state it just observed.
            if let Err(e) = handle.await {
                warn!(session = %self.id, error = %e, "session fault listener failed");
            }
        }
        debug!(session = %self.id, "node session closed");
    }

    /// Close the session and hand back `result`.
    pub async fn finish<T>(self, result: T) -> T {
        self.close().await;
        result
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.state.send_replace(SessionState::Closed);
        self.metrics.record_session_closed();
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }

        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                debug!(session = %self.id, "closing node session on drop");
                rt.spawn(async move { inner.close().await });
            }
            Err(_) => warn!(session = %self.id, "no runtime to close node session on drop"),
        }
    }
}

async fn listen_for_faults(
    id: CorrelationId,
    mut errors: tokio::sync::mpsc::Receiver<NodeError>,
    shared: Arc<Shared>,
) {
    let mut state = shared.state.subscribe();
    tokio::select! {
        err = errors.recv() => {
            if let Some(err) = err {
                info!(session = %id, error = %err, "node session faulted");
                shared.state.send_if_modified(|s| {
                    if *s == SessionState::Open {
                        *s = SessionState::Faulted(err);
                        true
                    } else {
                        false
                    }
                });
            }
        }
        _ = state.wait_for(|s| *s == SessionState::Closed) => {}
    }
}
