//! Pumps one event source into one client transport.
//!
//! ```text
//!   EventStream / MempoolWatch / ConfirmationWatch
//!                       │ next_item
//!                       ▼
//!               ┌───────────────┐   session.fault()   ┌─────────┐
//!               │StreamResponder│ ◄────────────────── │ Session │
//!               └───────┬───────┘                     └─────────┘
//!                       │ send / closed
//!                       ▼
//!          WebSocket frames  |  RPC subscription sink
//! ```

use crate::domain::error::{GatewayError, GatewayResult};
use crate::node::bridge::{EventStream, ProtocolEvent};
use crate::node::mempool::{MempoolEntry, MempoolWatch};
use crate::node::session::ScopedSession;
use crate::node::submit::{Confirmation, ConfirmationWatch};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Something that yields stream items until exhausted.
#[async_trait]
pub trait EventSource: Send {
    type Item: Send;

    /// `Ok(None)` when the source has nothing more to give.
    async fn next_item(&mut self) -> GatewayResult<Option<Self::Item>>;
}

#[async_trait]
impl EventSource for EventStream {
    type Item = ProtocolEvent;

    async fn next_item(&mut self) -> GatewayResult<Option<ProtocolEvent>> {
        match self.next_event().await {
            Some(ProtocolEvent::SessionError { cause }) => Err(cause),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl<'s> EventSource for MempoolWatch<'s> {
    type Item = MempoolEntry;

    async fn next_item(&mut self) -> GatewayResult<Option<MempoolEntry>> {
        self.next_new_entry().await.map(Some)
    }
}

#[async_trait]
impl<'a> EventSource for ConfirmationWatch<'a> {
    type Item = Confirmation;

    async fn next_item(&mut self) -> GatewayResult<Option<Confirmation>> {
        self.next_confirmation().await
    }
}

/// The client went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client disconnected")]
pub struct SinkClosed;

/// Client side of a stream.
#[async_trait]
pub trait StreamSink: Send {
    async fn send(&mut self, item: serde_json::Value) -> Result<(), SinkClosed>;

    /// Deliver a terminal error in the transport's own shape.
    async fn send_error(&mut self, error: &GatewayError);

    /// Resolves once the client has gone, without waiting for a write.
    async fn closed(&mut self);
}

/// How a stream ended.
#[derive(Debug, Clone)]
pub enum StreamEnd {
    /// The source ran dry
    Exhausted,
    /// The client disconnected or unsubscribed
    ClientGone,
    /// A session error ended the stream; already reported to the client
    Failed(GatewayError),
}

impl StreamEnd {
    pub fn into_result(self) -> GatewayResult<()> {
        match self {
            StreamEnd::Failed(e) => Err(e),
            StreamEnd::Exhausted | StreamEnd::ClientGone => Ok(()),
        }
    }
}

pub struct StreamResponder<'s, S, K> {
    session: &'s ScopedSession,
    source: S,
    sink: K,
}

impl<'s, S, K> StreamResponder<'s, S, K>
where
    S: EventSource,
    K: StreamSink,
{
    pub fn new(session: &'s ScopedSession, source: S, sink: K) -> Self {
        Self {
            session,
            source,
            sink,
        }
    }

    /// Forward items until the source ends, the client leaves or the session
    /// fails. `render` may drop an item by returning `None`.
    pub async fn run<F>(mut self, mut render: F) -> StreamEnd
    where
        F: FnMut(S::Item) -> Option<serde_json::Value> + Send,
    {
        let metrics = self.session.metrics().clone();
        let id = self.session.id();
        metrics.record_stream_started();
        debug!(session = %id, "stream started");

        let end = loop {
            let next = tokio::select! {
                biased;
                fault = self.session.fault() => Err(fault),
                _ = self.sink.closed() => break StreamEnd::ClientGone,
                item = self.source.next_item() => item,
            };

            match next {
                Ok(Some(item)) => {
                    let Some(value) = render(item) else { continue };
                    if self.sink.send(value).await.is_err() {
                        break StreamEnd::ClientGone;
                    }
                    metrics.record_event_forwarded();
                }
                Ok(None) => break StreamEnd::Exhausted,
                Err(e) if e.is_session_closed() => break StreamEnd::Exhausted,
                Err(e) => {
                    warn!(session = %id, error = %e, "stream failed");
                    self.sink.send_error(&e).await;
                    break StreamEnd::Failed(e);
                }
            }
        };

        metrics.record_stream_finished();
        info!(session = %id, end = ?end, "stream ended");
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::NodeConfig;
    use crate::middleware::GatewayMetrics;
    use crate::node::memory::MemoryNode;
    use crate::node::protocol::NodeError;
    use crate::node::session::SessionManager;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    struct Counted(VecDeque<u32>);

    #[async_trait]
    impl EventSource for Counted {
        type Item = u32;

        async fn next_item(&mut self) -> GatewayResult<Option<u32>> {
            match self.0.pop_front() {
                Some(n) => Ok(Some(n)),
                None => std::future::pending().await,
            }
        }
    }

    struct ChannelSink {
        tx: mpsc::UnboundedSender<serde_json::Value>,
        errors: mpsc::UnboundedSender<String>,
        gone: Option<oneshot::Receiver<()>>,
    }

    #[async_trait]
    impl StreamSink for ChannelSink {
        async fn send(&mut self, item: serde_json::Value) -> Result<(), SinkClosed> {
            self.tx.send(item).map_err(|_| SinkClosed)
        }

        async fn send_error(&mut self, error: &GatewayError) {
            let _ = self.errors.send(error.kind().to_string());
        }

        async fn closed(&mut self) {
            match self.gone.as_mut() {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => std::future::pending().await,
            }
        }
    }

    fn manager(node: &MemoryNode) -> SessionManager {
        let config = NodeConfig {
            address: Some("127.0.0.1".into()),
            port: Some(3001),
            ..NodeConfig::default()
        };
        SessionManager::new(
            &config,
            Arc::new(node.clone()),
            Arc::new(GatewayMetrics::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_client_close_ends_stream() {
        let node = MemoryNode::new();
        let sessions = manager(&node);
        let session = sessions.open().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (errors, _) = mpsc::unbounded_channel();
        let (gone_tx, gone_rx) = oneshot::channel();
        let sink = ChannelSink {
            tx,
            errors,
            gone: Some(gone_rx),
        };

        let responder = StreamResponder::new(&session, Counted(VecDeque::from([1, 2])), sink);
        let run = responder.run(|n| Some(serde_json::json!(n)));
        tokio::pin!(run);

        let first = tokio::select! {
            _ = &mut run => panic!("stream ended early"),
            v = rx.recv() => v.unwrap(),
        };
        assert_eq!(first, serde_json::json!(1));
        drop(gone_tx);

        let end = tokio::time::timeout(Duration::from_secs(1), run).await.unwrap();
        assert!(matches!(end, StreamEnd::ClientGone));
        assert_eq!(session.metrics().streams_active.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_session_fault_sends_error_once() {
        let node = MemoryNode::new();
        let sessions = manager(&node);
        let session = sessions.open().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (errors, mut error_rx) = mpsc::unbounded_channel();
        let sink = ChannelSink {
            tx,
            errors,
            gone: None,
        };

        node.inject_fault(NodeError::ConnectionLost("reset by peer".into()));
        let end = tokio::time::timeout(
            Duration::from_secs(1),
            StreamResponder::new(&session, Counted(VecDeque::new()), sink).run(|n| Some(n.into())),
        )
        .await
        .unwrap();

        assert!(matches!(end, StreamEnd::Failed(GatewayError::Session(NodeError::ConnectionLost(_)))));
        assert_eq!(error_rx.recv().await.as_deref(), Some("session"));
        assert!(error_rx.try_recv().is_err());
        session.close().await;
    }
}
