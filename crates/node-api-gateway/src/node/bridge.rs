//! Chain-sync event bridge.
//!
//! The node engine drives chain-sync through [`ChainSyncHandler`] callbacks.
//! [`EventBridge`] turns those callbacks into [`ProtocolEvent`]s on a bounded
//! channel, and [`EventStream`] is the single consumer end. A full channel
//! blocks the callback, and with it the session's read loop.

use super::protocol::{Block, BlockData, BlockFetchClient, ChainSyncHandler, NodeError};
use super::session::{ScopedSession, SessionManager};
use crate::domain::error::{GatewayError, GatewayResult};
use crate::domain::types::{ChainPoint, Tip};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    RollForward { block: Block, tip: Tip },
    RollBackward { point: ChainPoint, tip: Tip },
    SessionError { cause: GatewayError },
}

/// Producer side, registered with the session as its chain-sync handler.
pub struct EventBridge {
    tx: mpsc::Sender<ProtocolEvent>,
}

impl EventBridge {
    pub fn channel(capacity: usize) -> (Arc<Self>, EventStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self { tx }),
            EventStream {
                rx,
                synced: false,
            },
        )
    }

    async fn emit(&self, event: ProtocolEvent) -> Result<(), NodeError> {
        self.tx.send(event).await.map_err(|_| NodeError::SessionClosed)
    }

    async fn fail(&self, cause: NodeError) -> NodeError {
        let event = ProtocolEvent::SessionError {
            cause: GatewayError::Session(cause.clone()),
        };
        if self.emit(event).await.is_err() {
            debug!(error = %cause, "bridge consumer gone before error delivery");
        }
        cause
    }
}

#[async_trait]
impl ChainSyncHandler for EventBridge {
    async fn roll_forward(
        &self,
        fetch: &dyn BlockFetchClient,
        data: BlockData,
        tip: Tip,
    ) -> Result<(), NodeError> {
        let block = match data {
            BlockData::Block(block) => block,
            BlockData::Header(header) => match fetch.block(&header.point()).await {
                Ok(block) => block,
                Err(e) => {
                    warn!(point = %header.point(), error = %e, "cannot fetch block for header");
                    return Err(self.fail(e).await);
                }
            },
            BlockData::Unknown { block_type } => {
                return Err(self.fail(NodeError::UnknownBlock(block_type)).await);
            }
        };
        self.emit(ProtocolEvent::RollForward { block, tip }).await
    }

    async fn roll_backward(&self, point: ChainPoint, tip: Tip) -> Result<(), NodeError> {
        self.emit(ProtocolEvent::RollBackward { point, tip }).await
    }
}

/// Consumer side of one bridge: an ordered, non-restartable event stream.
pub struct EventStream {
    rx: mpsc::Receiver<ProtocolEvent>,
    synced: bool,
}

impl EventStream {
    /// Start chain-sync from `intersect`. Only the first call is accepted.
    pub async fn sync(
        &mut self,
        session: &ScopedSession,
        intersect: Vec<ChainPoint>,
    ) -> GatewayResult<()> {
        if self.synced {
            return Err(GatewayError::Session(NodeError::Protocol(
                "chain sync already started on this session".into(),
            )));
        }
        self.synced = true;
        session.call(session.chain_sync().sync(intersect)).await
    }

    /// Next event, `None` once the producer side is gone.
    pub async fn next_event(&mut self) -> Option<ProtocolEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = ProtocolEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Where a follow starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowFrom {
    /// The node's tip at request time
    Tip,
    /// The first of these points the node knows
    Points(Vec<ChainPoint>),
}

/// A bridged session with its start resolved but chain-sync not yet running.
///
/// Attach the consumer first, then call [`begin`](Self::begin).
pub struct PreparedFollow {
    pub session: ScopedSession,
    pub events: EventStream,
    pub intersect: Vec<ChainPoint>,
    /// The tip fetched when starting from the tip
    pub start_tip: Option<Tip>,
}

impl PreparedFollow {
    pub async fn begin(&mut self) -> GatewayResult<()> {
        let intersect = self.intersect.clone();
        self.events.sync(&self.session, intersect).await
    }
}

impl SessionManager {
    /// Open a bridged session and resolve where chain-sync should start.
    pub async fn prepare_follow(&self, from: FollowFrom) -> GatewayResult<PreparedFollow> {
        let (session, events) = self.open_bridged().await?;
        let resolved = match from {
            FollowFrom::Tip => session
                .call(session.chain_sync().current_tip())
                .await
                .map(|tip| (vec![tip.point.clone()], Some(tip))),
            FollowFrom::Points(points) => Ok((points, None)),
        };
        match resolved {
            Ok((intersect, start_tip)) => Ok(PreparedFollow {
                session,
                events,
                intersect,
                start_tip,
            }),
            Err(e) => Err(session.finish(e).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Era;
    use crate::node::protocol::BlockHeader;
    use proptest::prelude::*;

    struct NoFetch;

    #[async_trait]
    impl BlockFetchClient for NoFetch {
        async fn block(&self, _point: &ChainPoint) -> Result<Block, NodeError> {
            Err(NodeError::Protocol("block fetch unavailable".into()))
        }
    }

    struct FetchFrom(Block);

    #[async_trait]
    impl BlockFetchClient for FetchFrom {
        async fn block(&self, point: &ChainPoint) -> Result<Block, NodeError> {
            assert_eq!(point, &self.0.point());
            Ok(self.0.clone())
        }
    }

    fn block(slot: u64) -> Block {
        Block {
            era: Era::Babbage,
            slot,
            hash: slot.to_be_bytes().to_vec(),
            number: slot / 20,
            transactions: Vec::new(),
        }
    }

    fn tip(slot: u64) -> Tip {
        Tip::new(ChainPoint::new(slot, slot.to_be_bytes().to_vec()), slot / 20)
    }

    #[tokio::test]
    async fn test_header_is_materialized_by_fetch() {
        let (bridge, mut events) = EventBridge::channel(4);
        let full = block(40);

        bridge
            .roll_forward(&FetchFrom(full.clone()), BlockData::Header(full.header()), tip(40))
            .await
            .unwrap();

        match events.next_event().await {
            Some(ProtocolEvent::RollForward { block, .. }) => assert_eq!(block, full),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_block_becomes_error_event() {
        let (bridge, mut events) = EventBridge::channel(4);

        let err = bridge
            .roll_forward(&NoFetch, BlockData::Unknown { block_type: 99 }, tip(1))
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::UnknownBlock(99));

        match events.next_event().await {
            Some(ProtocolEvent::SessionError { cause }) => {
                assert!(matches!(cause, GatewayError::Session(NodeError::UnknownBlock(99))))
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_fetch_becomes_error_event() {
        let (bridge, mut events) = EventBridge::channel(4);
        let header = BlockHeader {
            era: Era::Conway,
            slot: 5,
            hash: vec![5],
            number: 1,
        };

        assert!(bridge
            .roll_forward(&NoFetch, BlockData::Header(header), tip(5))
            .await
            .is_err());
        assert!(matches!(
            events.next_event().await,
            Some(ProtocolEvent::SessionError { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_channel_blocks_producer() {
        let (bridge, mut events) = EventBridge::channel(1);
        bridge.roll_backward(ChainPoint::origin(), tip(0)).await.unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            bridge.roll_backward(ChainPoint::origin(), tip(0)),
        )
        .await;
        assert!(blocked.is_err(), "second send should wait for the consumer");

        events.next_event().await.unwrap();
        bridge.roll_backward(ChainPoint::origin(), tip(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_consumer_reports_session_closed() {
        let (bridge, events) = EventBridge::channel(1);
        drop(events);
        assert_eq!(
            bridge.roll_backward(ChainPoint::origin(), tip(0)).await,
            Err(NodeError::SessionClosed)
        );
    }

    proptest! {
        #[test]
        fn prop_events_arrive_in_producer_order(ops in proptest::collection::vec(any::<(bool, u16)>(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let (bridge, mut events) = EventBridge::channel(2);
                let expected = ops.clone();
                let producer = tokio::spawn(async move {
                    for (forward, slot) in ops {
                        let slot = u64::from(slot);
                        if forward {
                            bridge.roll_forward(&NoFetch, BlockData::Block(block(slot)), tip(slot)).await.unwrap();
                        } else {
                            bridge.roll_backward(ChainPoint::new(slot, vec![1]), tip(slot)).await.unwrap();
                        }
                    }
                });

                for (forward, slot) in expected {
                    let slot = u64::from(slot);
                    match events.next_event().await.unwrap() {
                        ProtocolEvent::RollForward { block, .. } => {
                            assert!(forward);
                            assert_eq!(block.slot, slot);
                        }
                        ProtocolEvent::RollBackward { point, .. } => {
                            assert!(!forward);
                            assert_eq!(point.slot, slot);
                        }
                        ProtocolEvent::SessionError { cause } => panic!("unexpected error {cause}"),
                    }
                }
                producer.await.unwrap();
            });
        }
    }
}
