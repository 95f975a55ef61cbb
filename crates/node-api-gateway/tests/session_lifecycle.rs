//! Session ownership, fault propagation and mempool cursor discipline.

mod common;

use common::{babbage_tx, config, within};
use node_api_gateway::node::memory::MonitorCall;
use node_api_gateway::node::{CursorState, MempoolCursor, MempoolWatch, NodeError};
use node_api_gateway::{ErrorKind, GatewayError, GatewayMetrics, MemoryNode, QueryFacade, SessionManager};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn sessions(node: &MemoryNode, call_timeout: Duration) -> Arc<SessionManager> {
    let mut node_config = config().node;
    node_config.call_timeout = call_timeout;
    let manager = SessionManager::new(
        &node_config,
        Arc::new(node.clone()),
        Arc::new(GatewayMetrics::new()),
    )
    .unwrap();
    Arc::new(manager)
}

/// A `next_tx` that returned an entry after one that returned none, with no
/// release or acquire in between.
fn read_past_exhaustion(calls: &[MonitorCall]) -> bool {
    let mut exhausted = false;
    for call in calls {
        match call {
            MonitorCall::Acquire | MonitorCall::Release => exhausted = false,
            MonitorCall::NextTx(false) => exhausted = true,
            MonitorCall::NextTx(true) if exhausted => return true,
            MonitorCall::NextTx(true) => {}
            MonitorCall::NextTxRefused => return true,
            MonitorCall::HasTx(_) => {}
        }
    }
    false
}

#[derive(Debug, Clone)]
enum CursorOp {
    Next,
    Drain,
    Sizes,
    Contains(u8),
    AddThenRefresh(u8),
}

fn cursor_op() -> impl Strategy<Value = CursorOp> {
    prop_oneof![
        3 => Just(CursorOp::Next),
        1 => Just(CursorOp::Drain),
        1 => Just(CursorOp::Sizes),
        1 => (0u8..8).prop_map(CursorOp::Contains),
        2 => (0u8..8).prop_map(CursorOp::AddThenRefresh),
    ]
}

async fn drive_cursor(node: &MemoryNode, seeded: &[u8], ops: &[CursorOp]) {
    for salt in seeded {
        node.add_to_mempool(babbage_tx(*salt));
    }
    let sessions = sessions(node, Duration::from_secs(2));
    let session = sessions.open().await.unwrap();
    let mut cursor = MempoolCursor::start(&session).await.unwrap();

    for op in ops {
        // Misuse is refused locally; only the node's view matters here.
        match op {
            CursorOp::Next => {
                let _ = cursor.next_entry().await;
            }
            CursorOp::Drain => {
                let _ = cursor.drain().await;
            }
            CursorOp::Sizes => {
                cursor.sizes().await.unwrap();
            }
            CursorOp::Contains(salt) => {
                let _ = cursor.contains(&common::hash_of(&babbage_tx(*salt))).await;
            }
            CursorOp::AddThenRefresh(salt) => {
                node.add_to_mempool(babbage_tx(*salt));
                cursor.refresh().await.unwrap();
                assert_eq!(cursor.state(), CursorState::Acquired);
            }
        }
    }
    cursor.release().await.unwrap();
    session.close().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_cursor_never_reads_a_drained_snapshot(
        seeded in proptest::collection::vec(0u8..8, 0..4),
        ops in proptest::collection::vec(cursor_op(), 1..24),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let node = MemoryNode::new();
        runtime.block_on(drive_cursor(&node, &seeded, &ops));

        let calls = node.monitor_calls();
        prop_assert!(!read_past_exhaustion(&calls), "{:?}", calls);
        prop_assert_eq!(calls.first(), Some(&MonitorCall::Acquire));
        prop_assert_eq!(node.sessions_live(), 0);
    }
}

#[test]
fn test_exhaustion_check_flags_bad_sequences() {
    use MonitorCall::*;
    assert!(!read_past_exhaustion(&[Acquire, NextTx(true), NextTx(false), Release, Acquire, NextTx(true)]));
    assert!(read_past_exhaustion(&[Acquire, NextTx(false), NextTx(true)]));
    assert!(read_past_exhaustion(&[Acquire, NextTxRefused]));
}

#[tokio::test]
async fn test_cursor_refuses_exhausted_snapshot_locally() {
    let node = MemoryNode::new();
    node.add_to_mempool(babbage_tx(1));
    let sessions = sessions(&node, Duration::from_secs(2));
    let session = sessions.open().await.unwrap();
    let mut cursor = MempoolCursor::start(&session).await.unwrap();

    assert_eq!(cursor.drain().await.unwrap().len(), 1);
    assert_eq!(cursor.state(), CursorState::Exhausted);
    let err = assert_err!(cursor.next_entry().await);
    assert_eq!(err.kind(), ErrorKind::Session);

    assert_eq!(
        node.monitor_calls(),
        [MonitorCall::Acquire, MonitorCall::NextTx(true), MonitorCall::NextTx(false)]
    );
    session.close().await;
}

#[tokio::test]
async fn test_contains_is_answered_by_held_snapshot() {
    let node = MemoryNode::new();
    node.add_to_mempool(babbage_tx(1));
    let sessions = sessions(&node, Duration::from_secs(2));
    let session = sessions.open().await.unwrap();
    let mut cursor = MempoolCursor::start(&session).await.unwrap();

    assert!(assert_ok!(cursor.contains(&common::hash_of(&babbage_tx(1))).await));
    assert!(!assert_ok!(cursor.contains(&common::hash_of(&babbage_tx(2))).await));
    // Added after the acquire, so not part of the held snapshot.
    node.add_to_mempool(babbage_tx(2));
    assert!(!assert_ok!(cursor.contains(&common::hash_of(&babbage_tx(2))).await));
    assert_eq!(cursor.state(), CursorState::Acquired);

    cursor.refresh().await.unwrap();
    assert!(assert_ok!(cursor.contains(&common::hash_of(&babbage_tx(2))).await));
    cursor.release().await.unwrap();
    assert_err!(cursor.contains(&common::hash_of(&babbage_tx(1))).await);

    assert!(!node
        .monitor_calls()
        .iter()
        .any(|call| matches!(call, MonitorCall::NextTx(_))));
    session.close().await;
}

#[tokio::test]
async fn test_watch_yields_only_new_entries() {
    let node = MemoryNode::new();
    node.add_to_mempool(babbage_tx(1));
    let sessions = sessions(&node, Duration::from_secs(2));
    let session = sessions.open().await.unwrap();
    let mut watch = MempoolWatch::start(&session).await.unwrap();

    let first = within(watch.next_new_entry()).await.unwrap();
    assert_eq!(first.hash().unwrap(), common::hash_of(&babbage_tx(1)));

    node.add_to_mempool(babbage_tx(2));
    let second = within(watch.next_new_entry()).await.unwrap();
    assert_eq!(second.hash().unwrap(), common::hash_of(&babbage_tx(2)));

    assert!(!read_past_exhaustion(&node.monitor_calls()));
    session.close().await;
}

#[tokio::test]
async fn test_fault_interrupts_blocking_reacquire() {
    let node = MemoryNode::new();
    let sessions = sessions(&node, Duration::from_secs(2));
    let session = sessions.open().await.unwrap();
    let mut cursor = MempoolCursor::start(&session).await.unwrap();
    cursor.drain().await.unwrap();

    let faulting = node.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        faulting.inject_fault(NodeError::Protocol("mux closed".into()));
    });

    // Nothing changes in the mempool, so only the fault can end this wait.
    let err = assert_err!(within(cursor.refresh()).await);
    assert!(matches!(err, GatewayError::Session(NodeError::Protocol(_))));
    session.close().await;
    assert_eq!(node.sessions_live(), 0);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let node = MemoryNode::new();
    let sessions = sessions(&node, Duration::from_secs(2));
    let session = assert_ok!(sessions.open().await);

    session.close().await;
    session.close().await;
    assert!(session.is_closed());
    drop(session);

    assert_eq!(node.sessions_opened(), 1);
    assert_eq!(node.sessions_closed(), 1);
    assert_eq!(sessions.metrics().sessions_active(), 0);
}

#[tokio::test]
async fn test_dropped_session_is_closed() {
    let node = MemoryNode::new();
    let sessions = sessions(&node, Duration::from_secs(2));

    let session = sessions.open().await.unwrap();
    drop(session);

    assert!(common::eventually(|| node.sessions_closed() == 1).await);
    assert_eq!(sessions.metrics().sessions_active(), 0);
}

#[tokio::test]
async fn test_slow_query_times_out_and_closes() {
    let node = MemoryNode::new();
    node.delay_queries(Some(Duration::from_secs(5)));
    let queries = QueryFacade::new(sessions(&node, Duration::from_millis(100)));

    let err = assert_err!(queries.current_era().await);

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(common::eventually(|| node.sessions_live() == 0).await);
}

#[tokio::test]
async fn test_pending_follow_stops_on_close() {
    let node = MemoryNode::new();
    node.extend_chain(2);
    let sessions = sessions(&node, Duration::from_secs(2));
    let mut follow = sessions
        .prepare_follow(node_api_gateway::node::FollowFrom::Tip)
        .await
        .unwrap();
    assert_ok!(follow.begin().await);
    assert!(within(follow.events.next_event()).await.is_some());
    assert_eq!(node.read_loops(), 1);

    follow.session.close().await;

    assert!(common::eventually(|| node.read_loops() == 0).await);
    assert_eq!(node.sessions_closed(), 1);
}
