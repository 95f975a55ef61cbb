//! Chain-sync over a real WebSocket connection.

mod common;

use common::{config, conway_tx, hash_of, state, within};
use futures::{SinkExt, StreamExt};
use node_api_gateway::node::{FollowFrom, ProtocolEvent};
use node_api_gateway::{rest, MemoryNode};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(node: &MemoryNode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = rest::router(state(node), &config());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, query: &str) -> Socket {
    let url = format!("ws://{addr}/api/chainsync/sync?{query}");
    let (socket, _) = within(connect_async(url)).await.unwrap();
    socket
}

/// Next JSON text frame, `None` once the server closes.
async fn next_frame(socket: &mut Socket) -> Option<Value> {
    loop {
        match within(socket.next()).await? {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

#[tokio::test]
async fn test_stream_starts_at_requested_point() {
    let node = MemoryNode::new();
    let blocks = node.extend_chain(3);
    let addr = serve(&node).await;
    let start = &blocks[0];

    let mut socket = connect(
        addr,
        &format!("slot={}&hash={}", start.slot, hex::encode(&start.hash)),
    )
    .await;

    let first = next_frame(&mut socket).await.unwrap();
    assert_eq!(first["type"], "rollBackward");
    assert_eq!(
        first["point"],
        json!({"slot": start.slot, "hash": hex::encode(&start.hash)})
    );

    for expected in &blocks[1..] {
        let frame = next_frame(&mut socket).await.unwrap();
        assert_eq!(frame["type"], "rollForward");
        assert_eq!(frame["block"]["slot"], expected.slot);
        assert_eq!(frame["block"]["number"], expected.number);
    }
}

#[tokio::test]
async fn test_tip_stream_reports_node_tip() {
    let node = MemoryNode::new();
    node.extend_chain(4);
    let addr = serve(&node).await;

    let mut socket = connect(addr, "tip=true").await;

    let first = next_frame(&mut socket).await.unwrap();
    let tip = node.tip();
    assert_eq!(first["type"], "rollBackward");
    assert_eq!(first["point"]["slot"], tip.point.slot);
    assert_eq!(first["tip"]["slot"], tip.point.slot);
    assert_eq!(first["tip"]["block_number"], tip.block_number);

    let minted = node.mint_block(vec![conway_tx(1).into()]);
    let frame = next_frame(&mut socket).await.unwrap();
    assert_eq!(frame["type"], "rollForward");
    assert_eq!(frame["block"]["slot"], minted.slot);
    assert_eq!(frame["block"]["transactions"], json!([hash_of(&conway_tx(1)).to_hex()]));
    assert_eq!(frame["tip"]["slot"], minted.slot);
}

#[tokio::test]
async fn test_rollback_is_forwarded() {
    let node = MemoryNode::new();
    let blocks = node.extend_chain(3);
    let addr = serve(&node).await;

    let mut socket = connect(addr, "tip=True").await;
    assert_eq!(next_frame(&mut socket).await.unwrap()["type"], "rollBackward");

    node.rollback(1);
    let frame = next_frame(&mut socket).await.unwrap();
    assert_eq!(frame["type"], "rollBackward");
    assert_eq!(frame["point"]["slot"], blocks[0].slot);
}

#[tokio::test]
async fn test_client_disconnect_closes_session_once() {
    let node = MemoryNode::new();
    node.extend_chain(2);
    let addr = serve(&node).await;

    let mut socket = connect(addr, "tip=true").await;
    next_frame(&mut socket).await.unwrap();
    assert_eq!(node.sessions_live(), 1);
    assert_eq!(node.read_loops(), 1);

    socket.close(None).await.unwrap();
    drop(socket);

    assert!(common::eventually(|| node.sessions_live() == 0 && node.read_loops() == 0).await);
    assert_eq!(node.sessions_opened(), 1);
    assert_eq!(node.sessions_closed(), 1);

    // A later chain change must not resurrect or double-close anything.
    node.extend_chain(1);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(node.sessions_closed(), 1);
}

#[tokio::test]
async fn test_unknown_intersection_sends_error_then_closes() {
    let node = MemoryNode::new();
    node.extend_chain(1);
    let addr = serve(&node).await;

    let mut socket = connect(addr, "slot=999&hash=00ff").await;

    let frame = next_frame(&mut socket).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert!(frame["message"].as_str().is_some());
    assert!(next_frame(&mut socket).await.is_none());
    assert!(common::eventually(|| node.sessions_live() == 0).await);
}

#[tokio::test]
async fn test_node_fault_ends_stream() {
    let node = MemoryNode::new();
    node.extend_chain(1);
    let addr = serve(&node).await;

    let mut socket = connect(addr, "tip=true").await;
    next_frame(&mut socket).await.unwrap();

    node.inject_fault(node_api_gateway::node::NodeError::Protocol("bearer reset".into()));

    let frame = next_frame(&mut socket).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["kind"], "session");
    assert!(next_frame(&mut socket).await.is_none());
    assert!(common::eventually(|| node.sessions_live() == 0 && node.read_loops() == 0).await);
}

#[tokio::test]
async fn test_client_frames_are_ignored() {
    let node = MemoryNode::new();
    node.extend_chain(1);
    let addr = serve(&node).await;

    let mut socket = connect(addr, "tip=true").await;
    next_frame(&mut socket).await.unwrap();
    socket.send(Message::Text("ping".into())).await.unwrap();

    let minted = node.mint_block(Vec::new());
    let frame = next_frame(&mut socket).await.unwrap();
    assert_eq!(frame["block"]["slot"], minted.slot);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_first_event_is_requested_point(len in 1usize..12, pick in any::<prop::sample::Index>()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let node = MemoryNode::new();
        let blocks = node.extend_chain(len);
        let requested = blocks[pick.index(len)].point();

        let first = runtime.block_on(async {
            let mut follow = state(&node)
                .sessions
                .prepare_follow(FollowFrom::Points(vec![requested.clone()]))
                .await
                .unwrap();
            follow.begin().await.unwrap();
            let first = within(follow.events.next_event()).await;
            follow.session.close().await;
            first
        });

        match first {
            Some(ProtocolEvent::RollBackward { point, .. }) => prop_assert_eq!(point, requested),
            other => prop_assert!(false, "unexpected first event {:?}", other),
        }
        prop_assert_eq!(node.sessions_live(), 0);
    }
}
