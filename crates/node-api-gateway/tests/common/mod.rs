//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use node_api_gateway::domain::config::GatewayConfig;
use node_api_gateway::{AppState, GatewayMetrics, MemoryNode, SessionManager, TxHash};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

fn small_uint(n: u8) -> Vec<u8> {
    if n < 24 {
        vec![n]
    } else {
        vec![0x18, n]
    }
}

/// `[ {2: salt, era_key: 0}, {}, true, null ]`
fn four_part_tx(era_key: u8, salt: u8) -> Vec<u8> {
    let mut tx = vec![0x84, 0xa2, 0x02];
    tx.extend(small_uint(salt));
    tx.extend([era_key, 0x00, 0xa0, 0xf5, 0xf6]);
    tx
}

pub fn babbage_tx(salt: u8) -> Vec<u8> {
    four_part_tx(0x12, salt)
}

pub fn conway_tx(salt: u8) -> Vec<u8> {
    four_part_tx(0x13, salt)
}

pub fn hash_of(raw: &[u8]) -> TxHash {
    node_api_gateway::ledger::tx_hash(raw).expect("fixture must decode")
}

/// TCP target on the in-memory node, every listener on an ephemeral port.
pub fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.node.address = Some("127.0.0.1".into());
    config.node.port = Some(3001);
    config.node.call_timeout = Duration::from_secs(2);
    config.api.listen_address = [127, 0, 0, 1].into();
    config.api.listen_port = 0;
    config.rpc.listen_port = 0;
    config.metrics.listen_port = 0;
    config
}

pub fn state(node: &MemoryNode) -> AppState {
    let sessions = SessionManager::new(
        &config().node,
        Arc::new(node.clone()),
        Arc::new(GatewayMetrics::new()),
    )
    .expect("valid node config");
    AppState::new(Arc::new(sessions))
}

/// Poll `check` until it holds or [`WAIT`] runs out.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut).await.expect("timed out")
}
