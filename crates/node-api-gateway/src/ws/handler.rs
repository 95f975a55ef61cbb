//! Chain-sync push over WebSocket.
//!
//! Parameters are validated and the node session is opened before the
//! upgrade, so bad input and unreachable nodes are plain HTTP errors. After
//! the upgrade, chain-sync starts and every event becomes one JSON text frame.

use crate::domain::error::{GatewayError, GatewayResult};
use crate::domain::types::ChainPoint;
use crate::node::{FollowFrom, PreparedFollow, ProtocolEvent};
use crate::responder::{SinkClosed, StreamResponder, StreamSink};
use crate::rest::AppState;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Query string of `/api/chainsync/sync`. Kept as text so that bad values
/// surface as `malformed` errors rather than extractor rejections.
#[derive(Debug, Default, Deserialize)]
pub struct SyncParams {
    pub tip: Option<String>,
    pub slot: Option<String>,
    pub hash: Option<String>,
}

impl SyncParams {
    pub fn follow_from(&self) -> GatewayResult<FollowFrom> {
        let from_tip = match self.tip.as_deref() {
            None => false,
            Some(flag) => parse_flag(flag).ok_or_else(|| {
                GatewayError::Malformed(format!("tip must be true or false, got {flag:?}"))
            })?,
        };
        if from_tip {
            return Ok(FollowFrom::Tip);
        }

        let (Some(slot), Some(hash)) = (self.slot.as_deref(), self.hash.as_deref()) else {
            return Err(GatewayError::malformed(
                "either tip=true or both slot and hash are required",
            ));
        };
        let slot: u64 = slot
            .parse()
            .map_err(|_| GatewayError::Malformed(format!("invalid slot {slot:?}")))?;
        if hash.is_empty() {
            return Err(GatewayError::malformed("hash cannot be empty"));
        }
        let hash = hex::decode(hash)?;
        Ok(FollowFrom::Points(vec![ChainPoint::new(slot, hash)]))
    }
}

/// Boolean query flag: `1`, `t`, `true` and `0`, `f`, `false`, any case.
fn parse_flag(flag: &str) -> Option<bool> {
    match flag.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

pub async fn chain_sync(
    State(state): State<AppState>,
    Query(params): Query<SyncParams>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let from = match params.follow_from() {
        Ok(from) => from,
        Err(e) => return e.into_response(),
    };
    let Some(ws) = ws else {
        return (
            StatusCode::UPGRADE_REQUIRED,
            Json(serde_json::json!({
                "kind": "malformed",
                "error": "chain sync is served over WebSocket only",
            })),
        )
            .into_response();
    };

    let prepared = match state.sessions.prepare_follow(from).await {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!(error = %e, "cannot prepare chain sync");
            return e.into_response();
        }
    };
    ws.on_upgrade(move |socket| stream_chain(prepared, socket))
}

async fn stream_chain(mut prepared: PreparedFollow, socket: WebSocket) {
    let mut sink = SocketSink::new(socket);
    if let Err(e) = prepared.begin().await {
        warn!(session = %prepared.session.id(), error = %e, "chain sync did not start");
        sink.send_error(&e).await;
        prepared.session.close().await;
        return;
    }

    let PreparedFollow {
        session, events, ..
    } = prepared;
    info!(session = %session.id(), "chain sync stream attached");
    let end = StreamResponder::new(&session, events, sink)
        .run(render_event)
        .await;
    let end = session.finish(end).await;
    debug!(end = ?end, "chain sync socket done");
}

/// Wire shape of one chain-sync event.
pub fn render_event(event: ProtocolEvent) -> Option<serde_json::Value> {
    match event {
        ProtocolEvent::RollForward { block, tip } => Some(serde_json::json!({
            "type": "rollForward",
            "block": block.summary(),
            "tip": tip,
        })),
        ProtocolEvent::RollBackward { point, tip } => Some(serde_json::json!({
            "type": "rollBackward",
            "point": point,
            "tip": tip,
        })),
        ProtocolEvent::SessionError { .. } => None,
    }
}

/// Server side of one chain-sync socket.
pub struct SocketSink {
    socket: WebSocket,
    gone: bool,
}

impl SocketSink {
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            gone: false,
        }
    }
}

#[async_trait]
impl StreamSink for SocketSink {
    async fn send(&mut self, item: serde_json::Value) -> Result<(), SinkClosed> {
        if self.gone {
            return Err(SinkClosed);
        }
        self.socket
            .send(Message::Text(item.to_string()))
            .await
            .map_err(|e| {
                debug!(error = %e, "websocket write failed");
                self.gone = true;
                SinkClosed
            })
    }

    async fn send_error(&mut self, error: &GatewayError) {
        let frame = serde_json::json!({
            "type": "error",
            "kind": error.kind(),
            "message": error.to_string(),
        });
        if self.send(frame).await.is_ok() {
            let _ = self.socket.send(Message::Close(None)).await;
        }
        self.gone = true;
    }

    async fn closed(&mut self) {
        while !self.gone {
            match self.socket.recv().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => self.gone = true,
                Some(Ok(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Era, Tip};
    use crate::node::Block;

    fn params(tip: Option<&str>, slot: Option<&str>, hash: Option<&str>) -> SyncParams {
        SyncParams {
            tip: tip.map(String::from),
            slot: slot.map(String::from),
            hash: hash.map(String::from),
        }
    }

    #[test]
    fn test_tip_wins() {
        for flag in ["true", "True", "TRUE", "t", "T", "1"] {
            assert_eq!(params(Some(flag), None, None).follow_from().unwrap(), FollowFrom::Tip, "{flag}");
        }
        assert_eq!(
            params(Some("true"), Some("5"), Some("ab")).follow_from().unwrap(),
            FollowFrom::Tip
        );
    }

    #[test]
    fn test_false_flag_forms_need_a_point() {
        for flag in ["false", "False", "FALSE", "f", "0"] {
            assert_eq!(
                params(Some(flag), Some("7"), Some("ab")).follow_from().unwrap(),
                FollowFrom::Points(vec![ChainPoint::new(7, vec![0xab])]),
                "{flag}"
            );
        }
    }

    #[test]
    fn test_explicit_point() {
        assert_eq!(
            params(None, Some("100"), Some("abcd")).follow_from().unwrap(),
            FollowFrom::Points(vec![ChainPoint::new(100, vec![0xab, 0xcd])])
        );
    }

    #[test]
    fn test_bad_params_are_malformed() {
        let cases = [
            params(None, None, None),
            params(Some("false"), Some("1"), None),
            params(None, Some("x"), Some("ab")),
            params(None, Some("1"), Some("")),
            params(None, Some("1"), Some("zz")),
            params(Some("yes"), None, None),
            params(Some("2"), None, None),
            params(Some(""), None, None),
            params(Some("truee"), None, None),
        ];
        for case in cases {
            let err = case.follow_from().unwrap_err();
            assert_eq!(err.kind(), crate::domain::error::ErrorKind::Malformed, "{case:?}");
        }
    }

    #[test]
    fn test_render_roll_forward() {
        let block = Block {
            era: Era::Conway,
            slot: 40,
            hash: vec![1, 2],
            number: 2,
            transactions: Vec::new(),
        };
        let tip = Tip::new(block.point(), 2);
        let frame = render_event(ProtocolEvent::RollForward { block, tip }).unwrap();

        assert_eq!(frame["type"], "rollForward");
        assert_eq!(frame["block"]["hash"], "0102");
        assert_eq!(frame["block"]["era"], "Conway");
        assert_eq!(frame["tip"]["slot"], 40);
        assert_eq!(frame["tip"]["block_number"], 2);
    }

    #[test]
    fn test_render_roll_backward() {
        let frame = render_event(ProtocolEvent::RollBackward {
            point: ChainPoint::origin(),
            tip: Tip::new(ChainPoint::origin(), 0),
        })
        .unwrap();
        assert_eq!(frame["type"], "rollBackward");
        assert_eq!(frame["point"], serde_json::json!({"slot": 0, "hash": ""}));
    }
}
