//! Gateway error taxonomy and its JSON-RPC rendering.
//!
//! [`GatewayError`] is what the node layer returns. Every API surface maps it
//! to its own wire shape: an HTTP status plus `{"kind", "error"}` body for
//! REST, an [`ApiError`] for JSON-RPC.

use crate::domain::config::ConfigError;
use crate::domain::types::RejectReason;
use crate::ledger::LedgerError;
use crate::node::NodeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// JSON-RPC 2.0 error codes
pub mod codes {
    // JSON-RPC 2.0 standard errors
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    // Server errors (-32000 to -32099)
    pub const NODE_UNAVAILABLE: i32 = -32002;
    pub const TRANSACTION_REJECTED: i32 = -32003;
    pub const TIMEOUT: i32 = -32004;
}

/// Coarse error category carried on every failure response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Connection,
    Session,
    Rejected,
    Malformed,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Connection => "connection",
            ErrorKind::Session => "session",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a gateway operation against the node.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Missing or contradictory connection target
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Dial or handshake failure
    #[error("cannot connect to node: {0}")]
    Connection(String),

    /// Failure of an established session
    #[error("node session failed: {0}")]
    Session(NodeError),

    /// The node refused a submitted transaction
    #[error("transaction rejected: {0}")]
    Rejected(RejectReason),

    /// Undecodable input, rejected before reaching the node
    #[error("malformed input: {0}")]
    Malformed(String),

    /// A node call exceeded its deadline
    #[error("node call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl GatewayError {
    pub fn malformed(reason: impl fmt::Display) -> Self {
        Self::Malformed(reason.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Configuration(_) => ErrorKind::Configuration,
            GatewayError::Connection(_) => ErrorKind::Connection,
            GatewayError::Session(_) => ErrorKind::Session,
            GatewayError::Rejected(_) => ErrorKind::Rejected,
            GatewayError::Malformed(_) => ErrorKind::Malformed,
            GatewayError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// `true` when the session ended because it was closed locally.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, GatewayError::Session(NodeError::SessionClosed))
    }
}

impl From<NodeError> for GatewayError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::Dial(msg) | NodeError::Handshake(msg) => GatewayError::Connection(msg),
            NodeError::Rejected(reason) => GatewayError::Rejected(reason),
            NodeError::Timeout(after) => GatewayError::Timeout(after),
            other => GatewayError::Session(other),
        }
    }
}

impl From<LedgerError> for GatewayError {
    fn from(e: LedgerError) -> Self {
        GatewayError::malformed(e)
    }
}

impl From<hex::FromHexError> for GatewayError {
    fn from(e: hex::FromHexError) -> Self {
        GatewayError::Malformed(format!("invalid hex: {e}"))
    }
}

impl From<ConfigError> for GatewayError {
    fn from(e: ConfigError) -> Self {
        GatewayError::Configuration(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// JSON-RPC error with code, message and optional data
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i32, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl Serialize for ApiError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ApiError", 3)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        if let Some(ref data) = self.data {
            state.serialize_field("data", data)?;
        }
        state.end()
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        let kind = e.kind();
        let (code, data) = match &e {
            GatewayError::Configuration(_) => (codes::INTERNAL_ERROR, None),
            GatewayError::Connection(_) | GatewayError::Session(_) => {
                (codes::NODE_UNAVAILABLE, None)
            }
            GatewayError::Rejected(reason) => (
                codes::TRANSACTION_REJECTED,
                Some(serde_json::json!({ "reason_cbor": hex::encode(reason.as_bytes()) })),
            ),
            GatewayError::Malformed(_) => (codes::INVALID_PARAMS, None),
            GatewayError::Timeout(_) => (codes::TIMEOUT, None),
        };
        let mut data = data.unwrap_or_else(|| serde_json::json!({}));
        data["kind"] = serde_json::Value::from(kind.as_str());
        ApiError::with_data(code, e.to_string(), data)
    }
}

impl From<ApiError> for jsonrpsee::types::ErrorObjectOwned {
    fn from(e: ApiError) -> Self {
        jsonrpsee::types::ErrorObject::owned(e.code, e.message, e.data)
    }
}

/// Process-level failures of the gateway service itself.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("server bind error: {0}")]
    Bind(String),

    #[error("server error: {0}")]
    Server(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_errors_map_to_kinds() {
        let cases = [
            (NodeError::Dial("refused".into()), ErrorKind::Connection),
            (NodeError::Handshake("bad magic".into()), ErrorKind::Connection),
            (NodeError::SessionClosed, ErrorKind::Session),
            (NodeError::ConnectionLost("eof".into()), ErrorKind::Session),
            (
                NodeError::Rejected(RejectReason::new(vec![0x01])),
                ErrorKind::Rejected,
            ),
            (
                NodeError::Timeout(std::time::Duration::from_secs(1)),
                ErrorKind::Timeout,
            ),
        ];
        for (node_err, kind) in cases {
            assert_eq!(GatewayError::from(node_err).kind(), kind);
        }
    }

    #[test]
    fn test_ledger_error_is_malformed() {
        let err: GatewayError = LedgerError::Empty.into();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn test_rejection_keeps_raw_reason_in_rpc_data() {
        let err = GatewayError::Rejected(RejectReason::new(vec![0x82, 0x01, 0x02]));
        let api: ApiError = err.into();
        assert_eq!(api.code, codes::TRANSACTION_REJECTED);
        let data = api.data.unwrap();
        assert_eq!(data["reason_cbor"], "820102");
        assert_eq!(data["kind"], "rejected");
        assert!(api.message.contains("[1, 2]"));
    }

    #[test]
    fn test_api_error_serialization() {
        let err = ApiError::new(codes::INVALID_PARAMS, "missing tx");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("-32602"));
        assert!(!json.contains("data"));
    }

    #[test]
    fn test_into_jsonrpsee_error() {
        let obj: jsonrpsee::types::ErrorObjectOwned =
            ApiError::from(GatewayError::Timeout(std::time::Duration::from_secs(2))).into();
        assert_eq!(obj.code(), codes::TIMEOUT);
    }
}
