#![allow(missing_docs)]

//! Node API gateway: a ledger node's local mini-protocols as HTTP APIs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         NODE API GATEWAY                              │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐                │
//! │  │ REST + WS    │  │ JSON-RPC     │  │ Metrics      │                │
//! │  │ /api/...     │  │ build/query/ │  │ /metrics     │                │
//! │  │              │  │ submit/sync/ │  │ /healthz     │                │
//! │  │              │  │ watch        │  │              │                │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────────┘                │
//! │         │                 │                                           │
//! │  ┌──────┴─────────────────┴──────────────────────────┐                │
//! │  │ QueryFacade · SubmissionCoordinator · Responder   │                │
//! │  └──────┬─────────────────┬──────────────────────────┘                │
//! │         │                 │                                           │
//! │  ┌──────┴──────┐   ┌──────┴───────┐   ┌──────────────┐               │
//! │  │ ScopedSession│◄──│ EventBridge  │   │ MempoolCursor│               │
//! │  └──────┬──────┘   └──────────────┘   └──────────────┘               │
//! └─────────┼────────────────────────────────────────────────────────────┘
//!           │  NodeConnector (supplied by the host)
//!           ▼
//!     node: chain-sync · state query · tx monitor · tx submission
//! ```
//!
//! Every inbound request owns exactly one node session, opened on arrival
//! and closed when the request (or stream) ends.
//!
//! # Usage
//!
//! ```ignore
//! use node_api_gateway::{GatewayConfig, GatewayService};
//!
//! let config = GatewayConfig::load(Some(path))?;
//! node_api_gateway::telemetry::init_tracing(&config.logging)?;
//! let mut service = GatewayService::new(config, connector)?;
//! service.start().await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod domain;
pub mod ledger;
pub mod middleware;
pub mod node;
pub mod responder;
pub mod rest;
pub mod rpc;
pub mod service;
pub mod telemetry;
pub mod ws;

pub use domain::config::GatewayConfig;
pub use domain::error::{ApiError, ErrorKind, GatewayError, GatewayResult, ServiceError};
pub use domain::types::*;
pub use middleware::GatewayMetrics;
pub use node::{MemoryNode, NodeConnector, QueryFacade, SessionManager, SubmissionCoordinator};
pub use responder::{EventSource, StreamEnd, StreamResponder, StreamSink};
pub use rest::AppState;
pub use service::{BoundAddrs, GatewayService};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
