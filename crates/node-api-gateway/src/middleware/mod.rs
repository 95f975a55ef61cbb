//! HTTP middleware: CORS, request tracing and process metrics.

pub mod cors;
pub mod metrics;
pub mod tracing;

pub use cors::create_cors_layer;
pub use metrics::{GatewayMetrics, RequestTimer};
pub use tracing::{TracingLayer, REQUEST_ID_HEADER};
