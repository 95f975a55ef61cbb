//! Domain types for the gateway: configuration, errors and value types.

pub mod config;
pub mod correlation;
pub mod error;
pub mod types;

pub use config::{GatewayConfig, LoggingConfig, NodeTarget};
pub use correlation::CorrelationId;
pub use error::{ApiError, ErrorKind, GatewayError, GatewayResult};
pub use types::*;
