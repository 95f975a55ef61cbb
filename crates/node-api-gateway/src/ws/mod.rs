//! WebSocket push of chain-sync events.

pub mod handler;

pub use handler::{chain_sync, render_event, SocketSink, SyncParams};
