//! Ledger utilities: transaction classification, parsing and hashing.
//!
//! These are pure functions over raw CBOR bytes. The node layer and the API
//! surfaces only ever see the results ([`Tx`], hashes, eras).

pub mod cbor;
pub(crate) mod tx;

pub use tx::{classify_tx, content_hash, parse_tx, tx_hash, LedgerError, Tx, TxKind};
