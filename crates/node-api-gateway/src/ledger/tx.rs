use super::cbor::{self, CborError, Item};
use crate::domain::types::{Era, TxHash};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use bytes::Bytes;
use thiserror::Error;

/// The submission protocol identifies a transaction's format by its era.
pub type TxKind = Era;

type Blake2b256 = Blake2b<U32>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("empty transaction")]
    Empty,
    #[error("invalid transaction cbor: {0}")]
    Cbor(#[from] CborError),
    #[error("unrecognized transaction layout: {0}")]
    UnknownLayout(&'static str),
    #[error("transaction does not match era {0}")]
    KindMismatch(Era),
}

/// A parsed transaction: its era, canonical hash and the exact bytes it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub kind: TxKind,
    pub hash: TxHash,
    pub cbor: Bytes,
}

/// Blake2b-256 over `bytes`.
pub fn content_hash(bytes: &[u8]) -> TxHash {
    let digest = Blake2b256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    TxHash::new(out)
}

/// Determine which era's format a raw transaction uses.
///
/// Layouts:
/// - Byron: `[tx, witnesses]` where `tx = [inputs, outputs, attributes]`
/// - Shelley, Allegra, Mary: `[body, witnesses, auxiliary]`
/// - Alonzo, Babbage, Conway: `[body, witnesses, is_valid, auxiliary]`
///
/// Within a layout the era is the newest one whose body keys appear.
pub fn classify_tx(bytes: &[u8]) -> Result<TxKind, LedgerError> {
    if bytes.is_empty() {
        return Err(LedgerError::Empty);
    }
    let root = cbor::decode(bytes)?;
    classify_item(&root)
}

/// Parse `bytes` as a transaction of `kind`, computing its hash.
pub fn parse_tx(kind: TxKind, bytes: &[u8]) -> Result<Tx, LedgerError> {
    if bytes.is_empty() {
        return Err(LedgerError::Empty);
    }
    let root = cbor::decode(bytes)?;
    if classify_item(&root)? != kind {
        return Err(LedgerError::KindMismatch(kind));
    }
    let parts = root
        .as_array()
        .ok_or(LedgerError::UnknownLayout("not an array"))?;
    // Byron hashes the inner tx, every later era hashes the body map.
    let hashed = &parts[0].span;
    Ok(Tx {
        kind,
        hash: content_hash(&bytes[hashed.clone()]),
        cbor: Bytes::copy_from_slice(bytes),
    })
}

/// Classify and parse in one step, keeping only the hash.
pub fn tx_hash(bytes: &[u8]) -> Result<TxHash, LedgerError> {
    let kind = classify_tx(bytes)?;
    parse_tx(kind, bytes).map(|tx| tx.hash)
}

fn classify_item(root: &Item<'_>) -> Result<TxKind, LedgerError> {
    let parts = root
        .as_array()
        .ok_or(LedgerError::UnknownLayout("not an array"))?;

    match parts.len() {
        2 => match parts[0].as_array() {
            Some(inner) if inner.len() == 3 => Ok(Era::Byron),
            _ => Err(LedgerError::UnknownLayout("two elements but no byron tx")),
        },
        3 => {
            let keys = body_keys(&parts[0])?;
            Ok(if keys.contains(&9) {
                Era::Mary
            } else if keys.contains(&8) {
                Era::Allegra
            } else {
                Era::Shelley
            })
        }
        4 => {
            let keys = body_keys(&parts[0])?;
            Ok(if keys.iter().any(|k| (19..=22).contains(k)) {
                Era::Conway
            } else if keys.iter().any(|k| (16..=18).contains(k)) {
                Era::Babbage
            } else {
                Era::Alonzo
            })
        }
        _ => Err(LedgerError::UnknownLayout("unexpected element count")),
    }
}

fn body_keys(body: &Item<'_>) -> Result<Vec<u64>, LedgerError> {
    if body.as_map().is_none() {
        return Err(LedgerError::UnknownLayout("body is not a map"));
    }
    Ok(body.map_keys().collect())
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Well-formed transactions for each layout.

    use crate::ledger::cbor::encode;

    fn body(keys: &[u64], salt: u64) -> Vec<u8> {
        let mut entries = vec![(encode::uint(2), encode::uint(salt))];
        entries.extend(keys.iter().map(|k| (encode::uint(*k), encode::uint(0))));
        encode::map(&entries)
    }

    pub fn shelley(salt: u64) -> Vec<u8> {
        encode::array(&[body(&[], salt), encode::map(&[]), vec![0xf6]])
    }

    pub fn mary(salt: u64) -> Vec<u8> {
        encode::array(&[body(&[9], salt), encode::map(&[]), vec![0xf6]])
    }

    pub fn babbage(salt: u64) -> Vec<u8> {
        encode::array(&[body(&[18], salt), encode::map(&[]), vec![0xf5], vec![0xf6]])
    }

    pub fn conway(salt: u64) -> Vec<u8> {
        encode::array(&[body(&[19], salt), encode::map(&[]), vec![0xf5], vec![0xf6]])
    }

    pub fn byron(salt: u64) -> Vec<u8> {
        let tx = encode::array(&[
            encode::array(&[encode::uint(salt)]),
            encode::array(&[]),
            encode::map(&[]),
        ]);
        encode::array(&[tx, encode::array(&[])])
    }

    /// Body span of a post-Byron fixture, i.e. what its hash covers.
    pub fn body_span(tx: &[u8]) -> Vec<u8> {
        let root = crate::ledger::cbor::decode(tx).unwrap();
        let span = root.as_array().unwrap()[0].span.clone();
        tx[span].to_vec()
    }
}
