//! Value types shared by the node layer and every API surface.
//!
//! Binary fields (hashes, raw CBOR) are hex strings in every JSON shape.

use crate::ledger::cbor;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ledger era, numbered the way the node's hard-fork combinator numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Era {
    Byron,
    Shelley,
    Allegra,
    Mary,
    Alonzo,
    Babbage,
    Conway,
}

impl Era {
    pub const ALL: [Era; 7] = [
        Era::Byron,
        Era::Shelley,
        Era::Allegra,
        Era::Mary,
        Era::Alonzo,
        Era::Babbage,
        Era::Conway,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u64) -> Option<Self> {
        Self::ALL.get(usize::try_from(id).ok()?).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Era::Byron => "Byron",
            Era::Shelley => "Shelley",
            Era::Allegra => "Allegra",
            Era::Mary => "Mary",
            Era::Alonzo => "Alonzo",
            Era::Babbage => "Babbage",
            Era::Conway => "Conway",
        }
    }
}

impl fmt::Display for Era {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Blake2b-256 transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxHash([u8; 32]);

impl TxHash {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", self.to_hex())
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for TxHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut out)?;
        Ok(Self(out))
    }
}

impl Serialize for TxHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A position on the chain. The origin has slot 0 and an empty hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainPoint {
    pub slot: u64,
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
}

impl ChainPoint {
    pub fn new(slot: u64, hash: impl Into<Vec<u8>>) -> Self {
        Self {
            slot,
            hash: hash.into(),
        }
    }

    pub fn origin() -> Self {
        Self {
            slot: 0,
            hash: Vec::new(),
        }
    }

    pub fn is_origin(&self) -> bool {
        self.hash.is_empty()
    }
}

impl fmt::Display for ChainPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_origin() {
            f.write_str("origin")
        } else {
            write!(f, "{}@{}", hex::encode(&self.hash), self.slot)
        }
    }
}

/// The node's chain tip as reported alongside chain-sync messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tip {
    #[serde(flatten)]
    pub point: ChainPoint,
    pub block_number: u64,
}

impl Tip {
    pub fn new(point: ChainPoint, block_number: u64) -> Self {
        Self {
            point,
            block_number,
        }
    }
}

/// Opaque rejection payload returned by the node's submission protocol.
///
/// The bytes are kept verbatim; the display form is derived on demand.
#[derive(Clone, PartialEq, Eq)]
pub struct RejectReason(Bytes);

impl RejectReason {
    pub fn new(cbor: impl Into<Bytes>) -> Self {
        Self(cbor.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// CBOR diagnostic notation of the payload.
    pub fn display(&self) -> String {
        cbor::diagnostic(&self.0)
    }
}

impl fmt::Debug for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RejectReason({})", hex::encode(&self.0))
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentEraResponse {
    pub id: u8,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStartResponse {
    pub year: i32,
    pub day: u32,
    pub picoseconds: u64,
    /// RFC 3339 rendering, absent when the fields do not form a valid date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipResponse {
    pub era: String,
    pub epoch_no: u64,
    pub block_no: u64,
    pub slot_no: u64,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolSizesResponse {
    pub capacity: u32,
    pub size: u32,
    pub tx_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasTxResponse {
    pub has_tx: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolTxResponse {
    pub tx_hash: String,
    pub tx_bytes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTipResponse {
    pub slot: u64,
    pub height: u64,
    pub hash: String,
}

/// Serde adapter for `Vec<u8>` as a hex string.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_era_ids_round_trip() {
        for era in Era::ALL {
            assert_eq!(Era::from_id(era.id() as u64), Some(era));
        }
        assert_eq!(Era::from_id(7), None);
        assert_eq!(Era::Conway.id(), 6);
    }

    #[test]
    fn test_tx_hash_parse() {
        let hex_str = "aa".repeat(32);
        let hash: TxHash = hex_str.parse().unwrap();
        assert_eq!(hash.as_bytes(), &[0xaa; 32]);
        assert_eq!(hash.to_string(), hex_str);

        assert!("aabb".parse::<TxHash>().is_err());
        assert!("zz".repeat(32).parse::<TxHash>().is_err());
    }

    #[test]
    fn test_chain_point_json() {
        let point = ChainPoint::new(42, vec![0xde, 0xad]);
        let json = serde_json::to_value(&point).unwrap();
        assert_eq!(json, serde_json::json!({"slot": 42, "hash": "dead"}));

        let parsed: ChainPoint = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, point);
    }

    #[test]
    fn test_tip_flattens_point() {
        let tip = Tip::new(ChainPoint::new(7, vec![1]), 3);
        let json = serde_json::to_value(&tip).unwrap();
        assert_eq!(json["slot"], 7);
        assert_eq!(json["hash"], "01");
        assert_eq!(json["block_number"], 3);
    }

    #[test]
    fn test_origin_display() {
        assert_eq!(ChainPoint::origin().to_string(), "origin");
        assert!(ChainPoint::origin().is_origin());
    }

    #[test]
    fn test_reject_reason_display() {
        // [1, "bad"]
        let reason = RejectReason::new(vec![0x82, 0x01, 0x63, b'b', b'a', b'd']);
        assert_eq!(reason.display(), "[1, \"bad\"]");
        assert_eq!(reason.as_bytes().len(), 6);
    }
}
