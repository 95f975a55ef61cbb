//! CBOR item tree on top of `minicbor`.
//!
//! Decodes a complete item tree and records the byte span of every item, which
//! is what transaction hashing needs: the hash covers the body exactly as it
//! was serialized, never a re-encoding.

use minicbor::data::Type;
use minicbor::Decoder;
use std::borrow::Cow;
use std::ops::Range;
use thiserror::Error;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CborError {
    #[error("cbor decode: {0}")]
    Decode(String),
    #[error("unsupported cbor initial byte {0:#04x}")]
    Unsupported(u8),
    #[error("nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("{0} trailing bytes after item")]
    Trailing(usize),
}

impl From<minicbor::decode::Error> for CborError {
    fn from(e: minicbor::decode::Error) -> Self {
        CborError::Decode(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value<'a> {
    Unsigned(u64),
    /// Negative integer `-1 - n`.
    Negative(u64),
    Bytes(Cow<'a, [u8]>),
    Text(Cow<'a, str>),
    Array(Vec<Item<'a>>),
    Map(Vec<(Item<'a>, Item<'a>)>),
    Tag(u64, Box<Item<'a>>),
    Bool(bool),
    Null,
    Undefined,
    Float(f64),
    Simple(u8),
}

/// A decoded item together with the bytes it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub struct Item<'a> {
    pub value: Value<'a>,
    pub span: Range<usize>,
}

impl<'a> Item<'a> {
    pub fn as_array(&self) -> Option<&[Item<'a>]> {
        match &self.value {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Item<'a>, Item<'a>)]> {
        match &self.value {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self.value {
            Value::Unsigned(n) => Some(n),
            _ => None,
        }
    }

    /// Unsigned integer keys of a map item; other keys are skipped.
    pub fn map_keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.as_map()
            .into_iter()
            .flatten()
            .filter_map(|(k, _)| k.as_unsigned())
    }
}

/// Decode exactly one item spanning the whole buffer.
pub fn decode(buf: &[u8]) -> Result<Item<'_>, CborError> {
    let mut dec = Decoder::new(buf);
    let item = item(&mut dec, 0)?;
    let used = dec.position();
    if used != buf.len() {
        return Err(CborError::Trailing(buf.len() - used));
    }
    Ok(item)
}

/// Render CBOR diagnostic notation. Undecodable input renders as a byte string.
pub fn diagnostic(buf: &[u8]) -> String {
    match decode(buf) {
        Ok(item) => {
            let mut out = String::new();
            render(&item, &mut out);
            out
        }
        Err(_) => format!("h'{}'", hex::encode(buf)),
    }
}

fn item<'b>(dec: &mut Decoder<'b>, depth: usize) -> Result<Item<'b>, CborError> {
    if depth > MAX_DEPTH {
        return Err(CborError::TooDeep);
    }
    let start = dec.position();

    let value = match dec.datatype()? {
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => Value::Unsigned(dec.u64()?),
        Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::Int => {
            let n = i128::from(dec.int()?);
            match u64::try_from(n) {
                Ok(n) => Value::Unsigned(n),
                Err(_) => Value::Negative(
                    u64::try_from(-1 - n)
                        .map_err(|_| CborError::Decode(format!("integer {n} out of range")))?,
                ),
            }
        }
        Type::Bytes => Value::Bytes(Cow::Borrowed(dec.bytes()?)),
        Type::BytesIndef => {
            let mut out = Vec::new();
            for chunk in dec.bytes_iter()? {
                out.extend_from_slice(chunk?);
            }
            Value::Bytes(Cow::Owned(out))
        }
        Type::String => Value::Text(Cow::Borrowed(dec.str()?)),
        Type::StringIndef => {
            let mut out = String::new();
            for chunk in dec.str_iter()? {
                out.push_str(chunk?);
            }
            Value::Text(Cow::Owned(out))
        }
        Type::Array | Type::ArrayIndef => {
            let mut items = Vec::new();
            match dec.array()? {
                Some(len) => {
                    for _ in 0..len {
                        items.push(item(dec, depth + 1)?);
                    }
                }
                None => {
                    while dec.datatype()? != Type::Break {
                        items.push(item(dec, depth + 1)?);
                    }
                    skip_break(dec);
                }
            }
            Value::Array(items)
        }
        Type::Map | Type::MapIndef => {
            let mut entries = Vec::new();
            match dec.map()? {
                Some(len) => {
                    for _ in 0..len {
                        let k = item(dec, depth + 1)?;
                        let v = item(dec, depth + 1)?;
                        entries.push((k, v));
                    }
                }
                None => {
                    while dec.datatype()? != Type::Break {
                        let k = item(dec, depth + 1)?;
                        let v = item(dec, depth + 1)?;
                        entries.push((k, v));
                    }
                    skip_break(dec);
                }
            }
            Value::Map(entries)
        }
        Type::Tag => {
            let tag = dec.tag()?.as_u64();
            Value::Tag(tag, Box::new(item(dec, depth + 1)?))
        }
        Type::Bool => Value::Bool(dec.bool()?),
        Type::Null => {
            dec.null()?;
            Value::Null
        }
        Type::Undefined => {
            dec.undefined()?;
            Value::Undefined
        }
        Type::F16 => Value::Float(f64::from(dec.f16()?)),
        Type::F32 => Value::Float(f64::from(dec.f32()?)),
        Type::F64 => Value::Float(dec.f64()?),
        Type::Simple => Value::Simple(dec.simple()?),
        Type::Break | Type::Unknown(_) => {
            let initial = dec.input().get(start).copied().unwrap_or_default();
            return Err(CborError::Unsupported(initial));
        }
    };

    Ok(Item {
        value,
        span: start..dec.position(),
    })
}

/// Step over the `0xff` that closes an indefinite container.
fn skip_break(dec: &mut Decoder<'_>) {
    dec.set_position(dec.position() + 1);
}

fn render(item: &Item<'_>, out: &mut String) {
    match &item.value {
        Value::Unsigned(n) => out.push_str(&n.to_string()),
        Value::Negative(n) => out.push_str(&(-1i128 - i128::from(*n)).to_string()),
        Value::Bytes(b) => {
            out.push_str("h'");
            out.push_str(&hex::encode(b));
            out.push('\'');
        }
        Value::Text(s) => out.push_str(&serde_json::Value::from(s.as_ref()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, it) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render(it, out);
            }
            out.push(']');
        }
        Value::Map(entries) => {
            out.push('{');
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render(k, out);
                out.push_str(": ");
                render(v, out);
            }
            out.push('}');
        }
        Value::Tag(tag, inner) => {
            out.push_str(&tag.to_string());
            out.push('(');
            render(inner, out);
            out.push(')');
        }
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
        Value::Undefined => out.push_str("undefined"),
        Value::Float(f) => out.push_str(&format!("{f:?}")),
        Value::Simple(n) => out.push_str(&format!("simple({n})")),
    }
}
