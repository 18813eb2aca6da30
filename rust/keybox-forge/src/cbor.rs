//! Canonical CBOR encoder (RFC 8949 Section 4.2.1).
//!
//! Covers the restricted value model used by DeviceInfo, COSE and RKP
//! structures: integers, byte and text strings, arrays, maps with a
//! deterministic key order, booleans and null. Floats, tags and
//! indefinite-length items have no [`Value`] variant and cannot be encoded.

use std::cmp::Ordering;

// CBOR Major Types
const MT_UNSIGNED: u8 = 0;
const MT_NEGATIVE: u8 = 1;
const MT_BYTE_STRING: u8 = 2;
const MT_TEXT_STRING: u8 = 3;
const MT_ARRAY: u8 = 4;
const MT_MAP: u8 = 5;
const MT_SIMPLE: u8 = 7;

const SIMPLE_FALSE: u64 = 20;
const SIMPLE_TRUE: u64 = 21;
const SIMPLE_NULL: u64 = 22;

/// A CBOR value that can be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    /// Signed integer; the sign selects major type 0 or 1.
    Integer(i64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Entries are kept in insertion order and sorted canonically on encode.
    Map(Vec<(Value, Value)>),
    Bool(bool),
}

impl Value {
    /// Shorthand for a text value.
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Shorthand for a byte string value.
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(b.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// Encode a value to canonical CBOR bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    encode_into(&mut buf, value);
    buf
}

/// Append the canonical encoding of `value` to `buf`.
pub fn encode_into(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => encode_type_and_length(buf, MT_SIMPLE, SIMPLE_NULL),
        Value::Bool(b) => {
            encode_type_and_length(buf, MT_SIMPLE, if *b { SIMPLE_TRUE } else { SIMPLE_FALSE })
        }
        Value::Integer(v) if *v >= 0 => encode_type_and_length(buf, MT_UNSIGNED, *v as u64),
        // -1 - n never overflows for negative n and always fits in u64.
        Value::Integer(v) => encode_type_and_length(buf, MT_NEGATIVE, (-1 - *v) as u64),
        Value::Bytes(bytes) => {
            encode_type_and_length(buf, MT_BYTE_STRING, bytes.len() as u64);
            buf.extend_from_slice(bytes);
        }
        Value::Text(s) => {
            encode_type_and_length(buf, MT_TEXT_STRING, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            encode_type_and_length(buf, MT_ARRAY, items.len() as u64);
            for item in items {
                encode_into(buf, item);
            }
        }
        Value::Map(entries) => {
            encode_type_and_length(buf, MT_MAP, entries.len() as u64);

            let mut sorted: Vec<&(Value, Value)> = entries.iter().collect();
            sorted.sort_by(|a, b| canonical_key_cmp(&a.0, &b.0));

            for (key, val) in sorted {
                encode_into(buf, key);
                encode_into(buf, val);
            }
        }
    }
}

/// Write a major type and argument using the shortest form.
fn encode_type_and_length(buf: &mut Vec<u8>, major_type: u8, value: u64) {
    let mt = major_type << 5;
    if value < 24 {
        buf.push(mt | value as u8);
    } else if value <= 0xFF {
        buf.extend_from_slice(&[mt | 24, value as u8]);
    } else if value <= 0xFFFF {
        buf.push(mt | 25);
        buf.extend_from_slice(&(value as u16).to_be_bytes());
    } else if value <= 0xFFFF_FFFF {
        buf.push(mt | 26);
        buf.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&value.to_be_bytes());
    }
}

/// Compare CBOR map keys in canonical order.
///
/// - Integer keys: non-negative before negative; non-negative ascending,
///   negative by stored magnitude (-1 before -2).
/// - Text keys: shorter UTF-8 length first, then bytewise.
/// - Any integer key sorts before any text key.
fn canonical_key_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Integer(a_val), Value::Integer(b_val)) => match (*a_val >= 0, *b_val >= 0) {
            (true, true) => a_val.cmp(b_val),
            (false, false) => b_val.cmp(a_val),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
        },
        (Value::Text(a_str), Value::Text(b_str)) => {
            let (a_bytes, b_bytes) = (a_str.as_bytes(), b_str.as_bytes());
            a_bytes
                .len()
                .cmp(&b_bytes.len())
                .then_with(|| a_bytes.cmp(b_bytes))
        }
        (Value::Integer(_), Value::Text(_)) => Ordering::Less,
        (Value::Text(_), Value::Integer(_)) => Ordering::Greater,
        // Not produced by this crate; length-first bytewise order of the encodings.
        _ => {
            let (a_enc, b_enc) = (encode(a), encode(b));
            a_enc.len().cmp(&b_enc.len()).then_with(|| a_enc.cmp(&b_enc))
        }
    }
}
