//! CouchDB collation order for JSON values.
//!
//! Views and the `_all_docs` machinery sort rows by emitted key under
//! CouchDB's rules: `null < false < true < numbers < strings < arrays <
//! objects`. Numbers compare numerically regardless of representation,
//! strings compare under a Unicode-ish three-level order, arrays compare
//! element-wise and objects compare their key/value pairs in insertion
//! order. A view may opt into `ascii` collation, which orders strings
//! byte-wise instead.
//!
//! Keys are persisted as canonical JSON text; [`collate_raw`] compares that
//! stored form and is what gets registered with SQLite as a named collation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod strings;

use std::cmp::Ordering;

use serde_json::Value;

pub use strings::unicode_cmp;

/// String ordering mode for a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Collation {
    /// CouchDB's default Unicode order.
    #[default]
    Unicode,
    /// Byte-wise string order (`options.collation = "ascii"`).
    Ascii,
}

impl Collation {
    /// Parses the design-document `options.collation` value.
    ///
    /// Returns `None` for unrecognized values; absence means [`Collation::Unicode`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" | "ascii" => Some(Self::Ascii),
            "unicode" => Some(Self::Unicode),
            _ => None,
        }
    }

    /// The name under which this collation is registered with SQLite.
    #[must_use]
    pub const fn sqlite_name(self) -> &'static str {
        match self {
            Self::Unicode => "couchdb_json",
            Self::Ascii => "couchdb_ascii",
        }
    }
}

/// Rank of a value's type in the collation order.
const fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Compares two JSON values under CouchDB collation.
#[must_use]
pub fn collate(a: &Value, b: &Value, collation: Collation) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => cmp_number(x, y),
        (Value::String(x), Value::String(y)) => match collation {
            Collation::Unicode => unicode_cmp(x, y),
            Collation::Ascii => x.as_bytes().cmp(y.as_bytes()),
        },
        (Value::Array(x), Value::Array(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                let ord = collate(xv, yv, collation);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            // Shorter prefix loses the tie.
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let key_ord = match collation {
                    Collation::Unicode => unicode_cmp(xk, yk),
                    Collation::Ascii => xk.as_bytes().cmp(yk.as_bytes()),
                };
                if key_ord != Ordering::Equal {
                    return key_ord;
                }
                let val_ord = collate(xv, yv, collation);
                if val_ord != Ordering::Equal {
                    return val_ord;
                }
            }
            x.len().cmp(&y.len())
        }
        // Unreachable: ranks were equal.
        _ => Ordering::Equal,
    }
}

/// Compares serde_json numbers by numeric value: `3` equals `3.0`.
fn cmp_number(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    if let (Some(x), Some(y)) = (as_i128(a), as_i128(b)) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

fn as_i128(n: &serde_json::Number) -> Option<i128> {
    if let Some(i) = n.as_i64() {
        return Some(i128::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Some(i128::from(u));
    }
    // Integral floats still compare as integers against true integers.
    let f = n.as_f64()?;
    if f.fract() == 0.0 && f.abs() < 9e15 {
        #[allow(clippy::cast_possible_truncation)]
        return Some(f as i128);
    }
    None
}

/// Compares two canonical-JSON-encoded keys.
///
/// This is the comparator attached to the map table's `key` column. Input
/// that fails to parse (which a well-formed index never contains) falls back
/// to byte order so the comparator stays total.
#[must_use]
pub fn collate_raw(a: &str, b: &str, collation: Collation) -> Ordering {
    match (
        serde_json::from_str::<Value>(a),
        serde_json::from_str::<Value>(b),
    ) {
        (Ok(x), Ok(y)) => collate(&x, &y, collation),
        _ => a.as_bytes().cmp(b.as_bytes()),
    }
}

/// Serializes a key to its canonical stored form.
///
/// Object member order is preserved, since collation of objects depends on
/// insertion order.
#[must_use]
pub fn canonical_text(v: &Value) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "null".into())
}
