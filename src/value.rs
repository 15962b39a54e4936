//! Values moving in and out of the database.
//!
//! - [`Value`]: one decoded column or one parameter value
//! - [`Param`]: a bound parameter, optionally tagged with an explicit type name
//! - [`Row`]: a flat mapping of column name to value
//! - [`Rows`]: the row list returned by `select`

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use smallvec::SmallVec;

// Re-export serde_json::Value for JSON support
pub use serde_json::Value as JsonValue;

/// A database value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision numeric, kept as text to avoid precision loss.
    Numeric(String),
    Text(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Numeric(s) | Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Numeric(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Numeric(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            Value::Json(j) => Some(j),
            _ => None,
        }
    }

    /// JSON rendering, used when rows are forwarded as an [`Outcome`](crate::Outcome).
    ///
    /// Bytes become a `\x`-prefixed hex string, timestamps ISO-8601 text.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => JsonValue::from(*f),
            Value::Numeric(s) | Value::Text(s) => JsonValue::String(s.clone()),
            Value::Bytes(b) => JsonValue::String(format!("\\x{}", hex_encode(b))),
            Value::Json(j) => j.clone(),
            Value::Timestamp(ts) => JsonValue::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Value::TimestampTz(ts) => JsonValue::String(ts.to_rfc3339()),
        }
    }
}

macro_rules! value_from {
    ($($t:ty => |$v:ident| $e:expr),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from($v: $t) -> Self {
                    $e
                }
            }

            impl From<$t> for Param {
                fn from($v: $t) -> Self {
                    Param::Plain($e)
                }
            }
        )*
    };
}

value_from! {
    bool => |v| Value::Bool(v),
    i16 => |v| Value::Int(v as i64),
    i32 => |v| Value::Int(v as i64),
    i64 => |v| Value::Int(v),
    u32 => |v| Value::Int(v as i64),
    f32 => |v| Value::Float(v as f64),
    f64 => |v| Value::Float(v),
    String => |v| Value::Text(v),
    &str => |v| Value::Text(v.to_string()),
    &String => |v| Value::Text(v.clone()),
    Vec<u8> => |v| Value::Bytes(v),
    &[u8] => |v| Value::Bytes(v.to_vec()),
    JsonValue => |v| Value::Json(v),
    NaiveDateTime => |v| Value::Timestamp(v),
    DateTime<FixedOffset> => |v| Value::TimestampTz(v),
    DateTime<Utc> => |v| Value::TimestampTz(v.fixed_offset()),
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// A bound parameter.
///
/// `Typed` selects the encoder explicitly by registered type name instead of
/// inferring it from the value's shape, e.g. to send a string as `bytea` or a
/// custom domain format.
#[derive(Clone, Debug, PartialEq)]
pub enum Param {
    Plain(Value),
    Typed(String, Value),
}

impl Param {
    pub fn typed(type_name: impl Into<String>, value: impl Into<Value>) -> Self {
        Param::Typed(type_name.into(), value.into())
    }

    pub fn value(&self) -> &Value {
        match self {
            Param::Plain(v) | Param::Typed(_, v) => v,
        }
    }
}

impl From<Value> for Param {
    fn from(v: Value) -> Self {
        Param::Plain(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        Param::Plain(v.into())
    }
}

/// Build a `Vec<Param>` from heterogeneous values.
///
/// ```
/// let params = dbkit::params![5, "five", None::<i32>];
/// assert_eq!(params.len(), 3);
/// ```
#[macro_export]
macro_rules! params {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::Param::from($value)),*]
    };
}

// ============================================================================
// Rows
// ============================================================================

/// Column names shared by every row of one result.
pub type SharedNames = Arc<[String]>;

/// One result row.
///
/// Uses SmallVec to inline storage for rows with ≤16 columns, avoiding a
/// second heap allocation for typical tables.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    columns: SharedNames,
    values: SmallVec<[Value; 16]>,
}

impl Row {
    pub(crate) fn new(columns: SharedNames, values: SmallVec<[Value; 16]>) -> Self {
        Self { columns, values }
    }

    /// Value of the named column. When a name repeats, the last one wins,
    /// mirroring how the row would look as a map.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .rposition(|c| c == column)
            .map(|i| &self.values[i])
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Remove and return the named column's value, leaving `Null` behind.
    pub fn take(&mut self, column: &str) -> Option<Value> {
        let i = self.columns.iter().rposition(|c| c == column)?;
        Some(std::mem::replace(&mut self.values[i], Value::Null))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// The row as a JSON object.
    pub fn to_json(&self) -> JsonValue {
        let map = self
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        JsonValue::Object(map)
    }
}

/// Rows returned by `select`, with the row count reported by the server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rows {
    rows: Vec<Row>,
    count: u64,
}

impl Rows {
    pub(crate) fn new(rows: Vec<Row>, count: u64) -> Self {
        Self { rows, count }
    }

    /// Row count from the command tag (equals `len()` unless rows were capped).
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_vec(self) -> Vec<Row> {
        self.rows
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Array(self.rows.iter().map(Row::to_json).collect())
    }
}

impl std::ops::Deref for Rows {
    type Target = [Row];

    fn deref(&self) -> &[Row] {
        &self.rows
    }
}

impl IntoIterator for Rows {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

// ============================================================================
// Hex helpers
// ============================================================================

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX_CHARS[(b >> 4) as usize] as char);
        out.push(HEX_CHARS[(b & 0x0f) as usize] as char);
    }
    out
}

pub(crate) fn hex_decode(text: &[u8]) -> Option<Vec<u8>> {
    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }

    if text.len() % 2 != 0 {
        return None;
    }
    text.chunks_exact(2)
        .map(|pair| Some(nibble(pair[0])? << 4 | nibble(pair[1])?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(names: &[&str], values: Vec<Value>) -> Row {
        let names: SharedNames = names.iter().map(|s| s.to_string()).collect();
        Row::new(names, values.into_iter().collect())
    }

    #[test]
    fn test_row_lookup_last_duplicate_wins() {
        let r = row(&["id", "name", "id"], vec![1.into(), "a".into(), 2.into()]);
        assert_eq!(r.get("id"), Some(&Value::Int(2)));
        assert_eq!(r.get("name").and_then(Value::as_str), Some("a"));
        assert_eq!(r.get("missing"), None);
        assert_eq!(r.get_index(0), Some(&Value::Int(1)));
    }

    #[test]
    fn test_row_to_json() {
        let r = row(
            &["id", "blob", "meta"],
            vec![7.into(), vec![0xde, 0xad].into(), serde_json::json!({"a": 1}).into()],
        );
        assert_eq!(
            r.to_json(),
            serde_json::json!({"id": 7, "blob": "\\xdead", "meta": {"a": 1}})
        );
    }

    #[test]
    fn test_option_into_value() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x10]), "00ff10");
        assert_eq!(hex_decode(b"00FF10"), Some(vec![0x00, 0xff, 0x10]));
        assert_eq!(hex_decode(b"abc"), None);
        assert_eq!(hex_decode(b"zz"), None);
    }

    #[test]
    fn test_params_macro() {
        let params = crate::params![1, "two", Param::typed("bytea", "x")];
        assert_eq!(params[0], Param::Plain(Value::Int(1)));
        assert_eq!(params[2], Param::Typed("bytea".into(), Value::Text("x".into())));
    }
}
