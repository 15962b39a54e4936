//! Type registry: wire type identifiers and type names to encode/decode functions.
//!
//! The registry is built once (usually [`TypeRegistry::default`], plus any
//! custom registrations) and shared by reference with every connection. There
//! is no global registry.
//!
//! Parameters travel in text format, so encoders produce text and decoders
//! read the text representation of a column.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};

use crate::error::{Error, Result};
use crate::value::{hex_decode, hex_encode, Param, Value};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub u32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const NUMERIC: Oid = Oid(1700);
    pub const JSONB: Oid = Oid(3802);
}

/// Turns a value into its text wire representation.
pub type EncodeFn = fn(&Value) -> Result<String>;
/// Turns the text representation of a column into a value.
pub type DecodeFn = fn(&[u8]) -> Result<Value>;

/// One registered type.
#[derive(Clone, Debug)]
pub struct TypeDef {
    /// Alias names, matched case-insensitively.
    pub names: Vec<String>,
    /// Wire identifiers handled by this type (socket protocol).
    pub oids: Vec<Oid>,
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

impl TypeDef {
    pub fn new(names: &[&str], oids: &[Oid], encode: EncodeFn, decode: DecodeFn) -> Self {
        Self {
            names: names.iter().map(|n| n.to_ascii_lowercase()).collect(),
            oids: oids.to_vec(),
            encode,
            decode,
        }
    }
}

/// Registry of encoders and decoders.
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    defs: Vec<TypeDef>,
    by_name: HashMap<String, usize>,
    by_oid: HashMap<Oid, usize>,
}

/// Column-name to type-name overrides attached to one query.
pub type ColumnTypes = Arc<HashMap<String, String>>;

impl TypeRegistry {
    /// An empty registry: every column decodes as text.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in scalar types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(TypeDef::new(
            &["int", "int2", "int4", "int8", "smallint", "integer", "bigint", "oid"],
            &[Oid::INT2, Oid::INT4, Oid::INT8, Oid::OID],
            encode_int,
            decode_int,
        ));
        registry.register(TypeDef::new(
            &["float4", "float8", "real", "double", "double precision"],
            &[Oid::FLOAT4, Oid::FLOAT8],
            encode_float,
            decode_float,
        ));
        registry.register(TypeDef::new(
            &["numeric", "decimal"],
            &[Oid::NUMERIC],
            encode_numeric,
            decode_numeric,
        ));
        registry.register(TypeDef::new(
            &["bool", "boolean"],
            &[Oid::BOOL],
            encode_bool,
            decode_bool,
        ));
        registry.register(TypeDef::new(
            &["json", "jsonb"],
            &[Oid::JSON, Oid::JSONB],
            encode_json,
            decode_json,
        ));
        registry.register(TypeDef::new(
            &["bytea", "blob", "binary"],
            &[Oid::BYTEA],
            encode_bytea,
            decode_bytea,
        ));
        registry.register(TypeDef::new(
            &["timestamp", "datetime"],
            &[Oid::TIMESTAMP],
            encode_timestamp,
            decode_timestamp,
        ));
        registry.register(TypeDef::new(
            &["timestamptz"],
            &[Oid::TIMESTAMPTZ],
            encode_timestamp,
            decode_timestamptz,
        ));
        registry.register(TypeDef::new(
            &["text", "varchar", "char", "bpchar", "name", "string"],
            &[Oid::TEXT, Oid::VARCHAR, Oid::BPCHAR, Oid::CHAR, Oid::NAME],
            encode_text,
            decode_text,
        ));
        registry
    }

    /// Register a type. Later registrations win for shared names and oids.
    pub fn register(&mut self, def: TypeDef) {
        let index = self.defs.len();
        for name in &def.names {
            self.by_name.insert(name.clone(), index);
        }
        for oid in &def.oids {
            self.by_oid.insert(*oid, index);
        }
        self.defs.push(def);
    }

    pub fn by_name(&self, name: &str) -> Option<&TypeDef> {
        let index = self
            .by_name
            .get(name)
            .or_else(|| self.by_name.get(&name.to_ascii_lowercase()))?;
        Some(&self.defs[*index])
    }

    pub fn by_oid(&self, oid: Oid) -> Option<&TypeDef> {
        self.by_oid.get(&oid).map(|i| &self.defs[*i])
    }

    /// Decoder for a result column.
    ///
    /// Lookup order: the caller's per-query override for this column name,
    /// then the wire type identifier. `None` means "pass through as text".
    pub fn decoder(
        &self,
        column: &str,
        oid: Option<Oid>,
        overrides: Option<&HashMap<String, String>>,
    ) -> Option<DecodeFn> {
        if let Some(name) = overrides.and_then(|o| o.get(column)) {
            if let Some(def) = self.by_name(name) {
                return Some(def.decode);
            }
        }
        oid.and_then(|oid| self.by_oid(oid)).map(|def| def.decode)
    }

    /// Text wire representation of a parameter, `None` for NULL.
    pub fn encode_param(&self, param: &Param) -> Result<Option<String>> {
        match param {
            Param::Plain(Value::Null) | Param::Typed(_, Value::Null) => Ok(None),
            Param::Plain(value) => encode_inferred(value).map(Some),
            Param::Typed(name, value) => {
                let def = self
                    .by_name(name)
                    .ok_or_else(|| Error::Type(format!("Unknown parameter type: {}", name)))?;
                (def.encode)(value).map(Some)
            }
        }
    }
}

/// Decode one column, falling back to UTF-8 text.
pub fn decode_column(decoder: Option<DecodeFn>, raw: &[u8]) -> Result<Value> {
    match decoder {
        Some(decode) => decode(raw),
        None => decode_text(raw),
    }
}

/// Encoder chosen by the value's own shape.
fn encode_inferred(value: &Value) -> Result<String> {
    match value {
        Value::Null => Err(Error::Type("NULL has no text representation".to_string())),
        Value::Bool(_) => encode_bool(value),
        Value::Int(_) => encode_int(value),
        Value::Float(_) => encode_float(value),
        Value::Numeric(s) | Value::Text(s) => Ok(s.clone()),
        Value::Bytes(_) => encode_bytea(value),
        Value::Json(_) => encode_json(value),
        Value::Timestamp(_) | Value::TimestampTz(_) => encode_timestamp(value),
    }
}

// ============================================================================
// Built-in codecs
// ============================================================================

fn mismatch(expected: &str, value: &Value) -> Error {
    Error::Type(format!("Cannot encode {:?} as {}", value, expected))
}

fn utf8(raw: &[u8]) -> Result<&str> {
    std::str::from_utf8(raw).map_err(|e| Error::Type(format!("Invalid UTF-8: {}", e)))
}

fn encode_int(value: &Value) -> Result<String> {
    match value {
        Value::Int(i) => Ok(i.to_string()),
        Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
        Value::Numeric(s) | Value::Text(s) if s.parse::<i64>().is_ok() => Ok(s.clone()),
        _ => Err(mismatch("integer", value)),
    }
}

fn decode_int(raw: &[u8]) -> Result<Value> {
    let text = utf8(raw)?;
    text.parse::<i64>()
        .map(Value::Int)
        .map_err(|e| Error::Type(format!("Invalid integer {:?}: {}", text, e)))
}

fn encode_float(value: &Value) -> Result<String> {
    match value {
        Value::Float(f) if f.is_nan() => Ok("NaN".to_string()),
        Value::Float(f) if f.is_infinite() => {
            Ok(if *f > 0.0 { "Infinity" } else { "-Infinity" }.to_string())
        }
        Value::Float(f) => Ok(f.to_string()),
        Value::Int(i) => Ok(i.to_string()),
        _ => Err(mismatch("float", value)),
    }
}

fn decode_float(raw: &[u8]) -> Result<Value> {
    let text = utf8(raw)?;
    let parsed = match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => text.parse::<f64>(),
    };
    parsed
        .map(Value::Float)
        .map_err(|e| Error::Type(format!("Invalid float {:?}: {}", text, e)))
}

fn encode_numeric(value: &Value) -> Result<String> {
    match value {
        Value::Numeric(s) | Value::Text(s) => Ok(s.clone()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        _ => Err(mismatch("numeric", value)),
    }
}

fn decode_numeric(raw: &[u8]) -> Result<Value> {
    Ok(Value::Numeric(utf8(raw)?.to_string()))
}

fn encode_bool(value: &Value) -> Result<String> {
    match value {
        Value::Bool(b) => Ok(if *b { "t" } else { "f" }.to_string()),
        Value::Int(i) => Ok(if *i != 0 { "t" } else { "f" }.to_string()),
        _ => Err(mismatch("boolean", value)),
    }
}

fn decode_bool(raw: &[u8]) -> Result<Value> {
    match raw {
        b"t" | b"true" | b"1" => Ok(Value::Bool(true)),
        b"f" | b"false" | b"0" => Ok(Value::Bool(false)),
        _ => Err(Error::Type(format!(
            "Invalid boolean {:?}",
            String::from_utf8_lossy(raw)
        ))),
    }
}

fn encode_json(value: &Value) -> Result<String> {
    match value {
        Value::Json(j) => {
            serde_json::to_string(j).map_err(|e| Error::Type(format!("Invalid JSON: {}", e)))
        }
        // Text is assumed to already be serialized JSON
        Value::Text(s) => Ok(s.clone()),
        other => Ok(other.to_json().to_string()),
    }
}

fn decode_json(raw: &[u8]) -> Result<Value> {
    serde_json::from_slice(raw)
        .map(Value::Json)
        .map_err(|e| Error::Type(format!("Invalid JSON: {}", e)))
}

fn encode_bytea(value: &Value) -> Result<String> {
    match value {
        Value::Bytes(b) => Ok(format!("\\x{}", hex_encode(b))),
        Value::Text(s) => Ok(format!("\\x{}", hex_encode(s.as_bytes()))),
        _ => Err(mismatch("bytea", value)),
    }
}

fn decode_bytea(raw: &[u8]) -> Result<Value> {
    let hex = raw
        .strip_prefix(b"\\x")
        .ok_or_else(|| Error::Type("bytea value is not in hex format".to_string()))?;
    hex_decode(hex)
        .map(Value::Bytes)
        .ok_or_else(|| Error::Type("Invalid hex digits in bytea value".to_string()))
}

fn encode_timestamp(value: &Value) -> Result<String> {
    match value {
        Value::Timestamp(ts) => Ok(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        Value::TimestampTz(ts) => Ok(ts.to_rfc3339()),
        Value::Text(s) => Ok(s.clone()),
        _ => Err(mismatch("timestamp", value)),
    }
}

fn decode_timestamp(raw: &[u8]) -> Result<Value> {
    let text = utf8(raw)?;
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .map(Value::Timestamp)
        .map_err(|e| Error::Type(format!("Invalid timestamp {:?}: {}", text, e)))
}

fn decode_timestamptz(raw: &[u8]) -> Result<Value> {
    let text = utf8(raw)?;
    // Server output looks like "2024-05-01 12:30:00.123+02" (minutes optional)
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .map(Value::TimestampTz)
        .map_err(|e| Error::Type(format!("Invalid timestamptz {:?}: {}", text, e)))
}

fn encode_text(value: &Value) -> Result<String> {
    match value {
        Value::Text(s) | Value::Numeric(s) => Ok(s.clone()),
        other => encode_inferred(other),
    }
}

fn decode_text(raw: &[u8]) -> Result<Value> {
    Ok(Value::Text(String::from_utf8_lossy(raw).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_decoder_lookup_order() {
        let registry = TypeRegistry::with_builtins();
        let mut overrides = HashMap::new();
        overrides.insert("payload".to_string(), "json".to_string());

        // Override by column name beats the wire type
        let decode = registry.decoder("payload", Some(Oid::TEXT), Some(&overrides));
        assert_eq!(
            decode_column(decode, br#"{"a":1}"#).unwrap(),
            Value::Json(serde_json::json!({"a": 1}))
        );

        // Wire type when no override matches
        let decode = registry.decoder("id", Some(Oid::INT8), Some(&overrides));
        assert_eq!(decode_column(decode, b"42").unwrap(), Value::Int(42));

        // Unknown wire type falls back to text
        let decode = registry.decoder("point", Some(Oid(600)), None);
        assert!(decode.is_none());
        assert_eq!(
            decode_column(decode, b"(1,2)").unwrap(),
            Value::Text("(1,2)".to_string())
        );
    }

    #[test]
    fn test_numeric_stays_text() {
        let registry = TypeRegistry::with_builtins();
        let decode = registry.decoder("n", Some(Oid::NUMERIC), None);
        assert_eq!(
            decode_column(decode, b"12345678901234567890.123456789").unwrap(),
            Value::Numeric("12345678901234567890.123456789".to_string())
        );
    }

    #[test]
    fn test_bool_text_and_literal() {
        assert_eq!(decode_bool(b"t").unwrap(), Value::Bool(true));
        assert_eq!(decode_bool(b"0").unwrap(), Value::Bool(false));
        assert!(decode_bool(b"maybe").is_err());
    }

    #[test]
    fn test_bytea_hex() {
        assert_eq!(
            decode_bytea(b"\\x48656c6c6f").unwrap(),
            Value::Bytes(b"Hello".to_vec())
        );
        assert!(decode_bytea(b"Hello").is_err());
    }

    #[test]
    fn test_timestamps() {
        let ts = decode_timestamp(b"2024-05-01 12:30:00.5").unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_milli_opt(12, 30, 0, 500)
            .unwrap();
        assert_eq!(ts, Value::Timestamp(expected));

        let tz = decode_timestamptz(b"2024-05-01 12:30:00+02").unwrap();
        match tz {
            Value::TimestampTz(dt) => assert_eq!(dt.offset().local_minus_utc(), 7200),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encode_inferred_params() {
        let registry = TypeRegistry::with_builtins();
        let enc = |p: Param| registry.encode_param(&p).unwrap();

        assert_eq!(enc(5.into()), Some("5".to_string()));
        assert_eq!(enc(true.into()), Some("t".to_string()));
        assert_eq!(enc(Value::Null.into()), None);
        assert_eq!(enc(vec![0xab, 0x01].into()), Some("\\xab01".to_string()));
        assert_eq!(
            enc(serde_json::json!({"k": [1, 2]}).into()),
            Some(r#"{"k":[1,2]}"#.to_string())
        );
    }

    #[test]
    fn test_encode_typed_params() {
        let registry = TypeRegistry::with_builtins();

        // A plain string sent as bytea only because it is tagged
        let p = Param::typed("bytea", "Hi");
        assert_eq!(registry.encode_param(&p).unwrap(), Some("\\x4869".to_string()));

        let p = Param::typed("no_such_type", 1);
        assert!(matches!(registry.encode_param(&p), Err(Error::Type(_))));
    }

    #[test]
    fn test_custom_registration_overrides_builtin() {
        fn upper(raw: &[u8]) -> Result<Value> {
            Ok(Value::Text(String::from_utf8_lossy(raw).to_uppercase()))
        }

        let mut registry = TypeRegistry::with_builtins();
        registry.register(TypeDef::new(&["Shout"], &[Oid::VARCHAR], encode_text, upper));

        let decode = registry.decoder("c", Some(Oid::VARCHAR), None);
        assert_eq!(decode_column(decode, b"hey").unwrap(), Value::Text("HEY".into()));
        assert!(registry.by_name("shout").is_some());
        assert!(registry.by_name("SHOUT").is_some());
    }
}
