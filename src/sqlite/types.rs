//! Conversions between dbkit values and SQLite storage classes, plus scalar
//! function definitions.

use std::sync::Arc;

use rusqlite::types::{Value as SqlValue, ValueRef};

use crate::error::{Error, Result};
use crate::types::{DecodeFn, TypeRegistry};
use crate::value::{Param, Value};

/// Body of a scalar SQL function.
pub type ScalarFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// A scalar function installed on every embedded connection.
#[derive(Clone)]
pub struct ScalarFunction {
    pub name: String,
    /// Argument count, `-1` for variadic.
    pub args: i32,
    /// Same inputs always give the same output, so the planner may cache it.
    pub deterministic: bool,
    pub func: ScalarFn,
}

impl std::fmt::Debug for ScalarFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalarFunction")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("deterministic", &self.deterministic)
            .finish()
    }
}

impl ScalarFunction {
    pub fn new(
        name: impl Into<String>,
        args: i32,
        func: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            args,
            deterministic: true,
            func: Arc::new(func),
        }
    }

    pub fn volatile(mut self) -> Self {
        self.deterministic = false;
        self
    }
}

/// Storage value for one bound parameter.
///
/// Plain values map onto their natural storage class. Typed parameters go
/// through the registry's text encoder, except binary types which stay blobs.
pub(crate) fn to_sql(param: &Param, registry: &TypeRegistry) -> Result<SqlValue> {
    match param {
        Param::Plain(value) => Ok(natural(value)),
        Param::Typed(_, Value::Null) => Ok(SqlValue::Null),
        Param::Typed(_, Value::Bytes(b)) => Ok(SqlValue::Blob(b.clone())),
        Param::Typed(..) => Ok(registry
            .encode_param(param)?
            .map_or(SqlValue::Null, SqlValue::Text)),
    }
}

fn natural(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Numeric(s) | Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::Json(j) => SqlValue::Text(j.to_string()),
        Value::Timestamp(ts) => SqlValue::Text(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        Value::TimestampTz(ts) => SqlValue::Text(ts.to_rfc3339()),
    }
}

/// How a result column is decoded.
#[derive(Clone, Copy)]
pub(crate) enum ColumnDecoder {
    Natural,
    /// Requested per query: a failure is an error.
    Override(DecodeFn),
    /// From the declared column type: a failure keeps the stored value.
    Declared(DecodeFn),
}

impl ColumnDecoder {
    pub fn resolve(
        registry: &TypeRegistry,
        override_type: Option<&str>,
        declared: Option<&str>,
    ) -> Self {
        if let Some(def) = override_type.and_then(|name| registry.by_name(name)) {
            return ColumnDecoder::Override(def.decode);
        }
        declared
            .map(declared_type_name)
            .and_then(|name| registry.by_name(&name))
            .map_or(ColumnDecoder::Natural, |def| ColumnDecoder::Declared(def.decode))
    }

    pub fn decode(self, value: ValueRef<'_>) -> Result<Value> {
        let (decode, strict) = match self {
            ColumnDecoder::Natural => return Ok(from_sql(value)),
            ColumnDecoder::Override(decode) => (decode, true),
            ColumnDecoder::Declared(decode) => (decode, false),
        };
        let text = match value {
            ValueRef::Null => return Ok(Value::Null),
            ValueRef::Blob(b) => return Ok(Value::Bytes(b.to_vec())),
            ValueRef::Integer(i) => i.to_string().into_bytes(),
            ValueRef::Real(f) => f.to_string().into_bytes(),
            ValueRef::Text(t) => t.to_vec(),
        };
        match decode(&text) {
            Ok(decoded) => Ok(decoded),
            Err(e) if strict => Err(e),
            Err(_) => Ok(from_sql(value)),
        }
    }
}

/// The stored value as-is.
pub(crate) fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(s) => Value::Text(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

/// `VARCHAR(20)` becomes `varchar`, `UNSIGNED BIG INT` stays as written.
pub(crate) fn declared_type_name(declared: &str) -> String {
    let base = declared.split('(').next().unwrap_or(declared);
    base.trim().to_ascii_lowercase()
}

/// Result of a scalar function as an SQLite value.
pub(crate) fn function_result(value: Value) -> SqlValue {
    natural(&value)
}

pub(crate) fn function_error(e: Error) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_params_keep_storage_class() {
        let registry = TypeRegistry::with_builtins();
        assert_eq!(to_sql(&Param::from(true), &registry).unwrap(), SqlValue::Integer(1));
        assert_eq!(to_sql(&Param::from(1.5), &registry).unwrap(), SqlValue::Real(1.5));
        assert_eq!(
            to_sql(&Param::from(vec![1u8, 2]), &registry).unwrap(),
            SqlValue::Blob(vec![1, 2])
        );
        assert_eq!(
            to_sql(&Param::from(None::<i64>), &registry).unwrap(),
            SqlValue::Null
        );
    }

    #[test]
    fn test_typed_params_use_registry() {
        let registry = TypeRegistry::with_builtins();
        let param = Param::typed("json", Value::Json(serde_json::json!({"a": 1})));
        assert_eq!(
            to_sql(&param, &registry).unwrap(),
            SqlValue::Text("{\"a\":1}".to_string())
        );
        assert!(matches!(
            to_sql(&Param::typed("nope", 1), &registry),
            Err(Error::Type(_))
        ));
    }

    #[test]
    fn test_declared_type_decoding() {
        let registry = TypeRegistry::with_builtins();

        let decoder = ColumnDecoder::resolve(&registry, None, Some("BOOLEAN"));
        assert_eq!(decoder.decode(ValueRef::Integer(1)).unwrap(), Value::Bool(true));

        let decoder = ColumnDecoder::resolve(&registry, None, Some("JSON"));
        assert_eq!(
            decoder.decode(ValueRef::Text(b"[1,2]")).unwrap(),
            Value::Json(serde_json::json!([1, 2]))
        );
        // Not JSON after all: keep the text
        assert_eq!(
            decoder.decode(ValueRef::Text(b"plain")).unwrap(),
            Value::Text("plain".to_string())
        );

        let decoder = ColumnDecoder::resolve(&registry, None, Some("VARCHAR(20)"));
        assert!(matches!(decoder, ColumnDecoder::Declared(_)));
        let decoder = ColumnDecoder::resolve(&registry, None, Some("GEOMETRY"));
        assert!(matches!(decoder, ColumnDecoder::Natural));
    }

    #[test]
    fn test_override_is_strict() {
        let registry = TypeRegistry::with_builtins();
        let decoder = ColumnDecoder::resolve(&registry, Some("json"), Some("TEXT"));
        assert!(decoder.decode(ValueRef::Text(b"plain")).is_err());
        assert_eq!(decoder.decode(ValueRef::Null).unwrap(), Value::Null);
    }
}
