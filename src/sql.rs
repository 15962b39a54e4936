//! Query values and placeholder handling.
//!
//! Query text uses `?` as the single placeholder token for both backends.
//! Before sending, the text is rewritten to the backend's own syntax (`$1`,
//! `$2`, ... for PostgreSQL) or, when the parameter list is too large to bind,
//! the parameters are substituted as quoted literals.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{ColumnTypes, TypeRegistry};
use crate::value::{hex_encode, Param, Value};

/// Maximum number of bound parameters per statement on the socket protocol.
pub const PG_MAX_PARAMS: usize = 65535;
/// Maximum number of bound parameters per statement on the embedded engine.
pub const SQLITE_MAX_PARAMS: usize = 999;

/// A compiled query: text, positional params, optional prepared id and
/// optional per-column decode overrides.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    pub text: String,
    pub params: Vec<Param>,
    /// Non-empty means "prepare once per connection and reuse".
    pub id: Option<String>,
    pub types: Option<ColumnTypes>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Append one positional parameter.
    pub fn bind(mut self, param: impl Into<Param>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Replace all parameters.
    pub fn params(mut self, params: Vec<Param>) -> Self {
        self.params = params;
        self
    }

    /// Mark as a prepared statement with an id derived from the text.
    pub fn prepared(mut self) -> Self {
        let mut hasher = DefaultHasher::new();
        self.text.hash(&mut hasher);
        self.id = Some(format!("s{:016x}", hasher.finish()));
        self
    }

    /// Mark as a prepared statement with an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.id = if id.is_empty() { None } else { Some(id) };
        self
    }

    /// Decode `column` with the type registered as `type_name`.
    pub fn column_type(mut self, column: impl Into<String>, type_name: impl Into<String>) -> Self {
        let mut types = self
            .types
            .take()
            .map(|t| (*t).clone())
            .unwrap_or_default();
        types.insert(column.into(), type_name.into());
        self.types = Some(Arc::new(types));
        self
    }
}

/// Anything accepted where a query is expected.
pub trait IntoQuery {
    fn into_query(self) -> Query;
}

impl IntoQuery for Query {
    fn into_query(self) -> Query {
        self
    }
}

impl IntoQuery for &Query {
    fn into_query(self) -> Query {
        self.clone()
    }
}

impl IntoQuery for &str {
    fn into_query(self) -> Query {
        Query::new(self)
    }
}

impl IntoQuery for String {
    fn into_query(self) -> Query {
        Query::new(self)
    }
}

impl<S: Into<String>> IntoQuery for (S, Vec<Param>) {
    fn into_query(self) -> Query {
        Query::new(self.0).params(self.1)
    }
}

// ============================================================================
// Placeholder scanning
// ============================================================================

/// Target syntax for placeholder rewriting and literal quoting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn max_params(self) -> usize {
        match self {
            Dialect::Postgres => PG_MAX_PARAMS,
            Dialect::Sqlite => SQLITE_MAX_PARAMS,
        }
    }
}

/// Walk `text`, calling `on_placeholder` for every `?` outside quotes,
/// quoted identifiers, comments and dollar-quoted bodies. `??` is an escaped
/// literal `?`.
fn scan(text: &str, mut on_placeholder: impl FnMut(&mut String) -> Result<()>) -> Result<String> {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len() + 16);
    let mut i = 0;
    let mut copied = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // Doubled quote escapes itself
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 2;
            }
            b'$' => {
                // $tag$ ... $tag$
                let tag_end = bytes[i + 1..]
                    .iter()
                    .position(|&c| !(c.is_ascii_alphanumeric() || c == b'_'))
                    .map(|p| i + 1 + p);
                match tag_end {
                    Some(end) if bytes[end] == b'$' && !bytes[i + 1].is_ascii_digit() => {
                        let tag = &text[i..=end];
                        match text[end + 1..].find(tag) {
                            Some(close) => i = end + 1 + close + tag.len(),
                            None => i = bytes.len(),
                        }
                    }
                    _ => i += 1,
                }
            }
            b'?' => {
                out.push_str(&text[copied..i]);
                if bytes.get(i + 1) == Some(&b'?') {
                    out.push('?');
                    i += 2;
                } else {
                    on_placeholder(&mut out)?;
                    i += 1;
                }
                copied = i;
            }
            _ => i += 1,
        }
    }

    out.push_str(&text[copied.min(text.len())..]);
    Ok(out)
}

fn count_mismatch(placeholders: usize, params: usize) -> Error {
    Error::Usage(format!(
        "Parameter count mismatch: query has {} placeholders, {} params given",
        placeholders, params
    ))
}

/// Rewrite placeholders to the dialect's positional syntax, checking that
/// exactly `params` placeholders are present.
pub fn rewrite_placeholders(text: &str, params: usize, dialect: Dialect) -> Result<String> {
    let mut n = 0usize;
    let out = scan(text, |out| {
        n += 1;
        match dialect {
            Dialect::Postgres => {
                out.push('$');
                out.push_str(&n.to_string());
            }
            Dialect::Sqlite => out.push('?'),
        }
        Ok(())
    })?;

    if n != params {
        return Err(count_mismatch(n, params));
    }
    Ok(out)
}

/// Replace placeholders with quoted literals, left to right.
pub fn substitute_literals(
    text: &str,
    params: &[Param],
    registry: &TypeRegistry,
    dialect: Dialect,
) -> Result<String> {
    let mut iter = params.iter();
    let mut n = 0usize;
    let out = scan(text, |out| {
        n += 1;
        // Keep counting past the end so the error reports the real total
        if let Some(param) = iter.next() {
            out.push_str(&render_literal(param, registry, dialect)?);
        }
        Ok(())
    })?;

    if n != params.len() {
        return Err(count_mismatch(n, params.len()));
    }
    Ok(out)
}

fn render_literal(param: &Param, registry: &TypeRegistry, dialect: Dialect) -> Result<String> {
    match (param, dialect) {
        (Param::Plain(Value::Null), _) | (Param::Typed(_, Value::Null), _) => {
            Ok("NULL".to_string())
        }
        (Param::Plain(Value::Int(i)), _) => Ok(i.to_string()),
        (Param::Plain(Value::Float(f)), _) if f.is_finite() => Ok(f.to_string()),
        (Param::Plain(Value::Bool(b)), Dialect::Postgres) => {
            Ok(if *b { "TRUE" } else { "FALSE" }.to_string())
        }
        (Param::Plain(Value::Bool(b)), Dialect::Sqlite) => Ok(if *b { "1" } else { "0" }.to_string()),
        (Param::Plain(Value::Bytes(b)), Dialect::Sqlite) => Ok(format!("X'{}'", hex_encode(b))),
        _ => {
            let text = registry.encode_param(param)?.unwrap_or_default();
            Ok(match dialect {
                Dialect::Postgres => quote_literal(&text),
                Dialect::Sqlite => quote_sqlite_literal(&text),
            })
        }
    }
}

/// Quote an identifier: `a"b` becomes `"a""b"`.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for PostgreSQL.
///
/// Strings holding a backslash use the `E'...'` form with backslashes
/// doubled, so the result is correct whatever `standard_conforming_strings`
/// is set to.
pub fn quote_literal(text: &str) -> String {
    let escaped = text.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

fn quote_sqlite_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Column overrides as a plain map reference.
pub(crate) fn overrides(types: &Option<ColumnTypes>) -> Option<&HashMap<String, String>> {
    types.as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    #[test]
    fn test_rewrite_left_to_right() {
        let text = rewrite_placeholders("UPDATE t SET v=? WHERE id=?", 2, Dialect::Postgres).unwrap();
        assert_eq!(text, "UPDATE t SET v=$1 WHERE id=$2");
    }

    #[test]
    fn test_rewrite_count_mismatch() {
        let err = rewrite_placeholders("SELECT ?, ?", 3, Dialect::Postgres).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
        let err = rewrite_placeholders("SELECT ?, ?", 1, Dialect::Postgres).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn test_rewrite_skips_quotes_and_comments() {
        let text = "SELECT '?', \"a?\", $$?$$, $x$ ? $x$ -- ?\n, ? /* ? */, ??";
        let out = rewrite_placeholders(text, 1, Dialect::Postgres).unwrap();
        assert_eq!(out, "SELECT '?', \"a?\", $$?$$, $x$ ? $x$ -- ?\n, $1 /* ? */, ?");
    }

    #[test]
    fn test_rewrite_keeps_positional_dollar_params() {
        // $1 is not a dollar-quote tag
        let out = rewrite_placeholders("SELECT $1::int, ?", 1, Dialect::Postgres).unwrap();
        assert_eq!(out, "SELECT $1::int, $1");
    }

    #[test]
    fn test_substitute_literals() {
        let registry = TypeRegistry::with_builtins();
        let out = substitute_literals(
            "INSERT INTO t VALUES (?, ?, ?, ?)",
            &params![1, "it's", None::<i32>, true],
            &registry,
            Dialect::Postgres,
        )
        .unwrap();
        assert_eq!(out, "INSERT INTO t VALUES (1, 'it''s', NULL, TRUE)");

        let out = substitute_literals(
            "SELECT ?",
            &params![vec![1u8, 2u8]],
            &registry,
            Dialect::Sqlite,
        )
        .unwrap();
        assert_eq!(out, "SELECT X'0102'");

        let err = substitute_literals("SELECT ?", &params![1, 2], &registry, Dialect::Postgres)
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn test_quote_helpers() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("a'b"), "'a''b'");
        assert_eq!(quote_literal("a\\b"), "E'a\\\\b'");
    }

    #[test]
    fn test_query_builder() {
        let q = Query::new("SELECT * FROM t WHERE id = ?")
            .bind(5)
            .prepared()
            .column_type("data", "json");
        assert_eq!(q.params, params![5]);
        assert!(q.id.as_deref().unwrap().starts_with('s'));
        assert_eq!(q.types.as_ref().unwrap().get("data").unwrap(), "json");

        // Same text, same id
        let again = Query::new("SELECT * FROM t WHERE id = ?").prepared();
        assert_eq!(q.id, again.id);

        assert_eq!(Query::new("x").with_id("").id, None);

        let q = ("SELECT ?", params![1]).into_query();
        assert_eq!(q.params.len(), 1);
    }
}
