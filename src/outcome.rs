//! Uniform, serializable result of one call.
//!
//! API layers that forward database results to clients want a single shape
//! regardless of which method ran or how it failed:
//!
//! ```json
//! { "ok": false, "status": 500, "exception": true, "reason": "Connection destroyed: socket closed" }
//! ```

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::value::{Row, Rows};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub ok: bool,
    pub status: u16,
    /// Rows for `select`, one row (or `null`) for `select_row`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    /// Row count: returned rows for `select`, affected rows otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    /// Set on failures; `true` when the driver or connection failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Outcome {
    fn success(data: Option<JsonValue>, rows: Option<u64>) -> Self {
        Self {
            ok: true,
            status: 200,
            data,
            rows,
            exception: None,
            code: None,
            reason: None,
        }
    }

    pub fn rows(rows: &Rows) -> Self {
        Self::success(Some(rows.to_json()), Some(rows.count()))
    }

    pub fn row(row: Option<&Row>) -> Self {
        let data = row.map_or(JsonValue::Null, Row::to_json);
        Self::success(Some(data), Some(u64::from(row.is_some())))
    }

    pub fn count(count: u64) -> Self {
        Self::success(None, Some(count))
    }

    pub fn error(error: &Error) -> Self {
        Self {
            ok: false,
            status: error.status(),
            data: None,
            rows: None,
            exception: Some(error.is_exception()),
            code: error.code().map(str::to_string),
            reason: Some(error.reason()),
        }
    }
}

impl From<Result<Rows>> for Outcome {
    fn from(result: Result<Rows>) -> Self {
        match result {
            Ok(rows) => Outcome::rows(&rows),
            Err(e) => Outcome::error(&e),
        }
    }
}

impl From<Result<Option<Row>>> for Outcome {
    fn from(result: Result<Option<Row>>) -> Self {
        match result {
            Ok(row) => Outcome::row(row.as_ref()),
            Err(e) => Outcome::error(&e),
        }
    }
}

impl From<Result<u64>> for Outcome {
    fn from(result: Result<u64>) -> Self {
        match result {
            Ok(count) => Outcome::count(count),
            Err(e) => Outcome::error(&e),
        }
    }
}

impl From<Error> for Outcome {
    fn from(error: Error) -> Self {
        Outcome::error(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::ServerError;
    use crate::value::{SharedNames, Value};
    use serde_json::json;

    fn rows() -> Rows {
        let names: SharedNames = ["id", "name"].iter().map(|s| s.to_string()).collect();
        let row = |id: i64, name: &str| {
            Row::new(
                names.clone(),
                [Value::Int(id), Value::from(name)].into_iter().collect(),
            )
        };
        Rows::new(vec![row(1, "a"), row(2, "b")], 2)
    }

    #[test]
    fn test_select_outcome() {
        let outcome = Outcome::from(Ok::<_, Error>(rows()));
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({
                "ok": true,
                "status": 200,
                "data": [{"id": 1, "name": "a"}, {"id": 2, "name": "b"}],
                "rows": 2
            })
        );
    }

    #[test]
    fn test_missing_row_is_null_data() {
        let outcome = Outcome::from(Ok::<Option<Row>, Error>(None));
        assert!(outcome.ok);
        assert_eq!(outcome.data, Some(JsonValue::Null));
        assert_eq!(outcome.rows, Some(0));
    }

    #[test]
    fn test_statement_failure_is_not_an_exception() {
        let err = Error::from(ServerError {
            severity: "ERROR".into(),
            code: "23505".into(),
            message: "duplicate key value violates unique constraint".into(),
            ..ServerError::default()
        });
        let outcome = Outcome::from(Err::<u64, _>(err));
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({
                "ok": false,
                "status": 500,
                "exception": false,
                "code": "23505",
                "reason": "duplicate key value violates unique constraint"
            })
        );
    }

    #[test]
    fn test_connection_failure_is_an_exception() {
        let outcome = Outcome::from(Error::Destroyed("socket closed".into()));
        assert!(!outcome.ok);
        assert_eq!(outcome.exception, Some(true));
        assert_eq!(outcome.reason.as_deref(), Some("socket closed"));

        let outcome = Outcome::from(Error::status_code(409, "conflict"));
        assert_eq!(outcome.status, 409);
        assert_eq!(outcome.exception, Some(false));
    }
}
