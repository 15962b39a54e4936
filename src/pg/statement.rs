//! In-flight statement handles and the per-connection prepared-statement map.
//!
//! This module provides:
//! - `Statement`: one queued request, accumulating its result until the
//!   closing `ReadyForQuery`
//! - `Columns`: decoded column metadata (names plus resolved decoders)
//! - `PreparedStatements`: statement id to learned columns, append-only for
//!   the connection's lifetime

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use smallvec::SmallVec;
use tokio::sync::oneshot;

use super::protocol::FieldDescription;
use crate::error::{Error, Result};
use crate::types::{decode_column, ColumnTypes, DecodeFn, TypeRegistry};
use crate::value::{Row, SharedNames, Value};

/// What the caller expects the statement to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    /// `select`/`select_row`: the statement must describe a row set.
    Rows,
    /// `execute`: the statement must not describe a row set.
    NoRows,
    /// `exec`: anything goes, rows are discarded.
    Any,
}

/// Execution options carried by each request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExecOptions {
    pub ignore_data: bool,
    /// Protocol-level row limit, 0 for none.
    pub max_rows: i32,
    pub expect: Expect,
}

impl ExecOptions {
    pub fn exec() -> Self {
        Self {
            ignore_data: true,
            max_rows: 0,
            expect: Expect::Any,
        }
    }

    pub fn execute() -> Self {
        Self {
            ignore_data: true,
            max_rows: 0,
            expect: Expect::NoRows,
        }
    }

    pub fn select() -> Self {
        Self {
            ignore_data: false,
            max_rows: 0,
            expect: Expect::Rows,
        }
    }

    pub fn select_row() -> Self {
        Self {
            max_rows: 1,
            ..Self::select()
        }
    }
}

/// Final output of one statement.
#[derive(Debug, Default)]
pub(crate) struct StatementResult {
    pub rows: Vec<Row>,
    pub count: u64,
}

pub(crate) type Reply = oneshot::Sender<Result<StatementResult>>;

// ============================================================================
// Columns
// ============================================================================

/// Column metadata of one row set, with decoders resolved once.
#[derive(Debug)]
pub(crate) struct Columns {
    names: SharedNames,
    decoders: Vec<Option<DecodeFn>>,
}

impl Columns {
    pub fn empty() -> Self {
        Self {
            names: Arc::from(Vec::<String>::new()),
            decoders: Vec::new(),
        }
    }

    pub fn resolve(
        fields: &[FieldDescription],
        registry: &TypeRegistry,
        overrides: Option<&HashMap<String, String>>,
    ) -> Self {
        let names: SharedNames = fields.iter().map(|f| f.name.clone()).collect();
        let decoders = fields
            .iter()
            .map(|f| registry.decoder(&f.name, Some(f.type_oid), overrides))
            .collect();
        Self { names, decoders }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn decode_row(&self, values: Vec<Option<Bytes>>) -> Result<Row> {
        if values.len() != self.names.len() {
            return Err(Error::Protocol(format!(
                "DataRow has {} columns, RowDescription announced {}",
                values.len(),
                self.names.len()
            )));
        }

        let mut decoded: SmallVec<[Value; 16]> = SmallVec::with_capacity(values.len());
        for (raw, decoder) in values.iter().zip(&self.decoders) {
            decoded.push(match raw {
                None => Value::Null,
                Some(raw) => decode_column(*decoder, raw)?,
            });
        }
        Ok(Row::new(Arc::clone(&self.names), decoded))
    }
}

// ============================================================================
// Prepared statements
// ============================================================================

/// Statement id to learned columns. `None` means Parse was sent but the
/// description has not arrived yet.
#[derive(Debug, Default)]
pub(crate) struct PreparedStatements {
    map: HashMap<String, Option<Arc<Columns>>>,
}

impl PreparedStatements {
    pub fn contains(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }

    /// Columns known for `id`, if described already.
    pub fn columns(&self, id: &str) -> Option<Arc<Columns>> {
        self.map.get(id).cloned().flatten()
    }

    pub fn mark_parsing(&mut self, id: &str) {
        self.map.entry(id.to_string()).or_insert(None);
    }

    pub fn learn(&mut self, id: &str, columns: Arc<Columns>) {
        self.map.insert(id.to_string(), Some(columns));
    }

    /// Parse failed on the server, the id does not exist there.
    pub fn forget(&mut self, id: &str) {
        self.map.remove(id);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

// ============================================================================
// Statement handle
// ============================================================================

/// One in-flight request.
pub(crate) struct Statement {
    reply: Reply,
    pub statement_id: Option<String>,
    pub types: Option<ColumnTypes>,
    pub opts: ExecOptions,
    /// Parse was skipped because the id was already known.
    pub reused: bool,
    /// Parse was sent and ParseComplete has not arrived.
    pub parse_pending: bool,
    pub columns: Option<Arc<Columns>>,
    error: Option<Error>,
    rows: Vec<Row>,
    received: u64,
    count: u64,
}

impl Statement {
    pub fn new(
        reply: Reply,
        statement_id: Option<String>,
        types: Option<ColumnTypes>,
        opts: ExecOptions,
    ) -> Self {
        Self {
            reply,
            statement_id,
            types,
            opts,
            reused: false,
            parse_pending: false,
            columns: None,
            error: None,
            rows: Vec::new(),
            received: 0,
            count: 0,
        }
    }

    /// A new row set started (simple mode may run several).
    pub fn describe(&mut self, columns: Arc<Columns>) {
        self.columns = Some(columns);
        self.rows.clear();
        self.received = 0;
    }

    pub fn push_row(&mut self, values: Vec<Option<Bytes>>, cached: Option<Arc<Columns>>) -> Result<()> {
        self.received += 1;
        if self.opts.ignore_data {
            return Ok(());
        }
        if self.columns.is_none() {
            self.columns = cached;
        }
        let columns = self
            .columns
            .as_ref()
            .ok_or_else(|| Error::Protocol("DataRow without a row description".to_string()))?;
        match columns.decode_row(values) {
            Ok(row) => self.rows.push(row),
            Err(e @ Error::Protocol(_)) => return Err(e),
            Err(e) => self.fail(e),
        }
        Ok(())
    }

    pub fn complete(&mut self, count: u64) {
        self.count = count;
    }

    /// Execute stopped at the row limit.
    pub fn suspended(&mut self) {
        self.count = self.received;
    }

    /// Keep the first error, the rest of the request is skipped by the server.
    pub fn fail(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Deliver the result. `cached` is the prepared columns for reused ids.
    pub fn finish(mut self, cached: Option<Arc<Columns>>) {
        if self.columns.is_none() {
            self.columns = cached;
        }
        let returns_rows = self.columns.as_ref().is_some_and(|c| !c.is_empty());

        let result = match (self.error.take(), self.opts.expect) {
            (Some(err), _) => Err(err),
            (None, Expect::NoRows) if returns_rows => Err(Error::Usage(
                "Statement returns rows; use select() or exec()".to_string(),
            )),
            (None, Expect::Rows) if !returns_rows => Err(Error::Usage(
                "Statement does not return rows; use execute()".to_string(),
            )),
            (None, _) => Ok(StatementResult {
                rows: std::mem::take(&mut self.rows),
                count: self.count,
            }),
        };
        // The caller may have gone away, nothing to do then
        let _ = self.reply.send(result);
    }

    /// Fail without a server round-trip (connection destroyed).
    pub fn abort(self, error: Error) {
        let _ = self.reply.send(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Oid;

    fn field(name: &str, oid: Oid) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: oid,
            type_size: -1,
            type_modifier: -1,
            format: 0,
        }
    }

    fn columns() -> Arc<Columns> {
        let registry = TypeRegistry::with_builtins();
        Arc::new(Columns::resolve(
            &[field("id", Oid::INT4), field("name", Oid::TEXT)],
            &registry,
            None,
        ))
    }

    #[tokio::test]
    async fn test_select_collects_rows() {
        let (tx, rx) = oneshot::channel();
        let mut sth = Statement::new(tx, None, None, ExecOptions::select());
        sth.describe(columns());
        sth.push_row(vec![Some(Bytes::from_static(b"1")), None], None)
            .unwrap();
        sth.complete(1);
        sth.finish(None);

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.rows[0].get("id"), Some(&Value::Int(1)));
        assert_eq!(result.rows[0].get("name"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_reused_statement_uses_cached_columns() {
        let (tx, rx) = oneshot::channel();
        let mut sth = Statement::new(tx, Some("s1".into()), None, ExecOptions::select_row());
        sth.reused = true;
        sth.push_row(vec![Some(Bytes::from_static(b"9")), Some(Bytes::from_static(b"x"))], Some(columns()))
            .unwrap();
        sth.suspended();
        sth.finish(Some(columns()));

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.rows[0].get("name").and_then(Value::as_str), Some("x"));
    }

    #[tokio::test]
    async fn test_expectation_mismatch_is_usage_error() {
        let (tx, rx) = oneshot::channel();
        let mut sth = Statement::new(tx, None, None, ExecOptions::execute());
        sth.describe(columns());
        sth.finish(None);
        assert!(matches!(rx.await.unwrap(), Err(Error::Usage(_))));

        let (tx, rx) = oneshot::channel();
        let mut sth = Statement::new(tx, None, None, ExecOptions::select());
        sth.describe(Arc::new(Columns::empty()));
        sth.finish(None);
        assert!(matches!(rx.await.unwrap(), Err(Error::Usage(_))));
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let (tx, rx) = oneshot::channel();
        let mut sth = Statement::new(tx, None, None, ExecOptions::exec());
        sth.fail(Error::Usage("first".into()));
        sth.fail(Error::Usage("second".into()));
        sth.finish(None);
        match rx.await.unwrap() {
            Err(Error::Usage(m)) => assert_eq!(m, "first"),
            other => panic!("unexpected {:?}", other.map(|r| r.count)),
        }
    }

    #[test]
    fn test_prepared_map() {
        let mut prepared = PreparedStatements::default();
        prepared.mark_parsing("s1");
        assert!(prepared.contains("s1"));
        assert!(prepared.columns("s1").is_none());
        prepared.learn("s1", columns());
        assert!(prepared.columns("s1").is_some());
        prepared.forget("s1");
        assert_eq!(prepared.len(), 0);
    }
}
