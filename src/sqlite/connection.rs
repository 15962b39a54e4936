//! SQLite connection: a `tokio-rusqlite` handle plus the statement runner.
//!
//! Every call hops onto the connection's background thread. The runner
//! compiles `?` placeholders, enforces the row-shape checks shared with the
//! socket backend and decodes columns through the type registry.

use std::sync::Arc;

use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Batch, OpenFlags};
use smallvec::SmallVec;
use tracing::debug;

use super::types::{function_error, function_result, from_sql, to_sql, ColumnDecoder, ScalarFunction};
use crate::config::DatabaseUrl;
use crate::error::{Error, Result};
use crate::sql::{overrides, rewrite_placeholders, substitute_literals, Dialect, Query, SQLITE_MAX_PARAMS};
use crate::types::TypeRegistry;
use crate::value::{Row, SharedNames, Value};

/// What the caller expects a statement to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    Rows,
    NoRows,
    /// `exec`: any number of statements, rows discarded.
    Any,
}

/// Rows and the count of the last statement.
#[derive(Debug, Default)]
pub(crate) struct QueryResult {
    pub rows: Vec<Row>,
    pub count: u64,
}

/// A SQLite connection.
#[derive(Clone)]
pub struct SqliteConnection {
    conn: tokio_rusqlite::Connection,
    registry: Arc<TypeRegistry>,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection").finish_non_exhaustive()
    }
}

impl SqliteConnection {
    /// Open the database named by `url` and apply its pragmas.
    ///
    /// File databases default to WAL journaling; `readOnly` and `create`
    /// map onto the open flags.
    pub async fn open(url: &DatabaseUrl, registry: Arc<TypeRegistry>) -> Result<Self> {
        let pragmas = pragmas(url)?;
        let conn = if url.is_memory() {
            tokio_rusqlite::Connection::open_in_memory().await?
        } else {
            let path = url.database.clone().unwrap_or_default();
            let mut flags = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            if url.read_only {
                flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
            } else {
                flags |= OpenFlags::SQLITE_OPEN_READ_WRITE;
                if url.create {
                    flags |= OpenFlags::SQLITE_OPEN_CREATE;
                }
            }
            tokio_rusqlite::Connection::open_with_flags(path, flags).await?
        };

        debug!(database = url.database.as_deref().unwrap_or(":memory:"), "opened sqlite database");
        conn.call(move |c| {
            c.execute_batch(&pragmas)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, registry })
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Install a scalar function on this connection.
    pub async fn register_function(&self, function: ScalarFunction) -> Result<()> {
        let ScalarFunction {
            name,
            args,
            deterministic,
            func,
        } = function;
        let mut flags = FunctionFlags::SQLITE_UTF8;
        if deterministic {
            flags |= FunctionFlags::SQLITE_DETERMINISTIC;
        }
        let func = std::panic::AssertUnwindSafe(func);

        self.conn
            .call(move |c| {
                c.create_scalar_function(name.as_str(), args, flags, move |ctx| {
                    let values: Vec<Value> = (0..ctx.len()).map(|i| from_sql(ctx.get_raw(i))).collect();
                    (*func)(&values).map(function_result).map_err(function_error)
                })?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// `false` while a transaction is open.
    pub async fn is_autocommit(&self) -> Result<bool> {
        Ok(self.conn.call(|c| Ok(c.is_autocommit())).await?)
    }

    pub(crate) async fn run(&self, query: Query, expect: Expect, max_rows: usize) -> Result<QueryResult> {
        let Query {
            text,
            params,
            id,
            types,
        } = query;

        let (sql, values) = if params.len() > SQLITE_MAX_PARAMS {
            let sql = substitute_literals(&text, &params, &self.registry, Dialect::Sqlite)?;
            (sql, Vec::new())
        } else {
            let sql = rewrite_placeholders(&text, params.len(), Dialect::Sqlite)?;
            let values = params
                .iter()
                .map(|p| to_sql(p, &self.registry))
                .collect::<Result<Vec<_>>>()?;
            (sql, values)
        };

        let registry = Arc::clone(&self.registry);
        let cached = id.is_some();
        self.conn
            .call(move |c| {
                let columns = overrides(&types);
                let result = if expect == Expect::Any && values.is_empty() {
                    run_batch(c, &sql)
                } else {
                    let plan = Plan {
                        registry: &registry,
                        overrides: columns,
                        expect,
                        max_rows,
                    };
                    if cached {
                        c.prepare_cached(&sql)
                            .map_err(Error::from)
                            .and_then(|mut stmt| plan.run(&mut stmt, &values))
                    } else {
                        c.prepare(&sql)
                            .map_err(Error::from)
                            .and_then(|mut stmt| plan.run(&mut stmt, &values))
                    }
                };
                Ok(result)
            })
            .await?
    }

    /// Close the background thread. Later calls fail as destroyed.
    pub async fn close(&self) -> Result<()> {
        match self.conn.clone().close().await {
            Ok(()) | Err(tokio_rusqlite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn pragmas(url: &DatabaseUrl) -> Result<String> {
    let mut out = vec![
        format!("PRAGMA busy_timeout = {};", url.busy_timeout_ms),
        format!("PRAGMA foreign_keys = {};", if url.foreign_keys { "ON" } else { "OFF" }),
        format!("PRAGMA cache_size = {};", url.cache_size),
        format!("PRAGMA synchronous = {};", keyword("synchronous", &url.synchronous)?),
    ];
    if let Some(store) = &url.temp_store {
        out.push(format!("PRAGMA temp_store = {};", keyword("tempStore", store)?));
    }
    if !url.is_memory() && !url.read_only {
        out.push(format!("PRAGMA journal_mode = {};", keyword("journalMode", &url.journal_mode)?));
    }
    Ok(out.join("\n"))
}

/// Pragma values are spliced into SQL, so only bare words pass.
fn keyword<'a>(name: &str, value: &'a str) -> Result<&'a str> {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(value)
    } else {
        Err(Error::Config(format!("Invalid {} value: {:?}", name, value)))
    }
}

/// Run every statement in `sql`; the count comes from the last one.
fn run_batch(c: &rusqlite::Connection, sql: &str) -> Result<QueryResult> {
    let mut batch = Batch::new(c, sql);
    let mut count = 0;
    while let Some(mut stmt) = batch.next()? {
        if stmt.column_count() > 0 {
            let mut rows = stmt.raw_query();
            count = 0;
            while rows.next()?.is_some() {
                count += 1;
            }
        } else {
            count = stmt.raw_execute()? as u64;
        }
    }
    Ok(QueryResult {
        rows: Vec::new(),
        count,
    })
}

struct Plan<'a> {
    registry: &'a TypeRegistry,
    overrides: Option<&'a std::collections::HashMap<String, String>>,
    expect: Expect,
    max_rows: usize,
}

impl Plan<'_> {
    fn run(&self, stmt: &mut rusqlite::Statement<'_>, values: &[SqlValue]) -> Result<QueryResult> {
        let returns_rows = stmt.column_count() > 0;
        match self.expect {
            Expect::NoRows if returns_rows => {
                return Err(Error::Usage(
                    "Statement returns rows; use select() or exec()".to_string(),
                ))
            }
            Expect::Rows if !returns_rows => {
                return Err(Error::Usage(
                    "Statement does not return rows; use execute()".to_string(),
                ))
            }
            _ => {}
        }
        let params = rusqlite::params_from_iter(values.iter());

        if !returns_rows {
            let count = stmt.execute(params)?;
            return Ok(QueryResult {
                rows: Vec::new(),
                count: count as u64,
            });
        }

        let names: SharedNames = stmt.column_names().into_iter().map(str::to_string).collect();
        let decoders: Vec<ColumnDecoder> = stmt
            .columns()
            .iter()
            .map(|col| {
                let requested = self.overrides.and_then(|o| o.get(col.name())).map(String::as_str);
                ColumnDecoder::resolve(self.registry, requested, col.decl_type())
            })
            .collect();
        let keep = self.expect != Expect::Any;

        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        let mut count = 0u64;
        while let Some(row) = rows.next()? {
            count += 1;
            if keep {
                let mut values = SmallVec::with_capacity(decoders.len());
                for (i, decoder) in decoders.iter().enumerate() {
                    values.push(decoder.decode(row.get_ref(i)?)?);
                }
                out.push(Row::new(Arc::clone(&names), values));
            }
            if self.max_rows > 0 && count as usize >= self.max_rows {
                break;
            }
        }
        Ok(QueryResult { rows: out, count })
    }
}
