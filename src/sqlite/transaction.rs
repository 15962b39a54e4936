//! Transactions and savepoints on the embedded connection.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use super::connection::{Expect, QueryResult};
use super::pool::PoolInner;
use crate::error::{Error, Result};
use crate::executor::{savepoint_name, Executor, TransactionMode};
use crate::sql::{IntoQuery, Query};
use crate::value::{Row, Rows};

/// Handle passed to `begin`/`lock` callbacks. Rejected with
/// [`Error::Usage`] once the enclosing call has returned.
#[derive(Clone)]
pub struct SqliteTransaction {
    pool: Arc<PoolInner>,
    lease: u64,
    in_transaction: bool,
}

impl std::fmt::Debug for SqliteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransaction")
            .field("lease", &self.lease)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl SqliteTransaction {
    pub(crate) fn new(pool: Arc<PoolInner>, lease: u64, in_transaction: bool) -> Self {
        Self {
            pool,
            lease,
            in_transaction,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn request(&self, query: Query, expect: Expect, max_rows: usize) -> Result<QueryResult> {
        if self.pool.lease.load(Ordering::Acquire) != self.lease {
            return Err(Error::Usage(
                "Transaction handle used outside of its transaction".to_string(),
            ));
        }
        self.pool.check_open()?;
        self.pool.conn.run(query, expect, max_rows).await
    }

    pub async fn exec(&self, query: impl IntoQuery) -> Result<u64> {
        Ok(self.request(query.into_query(), Expect::Any, 0).await?.count)
    }

    pub async fn execute(&self, query: impl IntoQuery) -> Result<u64> {
        Ok(self.request(query.into_query(), Expect::NoRows, 0).await?.count)
    }

    pub async fn select(&self, query: impl IntoQuery) -> Result<Rows> {
        let result = self.request(query.into_query(), Expect::Rows, 0).await?;
        Ok(Rows::new(result.rows, result.count))
    }

    pub async fn select_row(&self, query: impl IntoQuery) -> Result<Option<Row>> {
        let result = self.request(query.into_query(), Expect::Rows, 1).await?;
        Ok(result.rows.into_iter().next())
    }

    /// Open a transaction, or a savepoint if one is already open.
    pub async fn begin<F, Fut, T>(&self, mode: TransactionMode, f: F) -> Result<T>
    where
        F: FnOnce(SqliteTransaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.in_transaction {
            savepoint(self, f).await
        } else {
            run(self, mode, f).await
        }
    }

    async fn autocommit(&self) -> bool {
        // A closed connection has nothing left to roll back
        self.pool.conn.is_autocommit().await.unwrap_or(true)
    }
}

pub(crate) async fn run<F, Fut, T>(tx: &SqliteTransaction, mode: TransactionMode, f: F) -> Result<T>
where
    F: FnOnce(SqliteTransaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    tx.exec(mode.sqlite_begin()).await?;
    let inner = SqliteTransaction {
        in_transaction: true,
        ..tx.clone()
    };

    match f(inner).await {
        Ok(value) => {
            // Some errors (disk full, interrupts) end the transaction on their own
            if tx.autocommit().await {
                return Err(Error::Usage(
                    "Transaction was rolled back by the database".to_string(),
                ));
            }
            if let Err(e) = tx.exec("COMMIT").await {
                rollback(tx, "ROLLBACK").await;
                return Err(e);
            }
            Ok(value)
        }
        Err(e) => {
            debug!(error = %e, "rolling back");
            rollback(tx, "ROLLBACK").await;
            Err(e)
        }
    }
}

async fn savepoint<F, Fut, T>(tx: &SqliteTransaction, f: F) -> Result<T>
where
    F: FnOnce(SqliteTransaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let name = savepoint_name();
    let undo = format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}");
    tx.exec(format!("SAVEPOINT {name}")).await?;

    match f(tx.clone()).await {
        Ok(value) => {
            tx.exec(format!("RELEASE SAVEPOINT {name}")).await?;
            Ok(value)
        }
        Err(e) => {
            rollback(tx, &undo).await;
            Err(e)
        }
    }
}

async fn rollback(tx: &SqliteTransaction, sql: &str) {
    if tx.autocommit().await {
        return;
    }
    if let Err(e) = tx.exec(Query::new(sql)).await {
        warn!(error = %e, "rollback failed");
    }
}

impl Executor for SqliteTransaction {
    async fn exec(&self, query: impl IntoQuery + Send) -> Result<u64> {
        SqliteTransaction::exec(self, query).await
    }

    async fn execute(&self, query: impl IntoQuery + Send) -> Result<u64> {
        SqliteTransaction::execute(self, query).await
    }

    async fn select(&self, query: impl IntoQuery + Send) -> Result<Rows> {
        SqliteTransaction::select(self, query).await
    }

    async fn select_row(&self, query: impl IntoQuery + Send) -> Result<Option<Row>> {
        SqliteTransaction::select_row(self, query).await
    }
}
