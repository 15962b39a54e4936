//! Transactions and savepoints on an exclusively leased connection.

use std::future::Future;

use tracing::{debug, warn};

use super::connection::Connection;
use super::protocol::TransactionStatus;
use crate::error::{Error, Result};
use crate::executor::{savepoint_name, Executor, TransactionMode};
use crate::sql::{IntoQuery, Query};
use crate::value::{Row, Rows};

/// Handle passed to `begin`/`lock` callbacks.
///
/// Every statement carries the lease token of the enclosing `begin`/`lock`;
/// once that call returns, the handle is rejected with
/// [`Error::Usage`].
#[derive(Clone)]
pub struct PgTransaction {
    conn: Connection,
    lease: u64,
    /// Inside BEGIN, so a nested `begin` becomes a savepoint.
    in_transaction: bool,
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction")
            .field("connection", &self.conn.id())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl PgTransaction {
    pub(crate) fn new(conn: Connection, lease: u64, in_transaction: bool) -> Self {
        Self {
            conn,
            lease,
            in_transaction,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub async fn exec(&self, query: impl IntoQuery) -> Result<u64> {
        self.conn.exec_as(query.into_query(), self.lease).await
    }

    pub async fn execute(&self, query: impl IntoQuery) -> Result<u64> {
        self.conn.execute_as(query.into_query(), self.lease).await
    }

    pub async fn select(&self, query: impl IntoQuery) -> Result<Rows> {
        self.conn.select_as(query.into_query(), self.lease).await
    }

    pub async fn select_row(&self, query: impl IntoQuery) -> Result<Option<Row>> {
        self.conn.select_row_as(query.into_query(), self.lease).await
    }

    /// Open a transaction on this connection, or a savepoint if one is
    /// already open.
    pub async fn begin<F, Fut, T>(&self, mode: TransactionMode, f: F) -> Result<T>
    where
        F: FnOnce(PgTransaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.in_transaction {
            savepoint(self, f).await
        } else {
            run(self, mode, f).await
        }
    }
}

/// BEGIN, run `f`, then COMMIT or ROLLBACK.
pub(crate) async fn run<F, Fut, T>(tx: &PgTransaction, mode: TransactionMode, f: F) -> Result<T>
where
    F: FnOnce(PgTransaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    tx.exec(mode.postgres_begin()).await?;
    let inner = PgTransaction {
        in_transaction: true,
        ..tx.clone()
    };

    match f(inner).await {
        Ok(value) => {
            // COMMIT of a failed transaction reports success but rolls back
            if tx.conn.transaction_status() == TransactionStatus::Failed {
                rollback(tx, "ROLLBACK").await;
                return Err(Error::Usage(
                    "Transaction failed on the server and was rolled back".to_string(),
                ));
            }
            if let Err(e) = tx.exec("COMMIT").await {
                if tx.conn.transaction_status().in_transaction() {
                    rollback(tx, "ROLLBACK").await;
                }
                return Err(e);
            }
            Ok(value)
        }
        Err(e) => {
            debug!(connection = tx.conn.id(), error = %e, "rolling back");
            rollback(tx, "ROLLBACK").await;
            Err(e)
        }
    }
}

async fn savepoint<F, Fut, T>(tx: &PgTransaction, f: F) -> Result<T>
where
    F: FnOnce(PgTransaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let name = savepoint_name();
    let undo = format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}");
    tx.exec(format!("SAVEPOINT {name}")).await?;

    match f(tx.clone()).await {
        Ok(value) => {
            if tx.conn.transaction_status() == TransactionStatus::Failed {
                rollback(tx, &undo).await;
                return Err(Error::Usage(format!(
                    "Savepoint {name} failed on the server and was rolled back"
                )));
            }
            tx.exec(format!("RELEASE SAVEPOINT {name}")).await?;
            Ok(value)
        }
        Err(e) => {
            rollback(tx, &undo).await;
            Err(e)
        }
    }
}

/// Best effort: the caller's error wins over a failed rollback.
async fn rollback(tx: &PgTransaction, sql: &str) {
    if tx.conn.is_destroyed() {
        return;
    }
    if let Err(e) = tx.exec(Query::new(sql)).await {
        warn!(connection = tx.conn.id(), error = %e, "rollback failed");
    }
}

impl Executor for PgTransaction {
    async fn exec(&self, query: impl IntoQuery + Send) -> Result<u64> {
        PgTransaction::exec(self, query).await
    }

    async fn execute(&self, query: impl IntoQuery + Send) -> Result<u64> {
        PgTransaction::execute(self, query).await
    }

    async fn select(&self, query: impl IntoQuery + Send) -> Result<Rows> {
        PgTransaction::select(self, query).await
    }

    async fn select_row(&self, query: impl IntoQuery + Send) -> Result<Option<Row>> {
        PgTransaction::select_row(self, query).await
    }
}
