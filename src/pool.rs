//! Backend-dispatching front door.
//!
//! [`Database`] wraps either driver's pool behind one surface, chosen by URL
//! scheme. `begin`/`lock` callbacks receive a [`Transaction`] wrapping the
//! backend's handle, so generic code never names a driver.

use std::future::Future;

use crate::config::{Backend, DatabaseUrl};
use crate::error::{Error, Result};
use crate::executor::{Executor, TransactionMode};
use crate::pg::{Notifications, PgPool, PgPoolConfig, PgTransaction, PoolStatus};
use crate::sql::IntoQuery;
use crate::sqlite::{ScalarFunction, SqlitePool, SqlitePoolConfig, SqliteTransaction};
use crate::types::TypeRegistry;
use crate::value::{Row, Rows};

/// A database connection pool
#[derive(Clone, Debug)]
pub enum Database {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl Database {
    /// Open a pool for `url` with the built-in types.
    ///
    /// PostgreSQL connections are opened lazily; an SQLite file is opened
    /// right away so a bad path fails here.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(&DatabaseUrl::parse(url)?, TypeRegistry::with_builtins()).await
    }

    pub async fn connect_with(url: &DatabaseUrl, registry: TypeRegistry) -> Result<Self> {
        match url.backend {
            Backend::Postgres => Ok(Database::Postgres(PgPool::new(
                PgPoolConfig::from_url(url)?.registry(registry),
            ))),
            Backend::Sqlite => Ok(Database::Sqlite(
                SqlitePool::connect(SqlitePoolConfig::from_url(url)?.registry(registry)).await?,
            )),
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Database::Postgres(_) => Backend::Postgres,
            Database::Sqlite(_) => Backend::Sqlite,
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        match self {
            Database::Postgres(pool) => pool.registry(),
            Database::Sqlite(pool) => pool.registry(),
        }
    }

    pub fn status(&self) -> PoolStatus {
        match self {
            Database::Postgres(pool) => pool.status(),
            Database::Sqlite(pool) => pool.status(),
        }
    }

    pub async fn close(&self) {
        match self {
            Database::Postgres(pool) => pool.close(),
            Database::Sqlite(pool) => pool.close().await,
        }
    }

    /// LISTEN/NOTIFY manager. PostgreSQL only.
    pub fn notifications(&self) -> Result<Notifications> {
        match self {
            Database::Postgres(pool) => Ok(pool.notifications()),
            Database::Sqlite(_) => Err(Error::Usage(
                "Notifications require a PostgreSQL database".to_string(),
            )),
        }
    }

    /// Install a scalar SQL function. SQLite only.
    pub async fn register_function(&self, function: ScalarFunction) -> Result<()> {
        match self {
            Database::Postgres(_) => Err(Error::Usage(format!(
                "Cannot register function {}: scalar functions require SQLite",
                function.name
            ))),
            Database::Sqlite(pool) => pool.register_function(function).await,
        }
    }

    pub async fn exec(&self, query: impl IntoQuery) -> Result<u64> {
        match self {
            Database::Postgres(pool) => pool.exec(query).await,
            Database::Sqlite(pool) => pool.exec(query).await,
        }
    }

    pub async fn execute(&self, query: impl IntoQuery) -> Result<u64> {
        match self {
            Database::Postgres(pool) => pool.execute(query).await,
            Database::Sqlite(pool) => pool.execute(query).await,
        }
    }

    pub async fn select(&self, query: impl IntoQuery) -> Result<Rows> {
        match self {
            Database::Postgres(pool) => pool.select(query).await,
            Database::Sqlite(pool) => pool.select(query).await,
        }
    }

    pub async fn select_row(&self, query: impl IntoQuery) -> Result<Option<Row>> {
        match self {
            Database::Postgres(pool) => pool.select_row(query).await,
            Database::Sqlite(pool) => pool.select_row(query).await,
        }
    }

    /// Run `f` in a transaction: COMMIT when it returns `Ok`, ROLLBACK when
    /// it returns `Err`.
    pub async fn begin<F, Fut, T>(&self, mode: TransactionMode, f: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self {
            Database::Postgres(pool) => pool.begin(mode, |tx| f(Transaction::Postgres(tx))).await,
            Database::Sqlite(pool) => pool.begin(mode, |tx| f(Transaction::Sqlite(tx))).await,
        }
    }

    /// Run `f` with one connection to itself, outside any transaction.
    pub async fn lock<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self {
            Database::Postgres(pool) => pool.lock(|tx| f(Transaction::Postgres(tx))).await,
            Database::Sqlite(pool) => pool.lock(|tx| f(Transaction::Sqlite(tx))).await,
        }
    }
}

impl From<PgPool> for Database {
    fn from(pool: PgPool) -> Self {
        Database::Postgres(pool)
    }
}

impl From<SqlitePool> for Database {
    fn from(pool: SqlitePool) -> Self {
        Database::Sqlite(pool)
    }
}

/// Handle passed to [`Database::begin`] and [`Database::lock`] callbacks.
#[derive(Clone, Debug)]
pub enum Transaction {
    Postgres(PgTransaction),
    Sqlite(SqliteTransaction),
}

impl Transaction {
    pub fn backend(&self) -> Backend {
        match self {
            Transaction::Postgres(_) => Backend::Postgres,
            Transaction::Sqlite(_) => Backend::Sqlite,
        }
    }

    pub fn in_transaction(&self) -> bool {
        match self {
            Transaction::Postgres(tx) => tx.in_transaction(),
            Transaction::Sqlite(tx) => tx.in_transaction(),
        }
    }

    pub async fn exec(&self, query: impl IntoQuery) -> Result<u64> {
        match self {
            Transaction::Postgres(tx) => tx.exec(query).await,
            Transaction::Sqlite(tx) => tx.exec(query).await,
        }
    }

    pub async fn execute(&self, query: impl IntoQuery) -> Result<u64> {
        match self {
            Transaction::Postgres(tx) => tx.execute(query).await,
            Transaction::Sqlite(tx) => tx.execute(query).await,
        }
    }

    pub async fn select(&self, query: impl IntoQuery) -> Result<Rows> {
        match self {
            Transaction::Postgres(tx) => tx.select(query).await,
            Transaction::Sqlite(tx) => tx.select(query).await,
        }
    }

    pub async fn select_row(&self, query: impl IntoQuery) -> Result<Option<Row>> {
        match self {
            Transaction::Postgres(tx) => tx.select_row(query).await,
            Transaction::Sqlite(tx) => tx.select_row(query).await,
        }
    }

    /// Nested transaction: a savepoint inside `begin`, a real transaction
    /// inside `lock`.
    pub async fn begin<F, Fut, T>(&self, mode: TransactionMode, f: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self {
            Transaction::Postgres(tx) => tx.begin(mode, |tx| f(Transaction::Postgres(tx))).await,
            Transaction::Sqlite(tx) => tx.begin(mode, |tx| f(Transaction::Sqlite(tx))).await,
        }
    }
}

impl Executor for Database {
    async fn exec(&self, query: impl IntoQuery + Send) -> Result<u64> {
        Database::exec(self, query).await
    }

    async fn execute(&self, query: impl IntoQuery + Send) -> Result<u64> {
        Database::execute(self, query).await
    }

    async fn select(&self, query: impl IntoQuery + Send) -> Result<Rows> {
        Database::select(self, query).await
    }

    async fn select_row(&self, query: impl IntoQuery + Send) -> Result<Option<Row>> {
        Database::select_row(self, query).await
    }
}

impl Executor for Transaction {
    async fn exec(&self, query: impl IntoQuery + Send) -> Result<u64> {
        Transaction::exec(self, query).await
    }

    async fn execute(&self, query: impl IntoQuery + Send) -> Result<u64> {
        Transaction::execute(self, query).await
    }

    async fn select(&self, query: impl IntoQuery + Send) -> Result<Rows> {
        Transaction::select(self, query).await
    }

    async fn select_row(&self, query: impl IntoQuery + Send) -> Result<Option<Row>> {
        Transaction::select_row(self, query).await
    }
}
