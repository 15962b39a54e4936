//! SQLite "pool": one shared connection serialized by an async mutex.
//!
//! SQLite allows a single writer, so the pool hands out the same connection
//! to every caller. Shared requests take the mutex for one statement;
//! `begin`/`lock` hold it for the whole callback, which gives the callback
//! exclusive use of the connection just like a leased socket connection.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::connection::{Expect, QueryResult, SqliteConnection};
use super::transaction::{self, SqliteTransaction};
use super::types::ScalarFunction;
use crate::config::{Backend, DatabaseUrl};
use crate::error::{Error, Result};
use crate::executor::{Executor, TransactionMode};
use crate::pg::PoolStatus;
use crate::sql::{IntoQuery, Query};
use crate::types::TypeRegistry;
use crate::value::{Row, Rows};

/// Lease token of shared (non-transactional) use.
pub(crate) const SHARED: u64 = 0;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct SqlitePoolConfig {
    pub url: DatabaseUrl,
    pub registry: Arc<TypeRegistry>,
    pub functions: Vec<ScalarFunction>,
}

impl SqlitePoolConfig {
    /// `path` is a file path or `:memory:`.
    pub fn new(path: &str) -> Result<Self> {
        Self::from_url(&DatabaseUrl::parse(&format!("sqlite:{}", path))?)
    }

    pub fn from_url(url: &DatabaseUrl) -> Result<Self> {
        if url.backend != Backend::Sqlite {
            return Err(Error::Config(format!("Not an sqlite URL: {}", url)));
        }
        Ok(Self {
            url: url.clone(),
            registry: Arc::new(TypeRegistry::with_builtins()),
            functions: Vec::new(),
        })
    }

    pub fn registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn function(mut self, function: ScalarFunction) -> Self {
        self.functions.push(function);
        self
    }
}

pub(crate) struct PoolInner {
    pub conn: SqliteConnection,
    gate: Arc<Mutex<()>>,
    /// Token of the `begin`/`lock` call holding the gate, `SHARED` otherwise.
    pub lease: AtomicU64,
    next_lease: AtomicU64,
    closed: AtomicBool,
}

impl PoolInner {
    pub fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Destroyed("Pool closed".to_string()))
        } else {
            Ok(())
        }
    }
}

/// SQLite connection pool.
#[derive(Clone)]
pub struct SqlitePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SqlitePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePool").field("status", &self.status()).finish()
    }
}

impl SqlitePool {
    /// Open the database and install the configured functions.
    pub async fn connect(config: SqlitePoolConfig) -> Result<Self> {
        let conn = SqliteConnection::open(&config.url, config.registry).await?;
        for function in config.functions {
            conn.register_function(function).await?;
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                conn,
                gate: Arc::new(Mutex::new(())),
                lease: AtomicU64::new(SHARED),
                next_lease: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub async fn from_url(url: &str) -> Result<Self> {
        Self::connect(SqlitePoolConfig::from_url(&DatabaseUrl::parse(url)?)?).await
    }

    pub fn registry(&self) -> &TypeRegistry {
        self.inner.conn.registry()
    }

    /// One connection: idle, busy inside `begin`/`lock`, or free once closed.
    pub fn status(&self) -> PoolStatus {
        let closed = self.inner.closed.load(Ordering::Acquire);
        let busy = !closed && self.inner.lease.load(Ordering::Acquire) != SHARED;
        PoolStatus {
            max: 1,
            idle: usize::from(!closed && !busy),
            busy: usize::from(busy),
            free: usize::from(closed),
        }
    }

    /// Install a scalar function on the shared connection.
    pub async fn register_function(&self, function: ScalarFunction) -> Result<()> {
        self.inner.check_open()?;
        self.inner.conn.register_function(function).await
    }

    /// Refuse new work, wait for the current holder and close the database.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let _guard = self.inner.gate.lock().await;
        if let Err(e) = self.inner.conn.close().await {
            warn!(error = %e, "closing sqlite database failed");
        }
        debug!("sqlite pool closed");
    }

    async fn request(&self, query: Query, expect: Expect, max_rows: usize) -> Result<QueryResult> {
        self.inner.check_open()?;
        let _guard = self.inner.gate.lock().await;
        self.inner.check_open()?;
        self.inner.conn.run(query, expect, max_rows).await
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

    /// Run `f` inside a transaction with exclusive use of the connection.
    pub async fn begin<F, Fut, T>(&self, mode: TransactionMode, f: F) -> Result<T>
    where
        F: FnOnce(SqliteTransaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.lease().await?;
        let tx = SqliteTransaction::new(Arc::clone(&self.inner), lease.token, false);
        let result = transaction::run(&tx, mode, f).await;
        lease.finish().await;
        result
    }

    /// Run `f` with exclusive use of the connection, without a transaction.
    pub async fn lock<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(SqliteTransaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.lease().await?;
        let result = f(SqliteTransaction::new(Arc::clone(&self.inner), lease.token, false)).await;
        lease.finish().await;
        result
    }

    async fn lease(&self) -> Result<Lease> {
        self.inner.check_open()?;
        let guard = Arc::clone(&self.inner.gate).lock_owned().await;
        self.inner.check_open()?;
        let token = self.inner.next_lease.fetch_add(1, Ordering::Relaxed);
        self.inner.lease.store(token, Ordering::Release);
        Ok(Lease {
            pool: Arc::clone(&self.inner),
            guard: Some(guard),
            token,
            finished: false,
        })
    }
}

/// Exclusive hold on the connection for one `begin`/`lock` call.
///
/// Dropped without [`Lease::finish`] (panic, cancelled future), it rolls back
/// any open transaction in a background task that keeps the gate until done.
struct Lease {
    pool: Arc<PoolInner>,
    guard: Option<OwnedMutexGuard<()>>,
    token: u64,
    finished: bool,
}

impl Lease {
    async fn finish(mut self) {
        self.finished = true;
        self.pool.lease.store(SHARED, Ordering::Release);
        if let Ok(false) = self.pool.conn.is_autocommit().await {
            warn!(lease = self.token, "released inside a transaction, rolling back");
            rollback_open(&self.pool).await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.lease.store(SHARED, Ordering::Release);
        let Some(guard) = self.guard.take() else {
            return;
        };
        if self.finished {
            return;
        }
        let pool = Arc::clone(&self.pool);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _guard = guard;
                rollback_open(&pool).await;
            });
        }
    }
}

async fn rollback_open(pool: &PoolInner) {
    if !matches!(pool.conn.is_autocommit().await, Ok(false)) {
        return;
    }
    if let Err(e) = pool.conn.run(Query::new("ROLLBACK"), Expect::Any, 0).await {
        warn!(error = %e, "rollback of abandoned transaction failed");
    }
}

impl Executor for SqlitePool {
    async fn exec(&self, query: impl IntoQuery + Send) -> Result<u64> {
        SqlitePool::exec(self, query).await
    }

    async fn execute(&self, query: impl IntoQuery + Send) -> Result<u64> {
        SqlitePool::execute(self, query).await
    }

    async fn select(&self, query: impl IntoQuery + Send) -> Result<Rows> {
        SqlitePool::select(self, query).await
    }

    async fn select_row(&self, query: impl IntoQuery + Send) -> Result<Option<Row>> {
        SqlitePool::select_row(self, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_follows_lease() {
        let pool = SqlitePool::connect(SqlitePoolConfig::new(":memory:").unwrap())
            .await
            .unwrap();
        assert_eq!(
            pool.status(),
            PoolStatus {
                max: 1,
                idle: 1,
                busy: 0,
                free: 0
            }
        );

        let inner = pool.clone();
        pool.lock(|_tx| async move {
            assert_eq!(inner.status().busy, 1);
            Ok::<_, Error>(())
        })
        .await
        .unwrap();
        assert_eq!(pool.status().idle, 1);

        pool.close().await;
        assert_eq!(pool.status().free, 1);
        assert!(matches!(pool.exec("SELECT 1").await, Err(Error::Destroyed(_))));
    }

    #[test]
    fn test_config_rejects_other_backends() {
        let url = DatabaseUrl::parse("pgsql://localhost/app").unwrap();
        assert!(matches!(SqlitePoolConfig::from_url(&url), Err(Error::Config(_))));
    }
}
