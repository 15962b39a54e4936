//! PostgreSQL connection pool.
//!
//! Fixed number of slots. Each slot is free (no connection yet), idle (in the
//! idle list, shared by any number of pipelined callers) or busy (leased to
//! one transaction or `lock` callback). `free + idle + busy == max` holds
//! whenever the slot lock is released.
//!
//! Shared requests borrow an idle connection and leave it in the idle list:
//! the request is queued on the connection while the slot lock is held, so a
//! transaction can never lease a connection between the choice and the send.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use super::connection::{
    Connect, Connection, ConnectionHooks, DestroyHook, SocketConnector, SHARED,
};
use super::notify::Notifications;
use super::protocol::TransactionStatus;
use super::statement::{ExecOptions, StatementResult};
use super::transaction::{self, PgTransaction};
use crate::config::{DatabaseUrl, PgConfig, DEFAULT_MAX_CONNECTIONS};
use crate::error::{Error, Result};
use crate::executor::{Executor, TransactionMode};
use crate::sql::{IntoQuery, Query};
use crate::types::TypeRegistry;
use crate::value::{Row, Rows};

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Clone)]
pub struct PgPoolConfig {
    pub connection: PgConfig,
    /// Slot count, fixed for the pool's lifetime.
    pub max_connections: usize,
    pub registry: Arc<TypeRegistry>,
    connector: Option<Arc<dyn Connect>>,
}

impl PgPoolConfig {
    pub fn new(connection: PgConfig) -> Self {
        Self {
            connection,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            registry: Arc::new(TypeRegistry::with_builtins()),
            connector: None,
        }
    }

    pub fn from_url(url: &DatabaseUrl) -> Result<Self> {
        Ok(Self::new(PgConfig::from_url(url)?).max_connections(url.max_connections))
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Use a custom type registry.
    pub fn registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Open streams with a custom connector instead of TCP/Unix sockets.
    pub fn connector(mut self, connector: Arc<dyn Connect>) -> Self {
        self.connector = Some(connector);
        self
    }
}

/// Snapshot of slot usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max: usize,
    pub idle: usize,
    pub busy: usize,
    pub free: usize,
}

// ============================================================================
// Pool
// ============================================================================

struct Slots {
    free: usize,
    idle: VecDeque<Connection>,
    /// Busy connections by connection id.
    leased: HashMap<u64, Connection>,
    closed: bool,
}

pub(crate) struct PoolShared {
    config: Arc<PgConfig>,
    registry: Arc<TypeRegistry>,
    connector: Arc<dyn Connect>,
    max: usize,
    slots: Mutex<Slots>,
    available: Notify,
    next_lease: AtomicU64,
    notifications: OnceLock<Notifications>,
}

/// Pipelined connection pool.
#[derive(Clone)]
pub struct PgPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPool").field("status", &self.status()).finish()
    }
}

impl PgPool {
    /// Create a pool. Connections are opened lazily, on first use of a slot.
    pub fn new(config: PgPoolConfig) -> Self {
        let connector = config
            .connector
            .unwrap_or_else(|| Arc::new(SocketConnector::new(config.connection.address.clone())));
        let max = config.max_connections.max(1);

        Self {
            shared: Arc::new(PoolShared {
                config: Arc::new(config.connection),
                registry: config.registry,
                connector,
                max,
                slots: Mutex::new(Slots {
                    free: max,
                    idle: VecDeque::new(),
                    leased: HashMap::new(),
                    closed: false,
                }),
                available: Notify::new(),
                next_lease: AtomicU64::new(1),
                notifications: OnceLock::new(),
            }),
        }
    }

    /// Parse `url` and create a pool with the built-in types.
    pub fn from_url(url: &str) -> Result<Self> {
        let url = DatabaseUrl::parse(url)?;
        Ok(Self::new(PgPoolConfig::from_url(&url)?))
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.shared.registry
    }

    pub fn status(&self) -> PoolStatus {
        let slots = self.shared.slots.lock();
        PoolStatus {
            max: self.shared.max,
            idle: slots.idle.len(),
            busy: slots.leased.len(),
            free: slots.free,
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_connections(&self) -> Vec<Connection> {
        self.shared.slots.lock().idle.iter().cloned().collect()
    }

    /// Refuse new work and terminate idle connections and the notification
    /// connection. Leased connections are terminated when their holder
    /// releases them.
    pub fn close(&self) {
        let idle: Vec<Connection> = {
            let mut slots = self.shared.slots.lock();
            slots.closed = true;
            slots.idle.iter().cloned().collect()
        };
        debug!(idle = idle.len(), "closing pool");
        for conn in idle {
            conn.destroy("Pool closed");
        }
        if let Some(notifications) = self.shared.notifications.get() {
            notifications.close();
        }
        self.shared.available.notify_waiters();
    }

    /// LISTEN/NOTIFY manager running on its own dedicated connection.
    pub fn notifications(&self) -> Notifications {
        self.shared
            .notifications
            .get_or_init(|| {
                Notifications::new(
                    Arc::clone(&self.shared.config),
                    Arc::clone(&self.shared.registry),
                    Arc::clone(&self.shared.connector),
                )
            })
            .clone()
    }

    // ========================================================================
    // Shared requests
    // ========================================================================

    async fn request(&self, query: Query, opts: ExecOptions) -> Result<StatementResult> {
        let rx = self.shared.dispatch(query, opts).await?;
        rx.await
            .map_err(|_| Error::Destroyed("Connection closed".to_string()))?
    }

    /// Run statements and discard rows. Returns the last statement's row count.
    pub async fn exec(&self, query: impl IntoQuery) -> Result<u64> {
        Ok(self.request(query.into_query(), ExecOptions::exec()).await?.count)
    }

    /// Run one statement that returns no rows, returning the affected count.
    pub async fn execute(&self, query: impl IntoQuery) -> Result<u64> {
        Ok(self.request(query.into_query(), ExecOptions::execute()).await?.count)
    }

    pub async fn select(&self, query: impl IntoQuery) -> Result<Rows> {
        let result = self.request(query.into_query(), ExecOptions::select()).await?;
        Ok(Rows::new(result.rows, result.count))
    }

    /// First row only; the server is asked for at most one.
    pub async fn select_row(&self, query: impl IntoQuery) -> Result<Option<Row>> {
        let result = self.request(query.into_query(), ExecOptions::select_row()).await?;
        Ok(result.rows.into_iter().next())
    }

    // ========================================================================
    // Exclusive use
    // ========================================================================

    /// Run `f` inside BEGIN/COMMIT on an exclusively held connection.
    ///
    /// `Ok` commits, `Err` rolls back and is returned. A failing COMMIT
    /// becomes the result even though `f` succeeded.
    pub async fn begin<F, Fut, T>(&self, mode: TransactionMode, f: F) -> Result<T>
    where
        F: FnOnce(PgTransaction) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let lease = self.shared.lease().await?;
        let tx = PgTransaction::new(lease.conn.clone(), lease.token, false);
        let result = transaction::run(&tx, mode, f).await;
        lease.finish();
        result
    }

    /// Hold a connection exclusively without a transaction around `f`.
    pub async fn lock<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(PgTransaction) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let lease = self.shared.lease().await?;
        let tx = PgTransaction::new(lease.conn.clone(), lease.token, false);
        let result = f(tx).await;
        lease.finish();
        result
    }
}

impl PoolShared {
    fn spawn_connection(self: &Arc<Self>) -> Connection {
        let pool = Arc::downgrade(self);
        let on_destroy: DestroyHook = Box::new(move |id: u64, reason: &str| {
            if let Some(pool) = pool.upgrade() {
                pool.on_destroy(id, reason);
            }
        });
        let hooks = ConnectionHooks {
            on_destroy: Some(on_destroy),
            on_notification: None,
        };
        let conn = Connection::spawn(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.connector),
            hooks,
        );
        debug!(connection = conn.id(), "opened pool connection");
        conn
    }

    /// A destroyed connection gives its slot back.
    fn on_destroy(&self, id: u64, reason: &str) {
        let mut slots = self.slots.lock();
        slots.idle.retain(|c| c.id() != id);
        slots.leased.remove(&id);
        slots.free += 1;
        debug!(connection = id, reason, free = slots.free, "slot freed");
        drop(slots);
        self.available.notify_one();
    }

    /// Queue a shared request on a free-slot or idle connection.
    async fn dispatch(
        self: &Arc<Self>,
        query: Query,
        opts: ExecOptions,
    ) -> Result<oneshot::Receiver<Result<StatementResult>>> {
        let mut query = Some(query);
        let mut waited = false;

        loop {
            let notified = self.available.notified();
            {
                let mut slots = self.slots.lock();
                if slots.closed {
                    return Err(Error::Destroyed("Pool closed".to_string()));
                }

                let conn = if slots.free > 0 {
                    slots.free -= 1;
                    let conn = self.spawn_connection();
                    slots.idle.push_back(conn.clone());
                    Some(conn)
                } else {
                    // Rotate so pipelined load spreads over idle connections
                    let live = slots.idle.iter().position(|c| !c.is_destroyed());
                    live.and_then(|i| slots.idle.remove(i)).map(|conn| {
                        slots.idle.push_back(conn.clone());
                        conn
                    })
                };

                if let Some(conn) = conn {
                    let query = query
                        .take()
                        .ok_or_else(|| Error::Usage("Request dispatched twice".to_string()))?;
                    let rx = conn.submit(query, opts, SHARED)?;
                    let more = !slots.idle.is_empty();
                    drop(slots);
                    // Pass the wakeup on, the connection is still available
                    if waited && more {
                        self.available.notify_one();
                    }
                    return Ok(rx);
                }
            }
            notified.await;
            waited = true;
        }
    }

    /// Exclusively lease a connection for a transaction or `lock`.
    async fn lease(self: &Arc<Self>) -> Result<Lease> {
        loop {
            let notified = self.available.notified();
            {
                let mut slots = self.slots.lock();
                if slots.closed {
                    return Err(Error::Destroyed("Pool closed".to_string()));
                }

                let conn = if slots.free > 0 {
                    slots.free -= 1;
                    Some(self.spawn_connection())
                } else {
                    let live = slots.idle.iter().position(|c| !c.is_destroyed());
                    live.and_then(|i| slots.idle.remove(i))
                };

                if let Some(conn) = conn {
                    let token = self.next_lease.fetch_add(1, Ordering::Relaxed);
                    if !conn.acquire_lease(token) {
                        // A connection in the idle list is never leased
                        slots.idle.push_back(conn);
                        return Err(Error::Protocol("Idle connection already leased".to_string()));
                    }
                    slots.leased.insert(conn.id(), conn.clone());
                    return Ok(Lease {
                        pool: Arc::clone(self),
                        conn,
                        token,
                        finished: false,
                    });
                }
            }
            notified.await;
        }
    }

    /// Return a leased connection to shared use.
    fn release(&self, conn: &Connection, token: u64, finished: bool) {
        let mut slots = self.slots.lock();
        conn.release_lease(token);

        if conn.is_destroyed() {
            // The destroy handler owns the slot accounting
            return;
        }

        let status = conn.transaction_status();
        if !finished || status != TransactionStatus::Idle || slots.closed {
            if status != TransactionStatus::Idle {
                warn!(
                    connection = conn.id(),
                    ?status,
                    "connection released inside a transaction, destroying"
                );
            }
            // Stays in `leased` until the destroy handler frees the slot
            drop(slots);
            conn.destroy(if finished {
                "Released inside a transaction"
            } else {
                "Released while a request was in flight"
            });
            return;
        }

        slots.leased.remove(&conn.id());
        slots.idle.push_front(conn.clone());
        drop(slots);
        self.available.notify_one();
    }
}

/// Exclusive hold on one connection, returned to the pool on drop.
///
/// Dropping without [`Lease::finish`] (panic, cancelled future) destroys the
/// connection, since requests may still be queued on it.
pub(crate) struct Lease {
    pool: Arc<PoolShared>,
    pub conn: Connection,
    pub token: u64,
    finished: bool,
}

impl Lease {
    pub fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.release(&self.conn, self.token, self.finished);
    }
}

impl Executor for PgPool {
    async fn exec(&self, query: impl IntoQuery + Send) -> Result<u64> {
        PgPool::exec(self, query).await
    }

    async fn execute(&self, query: impl IntoQuery + Send) -> Result<u64> {
        PgPool::execute(self, query).await
    }

    async fn select(&self, query: impl IntoQuery + Send) -> Result<Rows> {
        PgPool::select(self, query).await
    }

    async fn select_row(&self, query: impl IntoQuery + Send) -> Result<Option<Row>> {
        PgPool::select_row(self, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let url = DatabaseUrl::parse("pgsql://u@h/d?maxConnections=3").unwrap();
        let config = PgPoolConfig::from_url(&url).unwrap();
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.max_connections(0).max_connections, 1);
    }

    #[tokio::test]
    async fn test_new_pool_is_all_free() {
        let pool = PgPool::from_url("pgsql://u@localhost/d?maxConnections=4").unwrap();
        assert_eq!(
            pool.status(),
            PoolStatus {
                max: 4,
                idle: 0,
                busy: 0,
                free: 4
            }
        );
        pool.close();
        assert!(matches!(
            pool.execute("SELECT 1").await,
            Err(Error::Destroyed(_))
        ));
    }
}
