//! Query surface shared by pools, transactions and the [`Database`] front
//! door.
//!
//! [`Database`]: crate::Database

use std::future::Future;

use crate::error::Result;
use crate::sql::IntoQuery;
use crate::value::{Row, Rows};

/// Anything statements can be run against.
///
/// All four methods take a [`Query`](crate::Query), a `&str`/`String`, or a
/// `(text, params)` pair. Row-shape mismatches (`execute` on a `SELECT`,
/// `select` on an `UPDATE`) are [`Error::Usage`](crate::Error::Usage).
pub trait Executor: Send + Sync {
    /// Run one or more statements, discarding rows. Returns the row count of
    /// the last statement.
    fn exec(&self, query: impl IntoQuery + Send) -> impl Future<Output = Result<u64>> + Send;

    /// Run a statement that returns no rows; returns the affected count.
    fn execute(&self, query: impl IntoQuery + Send) -> impl Future<Output = Result<u64>> + Send;

    fn select(&self, query: impl IntoQuery + Send) -> impl Future<Output = Result<Rows>> + Send;

    /// First row, or `None` when the statement matched nothing.
    fn select_row(
        &self,
        query: impl IntoQuery + Send,
    ) -> impl Future<Output = Result<Option<Row>>> + Send;
}

/// How `begin` opens a transaction.
///
/// Isolation modes apply to PostgreSQL, locking modes to SQLite; each
/// backend falls back to its plain `BEGIN` for modes it has no syntax for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionMode {
    #[default]
    Default,
    ReadOnly,
    RepeatableRead,
    Serializable,
    /// SQLite: take the write lock at BEGIN.
    Immediate,
    /// SQLite: take an exclusive lock at BEGIN.
    Exclusive,
}

impl TransactionMode {
    pub fn postgres_begin(self) -> &'static str {
        match self {
            TransactionMode::ReadOnly => "BEGIN READ ONLY",
            TransactionMode::RepeatableRead => "BEGIN ISOLATION LEVEL REPEATABLE READ",
            TransactionMode::Serializable => "BEGIN ISOLATION LEVEL SERIALIZABLE",
            TransactionMode::Default | TransactionMode::Immediate | TransactionMode::Exclusive => {
                "BEGIN"
            }
        }
    }

    pub fn sqlite_begin(self) -> &'static str {
        match self {
            TransactionMode::Immediate => "BEGIN IMMEDIATE",
            TransactionMode::Exclusive => "BEGIN EXCLUSIVE",
            _ => "BEGIN DEFERRED",
        }
    }
}

/// Savepoint name unique for the process lifetime, time-ordered.
pub(crate) fn savepoint_name() -> String {
    format!("sp_{}", uuid::Uuid::now_v7().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_syntax() {
        assert_eq!(TransactionMode::Default.postgres_begin(), "BEGIN");
        assert_eq!(
            TransactionMode::Serializable.postgres_begin(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE"
        );
        assert_eq!(TransactionMode::Immediate.postgres_begin(), "BEGIN");
        assert_eq!(TransactionMode::Default.sqlite_begin(), "BEGIN DEFERRED");
        assert_eq!(TransactionMode::Exclusive.sqlite_begin(), "BEGIN EXCLUSIVE");
    }

    #[test]
    fn test_savepoint_names_are_unique() {
        let a = savepoint_name();
        let b = savepoint_name();
        assert_ne!(a, b);
        assert!(a.starts_with("sp_"));
        assert_eq!(a.len(), 3 + 32);
    }
}
