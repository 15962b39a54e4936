//! Embedded SQLite backend.
//!
//! This module provides the same surface as the socket driver on top of
//! rusqlite, with tokio-rusqlite moving every call onto a background thread:
//! - `connection`: open flags, pragmas, statement runner, scalar functions
//! - `pool`: one shared connection behind an async mutex
//! - `transaction`: BEGIN/COMMIT and savepoints
//! - `types`: storage class conversions and column decoders

pub mod connection;
pub mod pool;
pub mod transaction;
pub mod types;


pub use connection::SqliteConnection;
pub use pool::{SqlitePool, SqlitePoolConfig};
pub use transaction::SqliteTransaction;
pub use types::{ScalarFn, ScalarFunction};
