//! PostgreSQL wire protocol driver.
//!
//! This module provides a pipelined PostgreSQL client that:
//! - Speaks protocol v3 directly over TCP, Unix sockets or any async stream
//! - Authenticates with cleartext, MD5 or SCRAM-SHA-256
//! - Pipelines requests from many callers over one socket
//! - Caches server-side prepared statements per connection
//! - Pools connections with exclusive leases for transactions
//! - Mirrors LISTEN state on a dedicated connection
//!
//! Architecture:
//! - `codec`: Frame writer, frame splitter and field cursor
//! - `protocol`: Message encoders and backend message decoding
//! - `auth` / `scram`: Startup authentication state machine
//! - `statement`: In-flight statement handles and prepared columns
//! - `connection`: Driver task and the connection handle
//! - `pool`: Slot pool with shared and exclusive acquisition
//! - `transaction`: BEGIN/COMMIT and savepoints
//! - `notify`: LISTEN/NOTIFY subscriptions

pub mod auth;
pub mod codec;
pub mod connection;
pub mod error;
pub mod notify;
pub mod pool;
pub mod protocol;
pub mod scram;
pub(crate) mod statement;
pub mod transaction;


pub use connection::{BoxStream, Connect, ConnectFuture, Connection, SocketConnector};
pub use error::ServerError;
pub use notify::{Event, Notification, Notifications, Subscription};
pub use pool::{PgPool, PgPoolConfig, PoolStatus};
pub use protocol::TransactionStatus;
pub use transaction::PgTransaction;
