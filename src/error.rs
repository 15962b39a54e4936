//! Error types for dbkit.
//!
//! Every public entry point returns [`Result`]. The variants split into two
//! families that callers usually care about:
//!
//! - *exceptions* ([`Error::is_exception`]): the connection or driver failed
//!   (socket closed, protocol desync, authentication failure). The statement
//!   may or may not have reached the server.
//! - *statement failures*: the server (or the caller) rejected one request and
//!   the connection is still usable.

use thiserror::Error;

use crate::pg::error::ServerError;

#[derive(Error, Debug)]
pub enum Error {
    /// The server rejected a statement (constraint violation, syntax error, ...).
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The connection was destroyed before the request completed.
    #[error("Connection destroyed: {0}")]
    Destroyed(String),

    /// The byte stream could not be interpreted; the connection is unusable.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The authentication handshake failed or used an unsupported method.
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),

    /// A value could not be encoded or decoded.
    #[error("Type error: {0}")]
    Type(String),

    /// The API was used in a way that can never succeed (wrong parameter
    /// count, `select` on a statement without rows, stale transaction handle).
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A failure produced by the caller, typically to abort a transaction.
    #[error("{reason} (status {status})")]
    Status { status: u16, reason: String },
}

impl Error {
    /// Build a caller-side failure carrying an explicit status.
    pub fn status_code(status: u16, reason: impl Into<String>) -> Self {
        Error::Status {
            status,
            reason: reason.into(),
        }
    }

    /// Status code of the uniform result contract.
    pub fn status(&self) -> u16 {
        match self {
            Error::Status { status, .. } => *status,
            Error::Usage(_) | Error::Config(_) | Error::Type(_) => 400,
            Error::Auth(_) => 401,
            Error::Server(_)
            | Error::Destroyed(_)
            | Error::Protocol(_)
            | Error::Io(_)
            | Error::Sqlite(_) => 500,
        }
    }

    /// `true` when the failure came from the driver or the connection rather
    /// than from one statement.
    pub fn is_exception(&self) -> bool {
        match self {
            Error::Destroyed(_) | Error::Protocol(_) | Error::Auth(_) | Error::Io(_) => true,
            Error::Sqlite(e) => !matches!(e, tokio_rusqlite::Error::Rusqlite(_)),
            Error::Server(_)
            | Error::Type(_)
            | Error::Usage(_)
            | Error::Config(_)
            | Error::Status { .. } => false,
        }
    }

    /// SQLSTATE code for server-reported failures.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Server(e) => Some(e.code.as_str()),
            _ => None,
        }
    }

    /// Human readable reason, without the variant prefix.
    pub fn reason(&self) -> String {
        match self {
            Error::Server(e) => e.message.clone(),
            Error::Status { reason, .. } => reason.clone(),
            Error::Destroyed(m)
            | Error::Protocol(m)
            | Error::Auth(m)
            | Error::Type(m)
            | Error::Usage(m)
            | Error::Config(m) => m.clone(),
            Error::Io(e) => e.to_string(),
            Error::Sqlite(e) => e.to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Sqlite(tokio_rusqlite::Error::Rusqlite(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::status_code(500, "boom").status(), 500);
        assert_eq!(Error::Usage("x".into()).status(), 400);
        assert_eq!(Error::Destroyed("gone".into()).status(), 500);
    }

    #[test]
    fn test_exception_flag() {
        assert!(Error::Destroyed("gone".into()).is_exception());
        assert!(Error::Protocol("bad tag".into()).is_exception());
        assert!(!Error::status_code(409, "conflict").is_exception());
        assert!(!Error::Usage("count".into()).is_exception());

        let server = ServerError {
            severity: "ERROR".into(),
            code: "23505".into(),
            message: "duplicate key".into(),
            ..ServerError::default()
        };
        let err = Error::from(server);
        assert!(!err.is_exception());
        assert_eq!(err.code(), Some("23505"));
        assert_eq!(err.reason(), "duplicate key");
    }
}
