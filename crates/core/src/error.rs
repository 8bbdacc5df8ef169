//! Unified error types for chordcache.
//!
//! Every variant carries a stable upper-case code prefix so that callers
//! (and the MCP server) can classify failures without string matching on
//! SQLite messages.

use rmcp::model::{ErrorCode, ErrorData as McpError};
use tokio_rusqlite::rusqlite;

/// Unified error type for the cache engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening the database or applying a schema upgrade failed.
    ///
    /// Fatal: surfaced immediately and never retried.
    #[error("CONNECTION_ERROR: {0}")]
    Connection(String),

    /// Generic read/write failure inside a transaction.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// A write was rejected because the store ran out of quota.
    ///
    /// Callers may trigger an eviction run and retry once.
    #[error("QUOTA_EXCEEDED: {0}")]
    QuotaExceeded(String),

    /// A post-upgrade data transform failed.
    #[error("MIGRATION_FAILED: {0}")]
    MigrationFailed(String),

    /// Invalid input parameters.
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// The owner/document pair did not produce a usable canonical key.
    #[error("INVALID_KEY: {0}")]
    InvalidKey(String),

    /// A stored row could not be decoded into its record type.
    #[error("CORRUPT_RECORD: {0}")]
    CorruptRecord(String),
}

impl Error {
    /// Whether this error is a storage quota failure.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Error::QuotaExceeded(_))
    }
}

fn is_disk_full(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(rusqlite::ErrorCode::DiskFull)
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e.into(),
            other => Error::Database(other),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        if is_disk_full(&err) {
            return Error::QuotaExceeded(err.to_string());
        }
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::CorruptRecord(err.to_string())
    }
}

impl From<Error> for McpError {
    fn from(err: Error) -> Self {
        let (code, message) = match &err {
            Error::InvalidInput(msg) => (-32602, msg.clone()),
            Error::InvalidKey(msg) => (-32602, msg.clone()),
            Error::Connection(msg) => (-32020, msg.clone()),
            Error::Database(e) => (-32021, e.to_string()),
            Error::QuotaExceeded(msg) => (-32022, msg.clone()),
            Error::MigrationFailed(msg) => (-32023, msg.clone()),
            Error::CorruptRecord(msg) => (-32024, msg.clone()),
        };

        McpError { code: ErrorCode(code), message: message.into(), data: None }
    }
}
