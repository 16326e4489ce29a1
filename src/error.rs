//! Crate-wide error taxonomy.
//!
//! One enum covers the `Core` domain kinds plus `#[from]` wrapping for the
//! underlying SQLite, I/O, and WebSocket errors, so every public entry point
//! can return a single `Result<T, Error>`.

use std::path::PathBuf;

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database is not open")]
    NotOpen,

    #[error("database is not writeable")]
    NotWriteable,

    #[error("could not open file: {0}")]
    CantOpenFile(PathBuf),

    #[error("not a database file (wrong key, or not a recognized schema): {0}")]
    NotADatabaseFile(PathBuf),

    #[error("key-store '{0}' does not have sequences enabled")]
    NotSequenced(String),

    #[error("record not found")]
    NotFound,

    #[error("conflicting update")]
    Conflict,

    #[error("corrupt revision tree data: {0}")]
    CorruptRevisionData(&'static str),

    #[error("corrupt index data: {0}")]
    CorruptIndexData(String),

    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),

    #[error("transaction not closed before this operation")]
    TransactionNotClosed,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unexpected internal error: {0}")]
    Unexpected(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("replication timed out")]
    Timeout,

    #[error("a compaction is already running on this database")]
    CompactionInProgress,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The coarse domain an [`Error`] belongs to, for building the outward
/// `{domain, code, message}` triple public callers rely on (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Core,
    Posix,
    Network,
    WebSocket,
}

impl Error {
    /// The domain this error is reported under.
    pub fn domain(&self) -> Domain {
        match self {
            Error::Io(_) => Domain::Posix,
            Error::Network(_) | Error::Timeout => Domain::Network,
            Error::WebSocket(_) => Domain::WebSocket,
            _ => Domain::Core,
        }
    }

    /// A short, stable code identifying the error kind within its domain.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotOpen => "NotOpen",
            Error::NotWriteable => "NotWriteable",
            Error::CantOpenFile(_) => "CantOpenFile",
            Error::NotADatabaseFile(_) => "NotADatabaseFile",
            Error::NotSequenced(_) => "NotSequenced",
            Error::NotFound => "NotFound",
            Error::Conflict => "Conflict",
            Error::CorruptRevisionData(_) => "CorruptRevisionData",
            Error::CorruptIndexData(_) => "CorruptIndexData",
            Error::Unimplemented(_) => "Unimplemented",
            Error::TransactionNotClosed => "TransactionNotClosed",
            Error::InvalidParameter(_) => "InvalidParameter",
            Error::Unexpected(_) => "Unexpected",
            Error::Sqlite(_) => "Sqlite",
            Error::Io(_) => "Io",
            Error::WebSocket(_) => "WebSocket",
            Error::Network(_) => "Network",
            Error::Timeout => "Timeout",
            Error::CompactionInProgress => "CompactionInProgress",
        }
    }
}
