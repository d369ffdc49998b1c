// botsift/src/error.rs
//
// Typed error model. Every failure falls into one of four classes and the
// class decides what the call site does with it:
//
//   Transient  : storage contention / dropped connection → retry the operation
//   Malformed  : one unusable input record              → discard it, log, continue
//   Unavailable: scorer, learner or cache unreachable   → skip classification this cycle
//   Invariant  : corrupt or impossible per-key state    → abort this key's cycle, log

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Malformed,
    Unavailable,
    Invariant,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient   => "transient",
            Self::Malformed   => "malformed",
            Self::Unavailable => "unavailable",
            Self::Invariant   => "invariant",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("{service} unavailable: {reason}")]
    Unavailable { service: &'static str, reason: String },

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("invariant violated for {key}: {detail}")]
    Invariant { key: String, detail: String },

    #[error("state encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn unavailable(service: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Unavailable { service, reason: reason.to_string() }
    }

    pub fn invariant(key: impl std::fmt::Display, detail: impl Into<String>) -> Self {
        Self::Invariant { key: key.to_string(), detail: detail.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(e) if is_transient_sqlite(e) => ErrorKind::Transient,
            // Any other storage failure on a single key's transaction is
            // treated as that key's problem, not the pool's.
            Self::Storage(_)        => ErrorKind::Invariant,
            Self::Malformed(_)      => ErrorKind::Malformed,
            Self::Unavailable { .. } | Self::Cache(_) => ErrorKind::Unavailable,
            Self::Invariant { .. }  => ErrorKind::Invariant,
            Self::Encoding(_)       => ErrorKind::Invariant,
            Self::Join(_)           => ErrorKind::Invariant,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Busy/locked databases and OS-level I/O failures clear up on retry.
pub(crate) fn is_transient_sqlite(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => matches!(
            err.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
        ),
        _ => false,
    }
}

/// Subset of transient failures after which the connection is reopened.
pub(crate) fn needs_reconnect(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => {
            matches!(err.code, ErrorCode::SystemIoFailure | ErrorCode::CannotOpen)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn busy_database_is_transient() {
        let e = EngineError::from(sqlite_failure(rusqlite::ffi::SQLITE_BUSY));
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(e.is_transient());
    }

    #[test]
    fn constraint_failure_is_not_retried() {
        let e = EngineError::from(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT));
        assert_eq!(e.kind(), ErrorKind::Invariant);
    }

    #[test]
    fn io_failure_reconnects() {
        assert!(needs_reconnect(&sqlite_failure(rusqlite::ffi::SQLITE_IOERR)));
        assert!(!needs_reconnect(&sqlite_failure(rusqlite::ffi::SQLITE_BUSY)));
    }

    #[test]
    fn classes_map_to_taxonomy() {
        assert_eq!(EngineError::Malformed("x".into()).kind(), ErrorKind::Malformed);
        assert_eq!(EngineError::unavailable("scorer", "refused").kind(), ErrorKind::Unavailable);
        assert_eq!(EngineError::invariant("h/1.2.3.4", "bad").kind(), ErrorKind::Invariant);
    }
}
