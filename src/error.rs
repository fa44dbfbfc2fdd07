use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// SQLite, connection or schema migration failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Transport failure, timeout, 5xx, 429 or 408. Retried with backoff.
    #[error("Network error: {0}")]
    Network(String),

    /// The server refused the request (4xx other than 401/403/408/429).
    #[error("Rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// 401/403. Needs re-authentication, never counted against retries.
    #[error("Authentication required (HTTP {status})")]
    Auth { status: u16 },

    /// The entity no longer exists on the server.
    #[error("Remote conflict: {0}")]
    Conflict(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a failed remote call should be retried under the backoff policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Storage(format!("migration failed: {e}"))
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidPayload(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(format!("invalid URL: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_retryable() {
        assert!(Error::Network("timeout".into()).is_retryable());
        assert!(!Error::Auth { status: 401 }.is_retryable());
        assert!(!Error::Rejected {
            status: 422,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!Error::Conflict("gone".into()).is_retryable());
        assert!(!Error::Storage("disk".into()).is_retryable());
    }

    #[test]
    fn test_migration_failure_is_a_storage_error() {
        let err = Error::from(rusqlite_migration::Error::from(rusqlite::Error::InvalidQuery));
        match err {
            Error::Storage(msg) => assert!(msg.starts_with("migration failed")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
