use std::io;

/// Errors surfaced at the service boundary.
///
/// Callers dispatch on the variant, not the message: `Transient` is the only
/// kind worth retrying, `Provider` carries a definite negative answer from a
/// backend, and `Internal` means an invariant broke and the full detail went
/// to the log.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The caller violated a contract (missing id, non-absolute path,
    /// forbidden command, file too large). Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The store or a provider reports the entity is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection refused, timeout, DNS failure, SSH exit 255, 5xx from a
    /// provider API. Safe to retry with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// The provider returned a definite negative answer (task failed, 4xx).
    #[error("provider: {0}")]
    Provider(String),

    /// Invariant violation, unexpected I/O failure, marshalling error.
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Error::Provider(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True for errors a caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// True when a destroy-style flow should treat this error as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(e.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::ConnectionRefused => {
                Error::Transient(e.to_string())
            }
            _ => Error::Internal(format!("io: {e}")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("json: {e}"))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound("no such row".into()),
            other => Error::Internal(format!("sqlite: {other}")),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Error::Transient(e.to_string())
        } else if let Some(status) = e.status() {
            if status.is_server_error() {
                Error::Transient(e.to_string())
            } else {
                Error::Provider(e.to_string())
            }
        } else {
            Error::Transient(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(Error::transient("connection refused").is_transient());
        assert!(!Error::provider("task failed").is_transient());
        assert!(!Error::invalid_input("bad id").is_transient());
    }

    #[test]
    fn not_found_classification() {
        assert!(Error::not_found("sbx-123").is_not_found());
        assert!(!Error::internal("oops").is_not_found());
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(err.is_not_found());
    }

    #[test]
    fn io_timeout_maps_to_transient() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        let err: Error = io_err.into();
        assert!(err.is_transient());
    }

    #[test]
    fn sqlite_no_rows_maps_to_not_found() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(err.is_not_found());
    }

    #[test]
    fn display_names_the_kind() {
        assert_eq!(
            Error::invalid_input("path must be absolute").to_string(),
            "invalid input: path must be absolute"
        );
        assert_eq!(Error::not_found("sbx-1").to_string(), "not found: sbx-1");
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
