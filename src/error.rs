//! Error taxonomy shared across the daemon
//!
//! Every fallible operation in the library returns [`Result`]. The variants
//! map one-to-one onto the externally visible behaviors: HTTP status codes
//! on the serve side and retry decisions on the worker side.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed query or path parameters. Maps to HTTP 400.
    #[error("bad input: {0}")]
    BadInput(String),

    /// The uploaded LSIF payload failed validation. Maps to HTTP 422 and is
    /// never retried by the worker.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] crate::importer::ImportError),

    /// No dump covers the requested (repository, commit, path). Surfaces as
    /// an empty-but-successful response.
    #[error("no LSIF data for this commit")]
    NotIndexed,

    /// Embedded database failure. Retryable.
    #[error("database error: {0}")]
    Database(#[from] turso::Error),

    /// Filesystem failure. Retryable.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal invariant was violated. Logged with full context; the
    /// operation fails but the process continues.
    #[error("invariant violation: {0}")]
    Fatal(String),
}

/// Coarse classification used by the HTTP layer and the job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadInput,
    InvalidPayload,
    NotIndexed,
    Transient,
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadInput(_) => ErrorKind::BadInput,
            Error::InvalidPayload(_) => ErrorKind::InvalidPayload,
            Error::NotIndexed => ErrorKind::NotIndexed,
            Error::Database(_) | Error::Io(_) => ErrorKind::Transient,
            Error::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether a worker should re-attempt the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// HTTP status code for the serve-side mapping.
    pub fn status(&self) -> u16 {
        match self.kind() {
            ErrorKind::BadInput => 400,
            ErrorKind::InvalidPayload => 422,
            // NotIndexed is handled before status mapping; if it leaks this
            // far, an empty 200 is still the right answer.
            ErrorKind::NotIndexed => 200,
            ErrorKind::Transient | ErrorKind::Fatal => 500,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Fatal(format!("serialization: {err}"))
    }
}
