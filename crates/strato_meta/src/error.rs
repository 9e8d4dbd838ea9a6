//! Error taxonomy shared by the meta plane and its wire protocol.

use thiserror::Error;

/// Crate-wide error type. `Incomplete` and `IoError` are transient and safe
/// to retry; everything else reflects a caller or data problem.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("incomplete: {0}")]
    Incomplete(String),
    #[error("io error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete(_))
    }

    /// Transient errors are retried by the update pipeline; the rest are
    /// surfaced to the caller immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Incomplete(_) | Error::IoError(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Corruption(err.to_string())
    }
}
