//! Error types for the store node.

use thiserror::Error;

/// Errors produced by the store node.
///
/// Variants follow how the failure is reported to callers: invalid input is a
/// client error, unavailability means no peer could be asked at all, and every
/// other variant is an internal failure of this node.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The caller supplied malformed input (query parameters, records).
    #[error("{0}")]
    InvalidInput(String),

    /// No peer is available to serve the request.
    #[error("{0}")]
    Unavailable(String),

    /// Partial query results could not be merged.
    #[error("merging results: {0}")]
    Merge(String),

    /// Data could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The local store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A request to a peer failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Reading or writing a byte stream failed.
    #[error("io error: {0}")]
    Io(String),

    /// Any other internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
