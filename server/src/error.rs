//! Crate-wide error type.
//!
//! Every fallible operation in the node reports one of five kinds. Callers
//! decide retry and escalation from *where* the error surfaced, not from its
//! message, so the variants carry plain strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Challenge or token acquisition against the authority failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network failure or a non-success HTTP status.
    #[error("transport error: {0}")]
    Transport(String),

    /// The manifest payload could not be decompressed or decoded.
    #[error("manifest decode failed: {0}")]
    Decode(String),

    /// A storage backend I/O operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Bad signature or malformed hash at a boundary.
    #[error("invalid request: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
