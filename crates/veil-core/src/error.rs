//! Error types for veil-core.

use thiserror::Error;

/// Errors that can occur while verifying credentials.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("malformed session token")]
    MalformedToken,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    TokenExpired,
}

/// Result type alias for veil-core operations.
pub type Result<T> = std::result::Result<T, Error>;
