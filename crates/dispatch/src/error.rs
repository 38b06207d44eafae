//! Dispatch error types.

use thiserror::Error;

/// Dispatcher and control-plane client errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("control plane error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed control plane response: {0}")]
    InvalidResponse(String),

    #[error("container {uuid} is locked by {locked_by}")]
    LockedByOther { uuid: String, locked_by: String },

    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;
