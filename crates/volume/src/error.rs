//! Volume error types.

use thiserror::Error;

/// Volume operation errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("block not found: {0}")]
    NotFound(String),

    #[error("method disabled on read-only volume")]
    MethodDisabled,

    #[error("trash is disabled: trash_lifetime is zero and unsafe_delete is off")]
    TrashDisabled,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("could not write enough replicas: wanted {want}, wrote {got}")]
    NotEnoughReplicas { want: usize, got: usize },

    #[error("backend error{}{}: {message}", fmt_status(.status), fmt_code(.code))]
    Backend {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] cairn_core::Error),

    #[error("{0}")]
    Other(String),
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" ({s}"),
        None => " (".to_string(),
    }
}

fn fmt_code(code: &Option<String>) -> String {
    match code {
        Some(c) => format!(" {c})"),
        None => ")".to_string(),
    }
}

impl Error {
    /// Canonical not-found test used by race recovery.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn backend(status: Option<u16>, code: Option<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            status,
            code,
            message: message.into(),
        }
    }

    /// A short tag for the per-bucket error counters, including provider
    /// status and code where known.
    pub fn stat_tag(&self) -> String {
        match self {
            Error::Backend { status, code, .. } => format!(
                "backend {} {}",
                status.map_or_else(|| "-".to_string(), |s| s.to_string()),
                code.as_deref().unwrap_or("-"),
            ),
            Error::NotFound(_) => "not_found".to_string(),
            Error::Checksum { .. } => "checksum".to_string(),
            Error::Cancelled => "cancelled".to_string(),
            Error::Timeout(_) => "timeout".to_string(),
            Error::Io(_) => "io".to_string(),
            other => format!("{other:?}")
                .split([' ', '(', '{'])
                .next()
                .unwrap_or("other")
                .to_lowercase(),
        }
    }
}

/// Result type for volume operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_formats_status_and_code() {
        let err = Error::backend(Some(404), Some("NoSuchBucket".to_string()), "gone");
        assert_eq!(err.to_string(), "backend error (404 NoSuchBucket): gone");
        assert_eq!(err.stat_tag(), "backend 404 NoSuchBucket");

        let err = Error::backend(None, None, "connection refused");
        assert_eq!(err.to_string(), "backend error (): connection refused");
    }

    #[test]
    fn not_found_is_canonical() {
        assert!(Error::NotFound("x".to_string()).is_not_found());
        assert!(!Error::MethodDisabled.is_not_found());
    }
}
