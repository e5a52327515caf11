//! Error types shared across the control plane.

use thiserror::Error;

/// Result type alias using the control plane's `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Control plane error kinds, per the error handling design.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    #[error("not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("preflight check failed: {0}")]
    Preflight(String),

    #[error("external tool failed: {0}")]
    ExternalTool(String),

    #[error("QMP protocol error: {0}")]
    Protocol(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    /// Maps this error onto the request-visible `(status_code, message)` pair.
    ///
    /// Used by the HTTP surface; kept here so the mapping lives beside the kinds it covers.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidInput(_) => 400,
            Error::ResourceConflict(_) => 409,
            Error::NotFound { .. } => 404,
            Error::Preflight(_) | Error::ExternalTool(_) | Error::Protocol(_) => 500,
            Error::Timeout(_) => 504,
            Error::Internal(_) => 500,
            Error::Io(_) | Error::Serialization(_) => 500,
        }
    }
}
