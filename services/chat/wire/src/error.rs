//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Envelope failed validation; surfaced to the caller, never retried
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Malformed frame or envelope structure
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        WireError::Malformed(e.to_string())
    }
}
