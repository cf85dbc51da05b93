//! Error types shared across the crate.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for natter operations.
pub type Result<T> = std::result::Result<T, NatterError>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum NatterError {
    /// STUN-specific errors.
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Network I/O errors.
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// Operation deadline exceeded.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration errors, fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// UPnP errors, always downgraded to warnings by the caller.
    #[error("UPnP error: {0}")]
    Upnp(String),
}

impl From<serde_json::Error> for NatterError {
    fn from(err: serde_json::Error) -> Self {
        NatterError::Config(err.to_string())
    }
}

/// STUN probe errors.
#[derive(Error, Debug)]
pub enum StunError {
    /// Malformed or unexpected wire data.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Response transaction ID does not match the request.
    #[error("transaction ID mismatch")]
    TransactionMismatch,

    /// Response lacks the XOR-MAPPED-ADDRESS attribute.
    #[error("missing attribute: {0}")]
    MissingAttribute(&'static str),

    /// Server answered with a Binding Error response.
    #[error("server error {code}: {reason}")]
    ErrorResponse { code: u16, reason: String },

    /// Every configured server was tried and failed.
    #[error("all {0} STUN servers failed")]
    AllServersFailed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stun_error_wraps_into_natter_error() {
        let err: NatterError = StunError::TransactionMismatch.into();
        match err {
            NatterError::Stun(StunError::TransactionMismatch) => {}
            other => panic!("wrong variant: {other}"),
        }
    }

    #[test]
    fn error_display() {
        let err = StunError::ErrorResponse {
            code: 400,
            reason: "Bad Request".to_string(),
        };
        assert_eq!(err.to_string(), "server error 400: Bad Request");
        assert_eq!(
            StunError::AllServersFailed("udp").to_string(),
            "all udp STUN servers failed"
        );
    }
}
