//! Typed failures of a control-plane exchange

use thiserror::Error;

/// Why a control-plane call failed.
///
/// None of these are retried by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No response: connect error, timeout, TLS failure
    #[error("{operation}: transport error: {source}")]
    Transport {
        /// Operation that was running
        operation: &'static str,
        /// Underlying HTTP client error
        #[source]
        source: reqwest::Error,
    },

    /// The version tag sent in `If-Match` no longer matches (HTTP 412)
    #[error("{operation}: precondition failed: {body}")]
    PreconditionFailed {
        /// Operation that was running
        operation: &'static str,
        /// Response body
        body: String,
    },

    /// Any other non-success response
    #[error("{operation}: HTTP {status}: {body}")]
    Remote {
        /// Operation that was running
        operation: &'static str,
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// A success response whose body could not be understood
    #[error("{operation}: invalid response: {message}")]
    InvalidResponse {
        /// Operation that was running
        operation: &'static str,
        /// What was wrong with the body
        message: String,
    },
}

impl ClientError {
    /// Operation the error came from
    pub fn operation(&self) -> &'static str {
        match self {
            ClientError::Transport { operation, .. }
            | ClientError::PreconditionFailed { operation, .. }
            | ClientError::Remote { operation, .. }
            | ClientError::InvalidResponse { operation, .. } => operation,
        }
    }

    /// HTTP status, when a response was received
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::PreconditionFailed { .. } => Some(412),
            ClientError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}
