//! Error types for the client library.

use std::time::Duration;

use protocol::{ErrorBody, ErrorCode, Kind, ProtocolError};
use thiserror::Error;

use crate::storage::StorageError;

/// Errors returned by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No reply arrived within the correlation window.
    #[error("request {sequence_id} timed out after {timeout:?}")]
    Timeout { sequence_id: i64, timeout: Duration },

    /// The connection to the relay is gone.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The relay answered with an `Error` envelope.
    #[error("rejected by relay ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    /// The relay answered with an unexpected kind.
    #[error("unexpected reply kind: {0:?}")]
    UnexpectedReply(Kind),

    /// The operation needs a logged-in session.
    #[error("not logged in")]
    NotAuthenticated,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ErrorBody> for ClientError {
    fn from(body: ErrorBody) -> Self {
        ClientError::Rejected {
            code: body.code,
            message: body.message,
        }
    }
}

impl ClientError {
    /// Error code if the relay rejected the request.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
