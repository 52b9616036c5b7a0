//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Framing errors
    /// The length prefix is missing, exceeds the frame cap, or exceeds the
    /// bytes actually available.
    #[error("malformed length: declared {declared} bytes, limit is {limit} bytes")]
    MalformedLength {
        /// Length announced by the prefix (or required for the prefix itself).
        declared: u64,
        /// Bytes available or the configured cap, whichever was violated.
        limit: u64,
    },

    /// The frame body is not a valid envelope.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// An envelope carried a kind byte this version does not know.
    #[error("unknown envelope kind: {0}")]
    UnknownKind(u8),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    // Transfer errors
    /// The transfer channel received a command byte it does not know.
    #[error("unknown transfer command: {0}")]
    UnknownCommand(u8),

    /// File or data transfer failed.
    #[error("transfer failed: {0}")]
    TransferFailed(String),
}

impl ProtocolError {
    /// Returns true if the error means the byte stream can no longer be trusted
    /// and the connection must be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedLength { .. }
                | ProtocolError::MalformedPayload(_)
                | ProtocolError::ConnectionClosed(_)
                | ProtocolError::TransferFailed(_)
                | ProtocolError::UnknownCommand(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::MalformedPayload(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::TransferFailed(err.to_string()),
        }
    }
}
