//! Shared error types for the remoting layer.

use crate::packet::{CorrelationId, HandlerId};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by dispatchers, connections and transports.
#[derive(Error, Debug)]
pub enum RemotingError {
    /// A handler is already registered under this identity.
    #[error("Handler already registered: {0}")]
    DuplicateHandler(HandlerId),

    /// The transport refused or failed to write a packet.
    #[error("Transmission failed: {0}")]
    Transmission(String),

    /// No reply arrived before the call's deadline.
    #[error("Call {correlation_id} timed out after {timeout:?}")]
    CallTimeout {
        /// The call that timed out.
        correlation_id: CorrelationId,
        /// The timeout that was applied.
        timeout: Duration,
    },

    /// The connection is not started, or has been stopped.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection is in the wrong state for the requested operation.
    #[error("Connection is in invalid state '{current}' for operation '{operation}'")]
    InvalidState {
        /// The current state of the connection.
        current: String,
        /// The operation that was attempted.
        operation: String,
    },

    /// An I/O error from the underlying socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A frame exceeded the maximum size.
    #[error("Frame too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Announced frame size.
        size: u32,
        /// Maximum accepted size.
        max: u32,
    },

    /// TLS setup or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<serde_json::Error> for RemotingError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Alias for remoting results.
pub type RemotingResult<T> = Result<T, RemotingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RemotingError::DuplicateHandler(HandlerId(10));
        assert_eq!(err.to_string(), "Handler already registered: 10");

        let err = RemotingError::CallTimeout {
            correlation_id: CorrelationId(3),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Call #3 timed out after 250ms");

        let err = RemotingError::InvalidState {
            current: "Stopped".to_string(),
            operation: "start".to_string(),
        };
        assert!(err.to_string().contains("Stopped"));
    }

    #[test]
    fn test_json_error_becomes_codec() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: RemotingError = parse.into();
        assert!(matches!(err, RemotingError::Codec(_)));
    }
}
