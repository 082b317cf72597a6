//! Error types for rpcbus

use thiserror::Error;

use crate::validate::ValidationError;

/// Errors that can occur while speaking the rpcbus protocol
#[derive(Error, Debug)]
pub enum BusError {
    /// Connection to the peer failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The underlying byte stream or socket failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Failed to serialize/deserialize a value or envelope
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A length prefix announced a frame above the configured limit
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// A decoded envelope failed validation
    #[error("Invalid message: {0}")]
    Invalid(#[from] ValidationError),

    /// The client has been shut down
    #[error("Client shut down")]
    Shutdown,
}

/// Result type for rpcbus operations
pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_connection() {
        let err = BusError::Connection("failed to connect".to_string());
        assert_eq!(err.to_string(), "Connection error: failed to connect");
    }

    #[test]
    fn test_error_display_transport() {
        let err = BusError::Transport("stream closed".to_string());
        assert_eq!(err.to_string(), "Transport error: stream closed");
    }

    #[test]
    fn test_error_display_frame_too_large() {
        let err = BusError::FrameTooLarge { len: 2048, max: 1024 };
        assert_eq!(
            err.to_string(),
            "Frame of 2048 bytes exceeds limit of 1024 bytes"
        );
    }

    #[test]
    fn test_error_display_invalid() {
        let err: BusError = ValidationError::EmptyId("channel").into();
        assert_eq!(err.to_string(), "Invalid message: channel id is empty");
    }

    #[test]
    fn test_error_display_shutdown() {
        let err = BusError::Shutdown;
        assert_eq!(err.to_string(), "Client shut down");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("not valid json").unwrap_err();
        let err: BusError = json_err.into();
        assert!(matches!(err, BusError::Codec(_)));
        assert!(err.to_string().starts_with("Codec error:"));
    }

    #[test]
    fn test_error_debug() {
        let err = BusError::Connection("test".to_string());
        let debug = format!("{:?}", err);
        assert!(debug.contains("Connection"));
        assert!(debug.contains("test"));
    }
}
