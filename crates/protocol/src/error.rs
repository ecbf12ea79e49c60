//! Error types for the protocol crate.

use thiserror::Error;

/// Failure to encode or decode a wire message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The message could not be turned into JSON.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// The input was not a valid message.
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// A line-delimited reader handed over a blank line.
    #[error("empty message line")]
    EmptyLine,
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ProtocolError::Decode("bad tag".to_string()).to_string(),
            "failed to decode message: bad tag"
        );
        assert_eq!(ProtocolError::EmptyLine.to_string(), "empty message line");
    }

    #[test]
    fn test_syntax_error_is_decode() {
        let err: ProtocolError = serde_json::from_str::<i32>("{").unwrap_err().into();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
