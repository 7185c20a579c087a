//! Error types for the SQS/SNS messaging adapter

use std::time::Duration;

use thiserror::Error;

/// Adapter error taxonomy
///
/// Producer operations surface `Connection` errors to the caller; consumer
/// loops log them and keep polling. `Nack` is a sentinel a handler returns
/// to request redelivery of the message it is processing.
#[derive(Debug, Error)]
pub enum MqError {
    /// Invalid target syntax or missing/invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Any SDK-level failure (create/lookup/send/receive/subscribe/delete)
    #[error("connection error: {0}")]
    Connection(String),

    /// A query exceeded its deadline
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// Handler sentinel: reset visibility and let the message redeliver
    #[error("handler requested message redelivery")]
    Nack,

    /// Any other handler failure; the message is neither ACKed nor NACKed
    #[error("handler error: {0}")]
    Handler(String),

    /// Body encode/decode error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MqError {
    /// Build a `Connection` error from any displayable SDK error
    pub fn connection(err: impl std::fmt::Display) -> Self {
        MqError::Connection(err.to_string())
    }

    /// True when this is the redelivery sentinel
    pub fn is_nack(&self) -> bool {
        matches!(self, MqError::Nack)
    }
}

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, MqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MqError::Connection("endpoint unreachable".to_string());
        assert_eq!(err.to_string(), "connection error: endpoint unreachable");
    }

    #[test]
    fn test_timeout_display_carries_duration() {
        let err = MqError::Timeout(Duration::from_secs(15));
        assert!(err.to_string().contains("15s"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json");
        assert!(json_err.is_err());

        let err: MqError = json_err.unwrap_err().into();
        assert!(matches!(err, MqError::Serialization(_)));
    }

    #[test]
    fn test_is_nack() {
        assert!(MqError::Nack.is_nack());
        assert!(!MqError::Handler("boom".to_string()).is_nack());
    }
}
