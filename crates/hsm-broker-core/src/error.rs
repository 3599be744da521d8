//! Domain error types for the HSM broker.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Pool capacity must be at least 1.
    #[error("pool capacity must be at least 1, got {0}")]
    InvalidPoolCapacity(usize),

    /// Worker count must be at least 1.
    #[error("broker workers must be at least 1, got {0}")]
    InvalidWorkerCount(usize),

    /// Request timeout must be non-zero.
    #[error("request_timeout_ms must be greater than 0")]
    ZeroRequestTimeout,

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),
}

/// Errors surfaced by the codec, the connection pool and the broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// No response and no explicit error arrived before the request deadline.
    #[error("timeout on response")]
    Timeout,

    /// Pool operation attempted after shutdown.
    #[error("pool is closing")]
    PoolClosing,

    /// A frame declared more bytes than the source holds.
    #[error("invalid message length: frame declares {declared} bytes, {available} available")]
    InvalidMsgLength { declared: usize, available: usize },

    /// Payload does not fit in the 2-byte length prefix.
    #[error("payload of {len} bytes exceeds maximum frame length {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// TCP/IO error on a device connection.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Establishing a device connection took too long.
    #[error("timed out connecting to {address}")]
    ConnectTimeout { address: String },

    /// The caller-supplied cancellation fired while waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// The broker has been closed.
    #[error("broker shutting down")]
    Shutdown,

    /// Another live request already holds this correlation id.
    #[error("correlation id {0} already in flight")]
    DuplicateCorrelationId(String),

    /// The device answered with something that is not a valid broker frame.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl BrokerError {
    /// Stable short label, used for metrics and structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::PoolClosing => "pool_closing",
            Self::InvalidMsgLength { .. } => "invalid_msg_length",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Connection(_) => "connection",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
            Self::DuplicateCorrelationId(_) => "duplicate_correlation_id",
            Self::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidPoolCapacity(0);
        assert!(err.to_string().contains("capacity"));
        assert!(err.to_string().contains('0'));
    }

    #[test]
    fn test_invalid_msg_length_display() {
        let err = BrokerError::InvalidMsgLength {
            declared: 100,
            available: 12,
        };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn test_broker_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "test");
        let err: BrokerError = io_err.into();
        assert!(matches!(err, BrokerError::Connection(_)));
        assert_eq!(err.kind(), "connection");
    }

    #[test]
    fn test_error_kinds_are_distinct() {
        let kinds = [
            BrokerError::Timeout.kind(),
            BrokerError::PoolClosing.kind(),
            BrokerError::Cancelled.kind(),
            BrokerError::Shutdown.kind(),
            BrokerError::InvalidResponse(String::new()).kind(),
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
