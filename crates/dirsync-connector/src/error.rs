//! Connector error types
//!
//! Error definitions with transient/permanent classification for retry logic.

use thiserror::Error;

/// Error that can occur while talking to the directory or the mail store.
#[derive(Debug, Error)]
pub enum ConnectorError {
    // Transport errors (transient)
    /// Failed to establish a connection to the remote service.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation or connection timed out.
    #[error("timeout after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// Remote service is temporarily unavailable (busy, shutting down).
    #[error("service unavailable: {message}")]
    Unavailable { message: String },

    /// Established connection was dropped.
    #[error("connection lost: {message}")]
    ConnectionLost {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Authentication and configuration errors (permanent)
    /// Invalid credentials provided.
    #[error("authentication failed: invalid credentials")]
    AuthenticationFailed,

    /// Insufficient permissions for the operation.
    #[error("authorization failed: insufficient permissions for {operation}")]
    AuthorizationFailed { operation: String },

    /// Connector configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// The server does not support the requested feature.
    #[error("unsupported by server: {feature}")]
    Unsupported { feature: String },

    // Operation errors (permanent)
    /// Object not found on the remote side.
    #[error("object not found: {identifier}")]
    ObjectNotFound { identifier: String },

    /// Object already exists on the remote side.
    #[error("object already exists: {identifier}")]
    ObjectAlreadyExists { identifier: String },

    /// The server rejected the operation.
    #[error("operation failed: {message}")]
    OperationFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Data returned by the server could not be interpreted.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    /// Consumer of a change feed went away or shutdown was requested.
    #[error("cancelled")]
    Cancelled,

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ConnectorError {
    /// Check if this error is transient and the operation should be retried
    /// after reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::ConnectionFailed { .. }
                | ConnectorError::Timeout { .. }
                | ConnectorError::Unavailable { .. }
                | ConnectorError::ConnectionLost { .. }
        )
    }

    /// Check if this error is permanent and retry won't help.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Check if this error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConnectorError::ObjectNotFound { .. })
    }

    /// Get an error code for classification.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectorError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            ConnectorError::Timeout { .. } => "TIMEOUT",
            ConnectorError::Unavailable { .. } => "UNAVAILABLE",
            ConnectorError::ConnectionLost { .. } => "CONNECTION_LOST",
            ConnectorError::AuthenticationFailed => "AUTH_FAILED",
            ConnectorError::AuthorizationFailed { .. } => "AUTHORIZATION_FAILED",
            ConnectorError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            ConnectorError::Unsupported { .. } => "UNSUPPORTED",
            ConnectorError::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            ConnectorError::ObjectAlreadyExists { .. } => "OBJECT_EXISTS",
            ConnectorError::OperationFailed { .. } => "OPERATION_FAILED",
            ConnectorError::InvalidData { .. } => "INVALID_DATA",
            ConnectorError::Cancelled => "CANCELLED",
            ConnectorError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    // Convenience constructors

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection failed error with source.
    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection lost error.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        ConnectorError::ConnectionLost {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection lost error with source.
    pub fn connection_lost_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::ConnectionLost {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an operation failed error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        ConnectorError::OperationFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create an operation failed error with source.
    pub fn operation_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ConnectorError::OperationFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an unsupported feature error.
    pub fn unsupported(feature: impl Into<String>) -> Self {
        ConnectorError::Unsupported {
            feature: feature.into(),
        }
    }

    /// Create an invalid data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        ConnectorError::InvalidData {
            message: message.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(identifier: impl Into<String>) -> Self {
        ConnectorError::ObjectNotFound {
            identifier: identifier.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        ConnectorError::Internal {
            message: message.into(),
        }
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let transient_errors = vec![
            ConnectorError::connection_failed("test"),
            ConnectorError::Timeout { timeout_secs: 30 },
            ConnectorError::Unavailable {
                message: "busy".to_string(),
            },
            ConnectorError::connection_lost("reset by peer"),
        ];

        for err in transient_errors {
            assert!(
                err.is_transient(),
                "Expected {} to be transient",
                err.error_code()
            );
            assert!(!err.is_permanent());
        }
    }

    #[test]
    fn test_permanent_errors() {
        let permanent_errors = vec![
            ConnectorError::AuthenticationFailed,
            ConnectorError::unsupported("persistent search"),
            ConnectorError::not_found("user/jdoe@example.org"),
            ConnectorError::operation_failed("NO permission denied"),
            ConnectorError::Cancelled,
        ];

        for err in permanent_errors {
            assert!(
                err.is_permanent(),
                "Expected {} to be permanent",
                err.error_code()
            );
        }
    }

    #[test]
    fn test_error_display() {
        let err = ConnectorError::Timeout { timeout_secs: 30 };
        assert_eq!(err.to_string(), "timeout after 30 seconds");

        let err = ConnectorError::unsupported("sync replication");
        assert_eq!(err.to_string(), "unsupported by server: sync replication");
    }

    #[test]
    fn test_error_with_source() {
        let source_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = ConnectorError::connection_lost_with_source("read failed", source_err);

        assert!(err.is_transient());
        if let ConnectorError::ConnectionLost { source, .. } = &err {
            assert!(source.is_some());
        } else {
            panic!("Expected ConnectionLost variant");
        }
    }

    #[test]
    fn test_not_found_classification() {
        assert!(ConnectorError::not_found("x").is_not_found());
        assert!(!ConnectorError::internal("x").is_not_found());
    }
}
