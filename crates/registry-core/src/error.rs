//! Error types.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by the remote store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node does not exist: {0}")]
    NoNode(String),
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("node has children: {0}")]
    NotEmpty(String),
    #[error("not authorized for {0}")]
    NoAuth(String),
    #[error("ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid ACL for {0}")]
    InvalidAcl(String),
    #[error("connection lost")]
    ConnectionLoss,
    #[error("session not connected")]
    NotConnected,
    #[error("session closed")]
    SessionClosed,
    #[error("bad arguments: {0}")]
    BadArguments(String),
    /// Any other failure reported by the driver.
    #[error("remote store error: {0}")]
    Remote(String),
}

/// Coordination error.
///
/// The only error kind surfaced to callers. The underlying cause is kept
/// for diagnostics only.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("timed out after {}ms waiting for session to connect", waited.as_millis())]
    ConnectionTimeout { waited: Duration },
    #[error("failed to start session: {0}")]
    Connect(#[source] StoreError),
    #[error("{operation} failed for {path}: {source}")]
    OperationFailed {
        operation: &'static str,
        path: String,
        #[source]
        source: StoreError,
    },
}

impl CoordinationError {
    /// Wrap a failed tree operation.
    #[must_use]
    pub fn operation(operation: &'static str, path: &str, source: StoreError) -> Self {
        Self::OperationFailed {
            operation,
            path: path.to_string(),
            source,
        }
    }

    /// Whether the session never connected within the allowed wait.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectionTimeout { .. })
    }

    /// The underlying store failure, if any.
    #[must_use]
    pub const fn cause(&self) -> Option<&StoreError> {
        match self {
            Self::ConnectionTimeout { .. } => None,
            Self::Connect(source) | Self::OperationFailed { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_operation_failed_keeps_cause() {
        let err = CoordinationError::operation("get", "/a", StoreError::NoNode("/ns/a".into()));
        assert!(!err.is_timeout());
        assert!(matches!(err.cause(), Some(StoreError::NoNode(p)) if p == "/ns/a"));
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "get failed for /a: node does not exist: /ns/a");
    }

    #[test]
    fn test_timeout_has_no_cause() {
        let err = CoordinationError::ConnectionTimeout {
            waited: Duration::from_millis(20),
        };
        assert!(err.is_timeout());
        assert!(err.cause().is_none());
        assert!(err.to_string().contains("20ms"));
    }
}
