//! Error types for the coordination client facade.

use thiserror::Error;

/// Result type alias for coordination service operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors returned by a coordination service client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("connection to the coordination service lost")]
    ConnectionLoss,

    #[error("session expired")]
    SessionExpired,

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("client closed")]
    Closed,
}

impl CoordError {
    /// Whether the operation may succeed if retried once the session is
    /// connected again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLoss | Self::SessionExpired)
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, Self::NoNode(_))
    }
}
