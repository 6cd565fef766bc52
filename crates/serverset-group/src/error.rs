//! Error types surfaced to callers of the membership layer.

use std::time::Duration;

use serverset_coord::CoordError;
use thiserror::Error;

/// Result type alias for membership operations.
pub type MembershipResult<T> = Result<T, MembershipError>;

/// The failure channels of `join` and `leave`.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// A join could not be completed; nothing was left registered.
    #[error("failed to join group {group}")]
    Join {
        group: String,
        #[source]
        cause: FailureCause,
    },

    /// A leave (or other membership update) could not be completed.
    #[error("failed to update membership in group {group}")]
    Update {
        group: String,
        #[source]
        cause: FailureCause,
    },

    /// The caller interrupted the operation while it was waiting.
    #[error("interrupted while waiting for the coordination service")]
    Interrupted,
}

impl MembershipError {
    pub fn join(group: &str, cause: impl Into<FailureCause>) -> Self {
        Self::Join {
            group: group.to_string(),
            cause: cause.into(),
        }
    }

    pub fn update(group: &str, cause: impl Into<FailureCause>) -> Self {
        Self::Update {
            group: group.to_string(),
            cause: cause.into(),
        }
    }

    /// The underlying cause, if this is a join or update failure.
    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            Self::Join { cause, .. } | Self::Update { cause, .. } => Some(cause),
            Self::Interrupted => None,
        }
    }
}

/// Why a join or update failed.
#[derive(Debug, Error)]
pub enum FailureCause {
    #[error(transparent)]
    Coordination(#[from] CoordError),

    #[error("session not connected within {0:?}")]
    NotConnected(Duration),

    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("member payload could not be encoded: {0}")]
    Encode(String),

    #[error("group has failed and must be recreated")]
    GroupFailed,

    #[error("member registration task failed: {0}")]
    TaskFailed(String),
}

impl FailureCause {
    /// Whether retrying cannot help: the service refused the write, the
    /// client is gone, or the payload itself is bad. Connection faults,
    /// timeouts and a parent node vanishing mid-create are worth retrying.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Coordination(e) => !(e.is_retryable() || e.is_no_node()),
            Self::Encode(_) | Self::GroupFailed => true,
            Self::NotConnected(_) | Self::Timeout(_) | Self::TaskFailed(_) => false,
        }
    }
}
