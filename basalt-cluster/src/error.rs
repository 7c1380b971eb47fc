//! Cluster-plane error types

use basalt::Error as CoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in the cluster plane
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("failed to commit cluster state: {0}")]
    FailedToCommit(String),

    #[error("job cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            ClusterError::Core(e) => e.error_type(),
            ClusterError::Connection(_) => "connection",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::Transport(_) => "transport",
            ClusterError::Serialization(_) => "serialization",
            ClusterError::NodeUnavailable(_) => "node_unavailable",
            ClusterError::FailedToCommit(_) => "failed_to_commit",
            ClusterError::Cancelled(_) => "cancelled",
            ClusterError::Internal(_) => "internal",
        }
    }

    /// Whether the write path should retry this error against a refreshed
    /// cluster state
    pub fn is_temporary(&self) -> bool {
        match self {
            ClusterError::Core(e) => e.is_temporary(),
            ClusterError::Connection(_)
            | ClusterError::Timeout(_)
            | ClusterError::Transport(_)
            | ClusterError::NodeUnavailable(_) => true,
            _ => false,
        }
    }

    /// Errors that must never be folded into per-row failures
    pub fn must_propagate(&self) -> bool {
        matches!(self, ClusterError::Core(CoreError::CircuitBreaking(_)))
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
