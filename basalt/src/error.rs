//! Core error types
//!
//! One variant per error kind the cluster core distinguishes. The data plane
//! converts most errors into per-row failures; the variants that must never
//! be swallowed (`CircuitBreaking`) or that are retried against a refreshed
//! cluster state (`is_temporary`) are classified here so call sites can
//! match on policy instead of message strings.

use crate::blocks::ClusterBlockLevel;
use crate::shard::ShardId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the cluster core
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Error {
    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("no active shard copy available for {0}")]
    ShardNotAvailable(ShardId),

    #[error("blocked by: [{reason}] (level {level:?})")]
    Blocked {
        level: ClusterBlockLevel,
        reason: String,
    },

    #[error("version conflict for document {id}")]
    VersionConflict { id: String },

    #[error("circuit breaker tripped: {0}")]
    CircuitBreaking(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("snapshot in progress for {0}")]
    SnapshotInProgress(String),

    #[error("restore in progress for {0}")]
    RestoreInProgress(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl Error {
    /// Error kind as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::IndexNotFound(_) => "index_not_found",
            Error::ShardNotFound(_) => "shard_not_found",
            Error::ShardNotAvailable(_) => "shard_not_available",
            Error::Blocked { .. } => "blocked",
            Error::VersionConflict { .. } => "version_conflict",
            Error::CircuitBreaking(_) => "circuit_breaking",
            Error::Validation(_) => "validation",
            Error::SnapshotInProgress(_) => "snapshot_in_progress",
            Error::RestoreInProgress(_) => "restore_in_progress",
            Error::IllegalArgument(_) => "illegal_argument",
            Error::IllegalState(_) => "illegal_state",
        }
    }

    /// Whether a retry against a refreshed cluster state can succeed.
    ///
    /// Covers lookups against stale state: an index created a moment ago, a
    /// shard copy that has not started yet.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Error::IndexNotFound(_) | Error::ShardNotFound(_) | Error::ShardNotAvailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
