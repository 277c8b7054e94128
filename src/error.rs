//! Error taxonomy for the tree store engine.
//!
//! A single enum covers every failure the engine can surface to a
//! caller. Lifecycle hook failures are the one exception: under the
//! default "continue" policy they are recorded in the lifecycle event
//! log (see [`crate::lifecycle`]) rather than returned here.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArborError>;

/// The error taxonomy from the engine's failure-kind contract.
#[derive(Debug, Error)]
pub enum ArborError {
    /// A referenced node, working copy, entity, or tree does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Commit failed its optimistic-concurrency check: the node moved
    /// past the working copy's `baseVersion` before commit.
    #[error("stale version on commit of {node_id}: base {base_version}, current {current_version}")]
    StaleVersion {
        /// The node whose version advanced out from under the commit.
        node_id: String,
        /// The working copy's recorded base version.
        base_version: u64,
        /// The node's version at commit time.
        current_version: u64,
    },

    /// A sibling name collision under `onNameConflict = error`.
    #[error("name not unique: {0:?} already exists under parent {1}")]
    NameNotUnique(String, String),

    /// An operation would create a cycle or move a node under itself.
    #[error("illegal relation: {0}")]
    IllegalRelation(String),

    /// A payload failed validation: bad name, unregistered node type,
    /// an over-cap batch, and so on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A working copy already exists for the requested target, or a
    /// registration was refused.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The underlying store reported a failure unrelated to the
    /// contracts above.
    #[error("storage error: {0}")]
    Io(String),

    /// Cancellation observed in a non-commit region.
    #[error("aborted")]
    Aborted,
}

impl ArborError {
    /// Shorthand for [`ArborError::NotFound`] with a formatted subject.
    pub fn not_found(subject: impl Into<String>) -> Self {
        ArborError::NotFound(subject.into())
    }
}
