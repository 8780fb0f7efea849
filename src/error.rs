//! Error types for spatree.
//!
//! All public operations return [`Result`], whose error type distinguishes the
//! expected "not found" outcome from storage and integrity failures.

use crate::identifier::NodeId;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SpatreeError>;

/// Errors surfaced by the spatial index and its storage collaborators.
#[derive(Debug, Error)]
pub enum SpatreeError {
    /// No persisted body exists for the node.
    #[error("node {0} not found in storage")]
    NodeNotFound(NodeId),

    /// The `(shape, payload)` pair is not stored in the index.
    #[error("entry not found")]
    EntryNotFound,

    /// A persisted body could not be decoded.
    #[error("corrupt data for node {id}: {reason}")]
    CorruptData { id: NodeId, reason: String },

    /// Storage refused or failed a write.
    #[error("storage write failed: {0}")]
    WriteError(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural corruption detected at runtime.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A lock could not be acquired within the configured timeout.
    #[error("timed out acquiring {0}")]
    Timeout(String),

    /// Invalid shape or argument supplied by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SpatreeError {
    /// True for the recoverable "nothing there" outcomes.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NodeNotFound(_) | Self::EntryNotFound)
    }

    /// True when the failure originated in the storage tier.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::NodeNotFound(_) | Self::CorruptData { .. } | Self::WriteError(_) | Self::Io(_)
        )
    }

    pub(crate) fn corrupt(id: NodeId, reason: impl Into<String>) -> Self {
        Self::CorruptData {
            id,
            reason: reason.into(),
        }
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::warn!("Invariant violation: {}", msg);
        Self::InvariantViolation(msg)
    }
}
