//! Error types for coordination operations.
//!
//! Provides typed error variants so that callers can tell an expected
//! condition (the session is down, the node is already gone) apart from a
//! real failure without inspecting backend internals.

use thiserror::Error;

/// Top-level error type for the coordination crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// The session is not connected; the operation was not executed.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The target path does not exist.
    #[error("no node: {0}")]
    NoNode(String),

    /// The target path already exists.
    #[error("node exists: {0}")]
    NodeExists(String),

    /// The target path still has children.
    #[error("node not empty: {0}")]
    NotEmpty(String),

    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error (e.g. no servers supplied). Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend or transport failure that fits no other variant.
    #[error("transport error: {0}")]
    Transport(String),

    /// The component owning the request has shut down.
    #[error("closed: {0}")]
    Closed(String),
}

impl CoordinationError {
    /// Returns true if the session was down when the operation was attempted.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, CoordinationError::NotConnected(_))
    }

    /// Returns true if the target path was missing.
    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordinationError::NoNode(_))
    }

    /// Returns true if the target path already existed.
    pub fn is_node_exists(&self) -> bool {
        matches!(self, CoordinationError::NodeExists(_))
    }

    /// Returns true if this error indicates a transient failure that may
    /// succeed once the session is back (not connected or transport).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::NotConnected(_) | CoordinationError::Transport(_)
        )
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
