//! Error types for the coordination store adapter.
//!
//! These mirror the failure modes of a ZooKeeper-style store: structural
//! errors (`NoNode`, `NodeExists`, `NotEmpty`, `BadVersion`) that describe the
//! tree, and connectivity errors (`ConnectionLoss`, `SessionExpired`) that
//! describe the link to it. Only connection loss is considered transient.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by a [`CoordinationStore`](super::CoordinationStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The node (or its parent, on create) does not exist.
    #[error("no node at {path}")]
    NoNode { path: String },

    /// A node already exists at the path.
    #[error("node already exists at {path}")]
    NodeExists { path: String },

    /// Delete of a node that still has children.
    #[error("node {path} has children")]
    NotEmpty { path: String },

    /// Conditional write or delete against a stale version.
    #[error("version mismatch at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    /// Ephemeral nodes cannot have children.
    #[error("ephemeral node {path} cannot have children")]
    NoChildrenForEphemerals { path: String },

    /// Path is not absolute, has empty segments or a trailing slash.
    #[error("invalid path '{path}'")]
    InvalidPath { path: String },

    /// Connection to the store was interrupted; the outcome of the operation is unknown.
    #[error("connection to coordination store lost")]
    ConnectionLoss,

    /// The store session expired; its ephemeral nodes and watches are gone.
    #[error("coordination store session {session_id} expired")]
    SessionExpired { session_id: u64 },

    /// Any other backend failure.
    #[error("coordination store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Check if the operation may succeed when retried unchanged.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::ConnectionLoss)
    }

    #[inline]
    pub fn is_no_node(&self) -> bool {
        matches!(self, StoreError::NoNode { .. })
    }

    #[inline]
    pub fn is_node_exists(&self) -> bool {
        matches!(self, StoreError::NodeExists { .. })
    }

    /// Check if this error means the link to the store is gone.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionLoss | StoreError::SessionExpired { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_loss_is_retriable() {
        assert!(StoreError::ConnectionLoss.is_retriable());
        assert!(!StoreError::SessionExpired { session_id: 1 }.is_retriable());
        assert!(
            !StoreError::NoNode {
                path: "/a".to_string()
            }
            .is_retriable()
        );
        assert!(!StoreError::Backend("boom".to_string()).is_retriable());
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(StoreError::ConnectionLoss.is_connection_error());
        assert!(StoreError::SessionExpired { session_id: 7 }.is_connection_error());
        assert!(
            !StoreError::NotEmpty {
                path: "/a".to_string()
            }
            .is_connection_error()
        );
    }

    #[test]
    fn test_bad_version_display() {
        let err = StoreError::BadVersion {
            path: "/nakadi/x".to_string(),
            expected: 3,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "version mismatch at /nakadi/x: expected 3, found 4"
        );
    }
}
