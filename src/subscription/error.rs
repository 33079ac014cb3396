//! Error types for the subscription coordination layer.
//!
//! # Error Handling Patterns
//!
//! Callers of this layer see either a successful snapshot/mutation or a
//! [`SubscriptionError`]. There is no automatic retry inside the layer: a
//! silently retried ownership write could let two rebalancers act at once.
//! The two exceptions are:
//!
//! - `unregister_session`: a missing session record counts as success and
//!   connection loss is retried (guaranteed delete)
//! - `create_subscription`: detection of a partially initialized subscription
//!   is itself the retry mechanism exposed to callers
//!
//! Lock release failures are the most severe class: a leaked lock blocks every
//! later coordination step on the subscription. They are logged and returned,
//! never swallowed.

use thiserror::Error;

use super::keys::CodecError;
use super::partition_state::{PartitionKey, PartitionState};
use crate::store::StoreError;

/// Result type for subscription coordination operations.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Errors surfaced by the subscription coordination layer.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// A store or lock operation failed.
    #[error("{operation} failed for subscription {subscription_id} at {path}: {source}")]
    Coordination {
        operation: &'static str,
        subscription_id: String,
        path: String,
        #[source]
        source: StoreError,
    },

    /// A stored value could not be decoded.
    #[error("corrupted data for subscription {subscription_id} at {path}: {source}")]
    CorruptedData {
        subscription_id: String,
        path: String,
        #[source]
        source: CodecError,
    },

    /// An identifier cannot be stored in the path scheme or record format.
    #[error("invalid {kind} '{value}': {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    /// Requested ownership change is not a legal state machine transition.
    #[error("illegal transition for {key}: {from} -> {to}")]
    IllegalTransition {
        key: PartitionKey,
        from: PartitionState,
        to: PartitionState,
    },

    /// Requested partition record breaks the record invariants.
    #[error("inconsistent record for {key}: {reason}")]
    InconsistentRecord {
        key: PartitionKey,
        reason: &'static str,
    },

    /// The lock node belongs to another holder at release time.
    #[error("lock {path} of subscription {subscription_id} is no longer held by this client")]
    LockLost {
        subscription_id: String,
        path: String,
    },

    /// `changed()` was awaited on a watch that has already fired or was cancelled.
    #[error("watch on {path} is not armed")]
    WatchNotArmed { path: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SubscriptionError {
    /// Wrap a store failure with the context of the operation.
    pub(crate) fn coordination(
        operation: &'static str,
        subscription_id: &str,
        path: &str,
        source: StoreError,
    ) -> Self {
        SubscriptionError::Coordination {
            operation,
            subscription_id: subscription_id.to_string(),
            path: path.to_string(),
            source,
        }
    }

    /// Name of the failed store operation, if this wraps one.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            SubscriptionError::Coordination { operation, .. } => Some(operation),
            _ => None,
        }
    }

    /// Underlying store error, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            SubscriptionError::Coordination { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Check if a node that had to be created already existed (e.g. duplicate session id).
    #[inline]
    pub fn is_node_exists(&self) -> bool {
        self.store_error().is_some_and(StoreError::is_node_exists)
    }

    /// Check if a node that had to exist was missing.
    #[inline]
    pub fn is_not_found(&self) -> bool {
        self.store_error().is_some_and(StoreError::is_no_node)
    }

    /// Check if the link to the coordination store was lost.
    #[inline]
    pub fn is_connection_loss(&self) -> bool {
        self.store_error()
            .is_some_and(StoreError::is_connection_error)
    }

    /// Check if this error was raised while taking or releasing the lock.
    pub fn is_lock_error(&self) -> bool {
        match self {
            SubscriptionError::LockLost { .. } => true,
            SubscriptionError::Coordination { operation, .. } => operation.starts_with("lock."),
            _ => false,
        }
    }
}
