//! Integration tests for error types.
//!
//! These tests verify error display and classification helpers.

use nakadi_subscription::prelude::*;
use nakadi_subscription::subscription::{CodecError, PartitionRecord};

// ============================================================================
// StoreError
// ============================================================================

#[test]
fn test_store_error_classification() {
    let no_node = StoreError::NoNode {
        path: "/a".to_string(),
    };
    assert!(no_node.is_no_node());
    assert!(!no_node.is_retriable());

    let exists = StoreError::NodeExists {
        path: "/a".to_string(),
    };
    assert!(exists.is_node_exists());

    assert!(StoreError::ConnectionLoss.is_retriable());
    assert!(StoreError::ConnectionLoss.is_connection_error());

    let expired = StoreError::SessionExpired { session_id: 7 };
    assert!(expired.is_connection_error());
    assert!(!expired.is_retriable());
}

#[test]
fn test_store_error_display_includes_path() {
    let err = StoreError::NoNode {
        path: "/nakadi/subscriptions/x".to_string(),
    };
    assert!(err.to_string().contains("/nakadi/subscriptions/x"));
}

// ============================================================================
// SubscriptionError
// ============================================================================

#[test]
fn test_illegal_transition_display() {
    let err = SubscriptionError::IllegalTransition {
        key: PartitionKey::new("orders", "3"),
        from: PartitionState::Unassigned,
        to: PartitionState::Reassigning,
    };
    let display = err.to_string();
    assert!(display.contains("orders/3"), "{}", display);
    assert!(display.contains("UNASSIGNED"), "{}", display);
    assert!(display.contains("REASSIGNING"), "{}", display);
    assert!(err.operation().is_none());
    assert!(!err.is_lock_error());
}

#[test]
fn test_corrupted_data_from_decoder() {
    let codec_error = PartitionRecord::decode(b"a:b").unwrap_err();
    assert!(matches!(codec_error, CodecError::FieldCount { actual: 2 }));

    let codec_error = PartitionRecord::decode(b"a::OWNED").unwrap_err();
    assert!(matches!(codec_error, CodecError::UnknownState(_)));
    assert!(codec_error.to_string().contains("OWNED"));
}

#[test]
fn test_lock_lost_is_lock_error() {
    let err = SubscriptionError::LockLost {
        subscription_id: "s".to_string(),
        path: "/nakadi/locks/subscription_s".to_string(),
    };
    assert!(err.is_lock_error());
    assert!(err.store_error().is_none());
    assert!(!err.is_connection_loss());
}

#[test]
fn test_watch_not_armed_display() {
    let err = SubscriptionError::WatchNotArmed {
        path: "/nakadi/subscriptions/s/topology".to_string(),
    };
    assert!(err.to_string().contains("/nakadi/subscriptions/s/topology"));
}

#[tokio::test]
async fn test_invalid_subscription_id_rejected() {
    for id in ["", "a/b", "..", "."] {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let err = SubscriptionClient::new(store, id, SubscriptionConfig::default()).unwrap_err();
        assert!(
            matches!(err, SubscriptionError::InvalidIdentifier { .. }),
            "{:?} -> {:?}",
            id,
            err
        );
    }
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let store = std::sync::Arc::new(InMemoryStore::new());
    let config = SubscriptionConfig {
        partition_progress_log_interval: 0,
        ..Default::default()
    };
    let err = SubscriptionClient::new(store, "s", config).unwrap_err();
    assert!(matches!(err, SubscriptionError::Config(_)));
    assert!(err.to_string().contains("partition_progress_log_interval"));
}

#[tokio::test]
async fn test_coordination_error_carries_operation_and_path() {
    let store = InMemoryStore::new();
    let client = SubscriptionClient::new(
        std::sync::Arc::new(store.clone()),
        "sub-e",
        SubscriptionConfig::default(),
    )
    .unwrap();

    let err = client.get_topology_version().await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.operation(), Some("get_topology_version"));
    let display = err.to_string();
    assert!(display.contains("sub-e"), "{}", display);
    assert!(display.contains("/nakadi/subscriptions/sub-e/topology"), "{}", display);
}
