//! Tests for the metrics module.
//!
//! Metrics live in a process-global registry, so tests that compare counter
//! values before and after an operation run serially.

use std::collections::BTreeMap;
use std::sync::Arc;

use nakadi_subscription::prelude::*;
use nakadi_subscription::subscription::metrics;
use serial_test::serial;

/// Sum of all samples of a metric family, optionally restricted to one label value.
fn metric_total(name: &str, label: Option<(&str, &str)>) -> f64 {
    metrics::gather_metrics()
        .iter()
        .filter(|family| family.get_name() == name)
        .flat_map(|family| family.get_metric())
        .filter(|metric| {
            label.is_none_or(|(key, value)| {
                metric
                    .get_label()
                    .iter()
                    .any(|pair| pair.get_name() == key && pair.get_value() == value)
            })
        })
        .map(|metric| {
            if metric.has_counter() {
                metric.get_counter().get_value()
            } else {
                metric.get_histogram().get_sample_count() as f64
            }
        })
        .sum()
}

async fn initialized_client(store: &InMemoryStore) -> SubscriptionClient {
    let client = SubscriptionClient::new(
        Arc::new(store.clone()),
        "sub-metrics",
        SubscriptionConfig::default(),
    )
    .unwrap();
    let offsets = BTreeMap::from([(PartitionKey::new("orders", "0"), 0)]);
    client
        .run_locked(move |locked| {
            Box::pin(async move {
                locked.create_subscription().await?;
                locked.fill_empty_subscription(&offsets).await
            })
        })
        .await
        .unwrap();
    client
}

#[test]
fn test_encode_metrics_uses_prefix() {
    metrics::init_metrics();
    metrics::record_topology_increment();
    let text = metrics::encode_metrics().expect("encodes");
    assert!(text.contains("nakadi_subscription_topology_increments_total"));
}

#[tokio::test]
#[serial]
async fn test_lock_acquisitions_are_counted() {
    let store = InMemoryStore::new();
    let client = initialized_client(&store).await;
    let name = "nakadi_subscription_lock_acquisitions_total";
    let before = metric_total(name, Some(("outcome", "acquired")));

    client.lock().await.unwrap().release().await.unwrap();

    let after = metric_total(name, Some(("outcome", "acquired")));
    assert_eq!(after - before, 1.0);
}

#[tokio::test]
#[serial]
async fn test_transfer_records_partition_and_topology_metrics() {
    let store = InMemoryStore::new();
    let client = initialized_client(&store).await;
    let key = PartitionKey::new("orders", "0");
    let steps = vec![
        Partition::new(key.clone(), Some("s".into()), None, PartitionState::Assigned),
        Partition::new(
            key.clone(),
            Some("s".into()),
            Some("t".into()),
            PartitionState::Reassigning,
        ),
    ];

    let writes_before = metric_total(
        "nakadi_subscription_partition_writes_total",
        Some(("state", "ASSIGNED")),
    );
    let transferred_before = metric_total("nakadi_subscription_partitions_transferred_total", None);
    let topology_before = metric_total("nakadi_subscription_topology_increments_total", None);

    client
        .run_locked(move |locked| {
            Box::pin(async move {
                for step in &steps {
                    locked.update_partition_configuration(step).await?;
                }
                locked.transfer("s", &[key]).await
            })
        })
        .await
        .unwrap();

    assert_eq!(
        metric_total(
            "nakadi_subscription_partition_writes_total",
            Some(("state", "ASSIGNED"))
        ) - writes_before,
        2.0
    );
    assert_eq!(
        metric_total("nakadi_subscription_partitions_transferred_total", None) - transferred_before,
        1.0
    );
    assert_eq!(
        metric_total("nakadi_subscription_topology_increments_total", None) - topology_before,
        1.0
    );
}

#[tokio::test]
#[serial]
async fn test_session_operations_are_counted_by_status() {
    let store = InMemoryStore::new();
    let client = initialized_client(&store).await;
    let name = "nakadi_subscription_session_registrations_total";
    let ok_before = metric_total(name, Some(("status", "ok")));
    let error_before = metric_total(name, Some(("status", "error")));

    client
        .run_locked(|locked| {
            Box::pin(async move {
                let session = Session::new("a", 1);
                locked.register_session(&session).await?;
                let duplicate = locked.register_session(&session).await;
                assert!(duplicate.unwrap_err().is_node_exists());
                locked.unregister_session(&session).await
            })
        })
        .await
        .unwrap();

    assert_eq!(metric_total(name, Some(("status", "ok"))) - ok_before, 2.0);
    assert_eq!(
        metric_total(name, Some(("status", "error"))) - error_before,
        1.0
    );
}

#[tokio::test]
#[serial]
async fn test_watch_notifications_are_counted_by_kind() {
    let store = InMemoryStore::new();
    let client = initialized_client(&store).await;
    let name = "nakadi_subscription_watch_notifications_total";
    let before = metric_total(name, Some(("kind", "topology")));

    let mut topology = client.subscribe_topology().await.unwrap();
    client
        .run_locked(|locked| Box::pin(async move { locked.increment_topology().await }))
        .await
        .unwrap();
    topology.changed().await.unwrap();

    assert_eq!(metric_total(name, Some(("kind", "topology"))) - before, 1.0);
}
