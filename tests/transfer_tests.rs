//! Tests for partition handover between sessions.
//!
//! A partition being handed over is `REASSIGNING` with `session` = releasing
//! session and `next_session` = receiving session. `transfer` completes the
//! handover and bumps the topology version once per batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use nakadi_subscription::prelude::*;

fn key(partition: &str) -> PartitionKey {
    PartitionKey::new("orders", partition)
}

async fn setup(partitions: usize) -> SubscriptionClient {
    let store = InMemoryStore::new();
    let client = SubscriptionClient::new(Arc::new(store), "sub-t", SubscriptionConfig::default())
        .expect("valid client");
    let offsets: BTreeMap<PartitionKey, i64> =
        (0..partitions).map(|i| (key(&i.to_string()), 0)).collect();
    client
        .run_locked(move |locked| {
            Box::pin(async move {
                locked.create_subscription().await?;
                locked.fill_empty_subscription(&offsets).await
            })
        })
        .await
        .expect("fill succeeds");
    client
}

/// Move `partition` to `REASSIGNING` from `from` to `to`.
async fn start_handover(client: &SubscriptionClient, partition: &str, from: &str, to: &str) {
    let steps = vec![
        Partition::new(
            key(partition),
            Some(from.to_string()),
            None,
            PartitionState::Assigned,
        ),
        Partition::new(
            key(partition),
            Some(from.to_string()),
            Some(to.to_string()),
            PartitionState::Reassigning,
        ),
    ];
    client
        .run_locked(move |locked| {
            Box::pin(async move {
                for step in &steps {
                    locked.update_partition_configuration(step).await?;
                }
                Ok(())
            })
        })
        .await
        .expect("handover started");
}

async fn transfer(
    client: &SubscriptionClient,
    session_id: &str,
    keys: Vec<PartitionKey>,
) -> SubscriptionResult<usize> {
    let session_id = session_id.to_string();
    client
        .run_locked(move |locked| {
            Box::pin(async move { locked.transfer(&session_id, &keys).await })
        })
        .await
}

#[tokio::test]
async fn test_transfer_completes_handover() {
    let client = setup(1).await;
    start_handover(&client, "0", "s", "t").await;
    let before = client.get_topology_version().await.unwrap();

    let moved = transfer(&client, "s", vec![key("0")]).await.unwrap();
    assert_eq!(moved, 1);

    let partition = client.get_partition(&key("0")).await.unwrap();
    assert_eq!(partition.state(), PartitionState::Assigned);
    assert_eq!(partition.session(), Some("t"));
    assert_eq!(partition.next_session(), None);
    assert_eq!(client.get_topology_version().await.unwrap(), before + 1);
}

#[tokio::test]
async fn test_transfer_by_other_session_is_noop() {
    let client = setup(1).await;
    start_handover(&client, "0", "s", "t").await;
    let before = client.get_partition(&key("0")).await.unwrap();
    let version = client.get_topology_version().await.unwrap();

    assert_eq!(transfer(&client, "x", vec![key("0")]).await.unwrap(), 0);
    // The receiving session cannot complete the handover either.
    assert_eq!(transfer(&client, "t", vec![key("0")]).await.unwrap(), 0);

    assert_eq!(client.get_partition(&key("0")).await.unwrap(), before);
    assert_eq!(client.get_topology_version().await.unwrap(), version);
}

#[tokio::test]
async fn test_transfer_skips_partitions_not_reassigning() {
    let client = setup(2).await;
    let owned = Partition::new(key("0"), Some("s".to_string()), None, PartitionState::Assigned);
    let write = owned.clone();
    client
        .run_locked(move |locked| {
            Box::pin(async move { locked.update_partition_configuration(&write).await })
        })
        .await
        .unwrap();

    let moved = transfer(&client, "s", vec![key("0"), key("1")]).await.unwrap();
    assert_eq!(moved, 0);
    assert_eq!(client.get_partition(&key("0")).await.unwrap(), owned);
    assert_eq!(
        client.get_partition(&key("1")).await.unwrap().state(),
        PartitionState::Unassigned
    );
    assert_eq!(client.get_topology_version().await.unwrap(), 0);
}

#[tokio::test]
async fn test_transfer_batch_bumps_topology_once() {
    let client = setup(4).await;
    start_handover(&client, "0", "s", "t").await;
    start_handover(&client, "1", "s", "u").await;
    start_handover(&client, "2", "other", "t").await;

    let moved = transfer(&client, "s", vec![key("0"), key("1"), key("2"), key("3")])
        .await
        .unwrap();
    assert_eq!(moved, 2);
    assert_eq!(client.get_topology_version().await.unwrap(), 1);

    let partitions = client.list_partitions().await.unwrap();
    assert!(partitions[0].is_owned_by("t"));
    assert!(partitions[1].is_owned_by("u"));
    assert_eq!(partitions[2].state(), PartitionState::Reassigning);
    assert!(partitions[2].is_owned_by("other"));
    assert_eq!(partitions[3].state(), PartitionState::Unassigned);
}

#[tokio::test]
async fn test_transfer_of_empty_list() {
    let client = setup(1).await;
    assert_eq!(transfer(&client, "s", Vec::new()).await.unwrap(), 0);
    assert_eq!(client.get_topology_version().await.unwrap(), 0);
}

#[tokio::test]
async fn test_transfer_of_unknown_partition_fails() {
    let client = setup(1).await;
    let err = transfer(&client, "s", vec![key("7")]).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.operation(), Some("transfer"));
}

#[tokio::test]
async fn test_transferred_partition_can_be_reassigned_again() {
    let client = setup(1).await;
    start_handover(&client, "0", "s", "t").await;
    transfer(&client, "s", vec![key("0")]).await.unwrap();

    start_handover_from_assigned(&client, "0", "t", "s").await;
    assert_eq!(transfer(&client, "t", vec![key("0")]).await.unwrap(), 1);
    assert!(client.get_partition(&key("0")).await.unwrap().is_owned_by("s"));
    assert_eq!(client.get_topology_version().await.unwrap(), 2);
}

async fn start_handover_from_assigned(
    client: &SubscriptionClient,
    partition: &str,
    from: &str,
    to: &str,
) {
    let step = Partition::new(
        key(partition),
        Some(from.to_string()),
        Some(to.to_string()),
        PartitionState::Reassigning,
    );
    client
        .run_locked(move |locked| {
            Box::pin(async move { locked.update_partition_configuration(&step).await })
        })
        .await
        .expect("handover started");
}
