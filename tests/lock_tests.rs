//! Subscription lock tests across independent store connections.
//!
//! Each client runs on its own connection, the way separate processes would,
//! so lock hand-off goes through the store's watches and ephemeral nodes.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use nakadi_subscription::prelude::*;
use tokio::task::JoinSet;
use tokio::time::timeout;

const SUBSCRIPTION: &str = "sub-lock";

fn client_on(connection: &InMemoryStore) -> SubscriptionClient {
    SubscriptionClient::new(
        Arc::new(connection.clone()),
        SUBSCRIPTION,
        SubscriptionConfig::default(),
    )
    .expect("valid client")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_locked_sections_never_overlap() {
    let store = InMemoryStore::new();
    let inside = Arc::new(AtomicI32::new(0));
    let max_inside = Arc::new(AtomicI32::new(0));
    let completed = Arc::new(AtomicI32::new(0));

    let mut tasks = JoinSet::new();
    for _ in 0..6 {
        let client = client_on(&store.connect());
        let inside = Arc::clone(&inside);
        let max_inside = Arc::clone(&max_inside);
        let completed = Arc::clone(&completed);
        tasks.spawn(async move {
            for _ in 0..5 {
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                let completed = Arc::clone(&completed);
                client
                    .run_locked(move |_| {
                        Box::pin(async move {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(1)).await;
                            inside.fetch_sub(1, Ordering::SeqCst);
                            completed.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                    })
                    .await
                    .expect("locked section");
            }
        });
    }

    let all = async {
        while let Some(joined) = tasks.join_next().await {
            joined.expect("task panicked");
        }
    };
    timeout(Duration::from_secs(30), all)
        .await
        .expect("lock hand-off stalled");

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(completed.load(Ordering::SeqCst), 30);
    assert!(
        store
            .exists("/nakadi/locks/subscription_sub-lock")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_lock_passes_on_when_holder_session_expires() {
    let store = InMemoryStore::new();
    let holder_connection = store.connect();
    let holder = client_on(&holder_connection);
    let waiter = client_on(&store.connect());

    let held = holder.lock().await.unwrap();
    let waiting = tokio::spawn(async move {
        waiter
            .run_locked(|locked| {
                Box::pin(async move { Ok(locked.lock_guard().holder().to_string()) })
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiting.is_finished(), "waiter must block while lock is held");

    assert_eq!(holder_connection.expire_session().await, 1);
    let waiter_holder = timeout(Duration::from_secs(5), waiting)
        .await
        .expect("waiter should acquire after expiry")
        .unwrap()
        .unwrap();
    assert_ne!(waiter_holder, held.lock_guard().holder());

    // The old holder's session is gone, so its release fails.
    let err = held.release().await.unwrap_err();
    assert!(err.is_lock_error());
    assert!(matches!(
        err.store_error(),
        Some(StoreError::SessionExpired { .. })
    ));
}

#[tokio::test]
async fn test_release_failure_surfaces_from_run_locked() {
    let store = InMemoryStore::new();
    let connection = store.connect();
    let client = client_on(&connection);

    let result = client
        .run_locked(|locked| {
            let connection = connection.clone();
            Box::pin(async move {
                let version = locked.get_topology_version().await;
                // Fail the release's first store call.
                connection.inject_connection_loss(1);
                Ok(version.is_err())
            })
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.operation(), Some("lock.release"));
    assert!(err.is_connection_loss());

    // The node is still there and goes away with the session.
    let lock_path = "/nakadi/locks/subscription_sub-lock";
    assert!(store.exists(lock_path).await.unwrap().is_some());
    connection.expire_session().await;
    assert!(store.exists(lock_path).await.unwrap().is_none());
}

#[tokio::test]
async fn test_lock_and_release_explicitly() {
    let store = InMemoryStore::new();
    let client = client_on(&store);

    let locked = client.lock().await.unwrap();
    assert_eq!(locked.lock_guard().subscription_id(), SUBSCRIPTION);
    assert_eq!(
        locked.lock_guard().path(),
        "/nakadi/locks/subscription_sub-lock"
    );
    // Reads are available through the locked handle.
    assert!(!locked.is_initialized().await.unwrap());
    locked.release().await.unwrap();

    // And the lock can be taken again.
    client.lock().await.unwrap().release().await.unwrap();
}

#[tokio::test]
async fn test_clients_of_different_subscriptions_do_not_contend() {
    let store = InMemoryStore::new();
    let first = client_on(&store);
    let second = SubscriptionClient::new(
        Arc::new(store.connect()),
        "another-sub",
        SubscriptionConfig::default(),
    )
    .unwrap();

    let held = first.lock().await.unwrap();
    let other = timeout(Duration::from_secs(1), second.lock())
        .await
        .expect("other subscription's lock is independent")
        .unwrap();
    other.release().await.unwrap();
    held.release().await.unwrap();
}
