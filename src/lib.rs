//! # Nakadi Subscription
//! Coordination core for subscriptions to a partitioned event stream.
//!
//! A subscription is consumed by a group of independent sessions. This crate
//! gives them a single, globally agreed view of who reads which partition,
//! built on a strongly consistent, watchable coordination store
//! (ZooKeeper-style: versioned nodes, ephemeral nodes, one-shot watches):
//!
//! - a distributed lock serializing rebalancing steps
//! - the persisted partition, session and topology model
//! - the partition ownership state machine, including handover (`transfer`)
//! - an ephemeral session registry
//! - rearmable change notifications for membership, topology and offsets
//!
//! The rebalancing policy itself is not part of this crate; it is built on
//! these primitives.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use nakadi_subscription::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryStore::new());
//! let client = SubscriptionClient::new(store, "sub-1", SubscriptionConfig::default())?;
//!
//! let offsets = BTreeMap::from([
//!     (PartitionKey::new("orders", "0"), 0),
//!     (PartitionKey::new("orders", "1"), 0),
//! ]);
//! client
//!     .run_locked(|locked| {
//!         Box::pin(async move {
//!             if locked.create_subscription().await? {
//!                 locked.fill_empty_subscription(&offsets).await?;
//!             }
//!             locked.register_session(&Session::new("s-1", 1)).await
//!         })
//!     })
//!     .await?;
//!
//! let mut topology = client.subscribe_topology().await?;
//! topology.changed().await?;
//! let partitions = client.list_partitions().await?;
//! # let _ = partitions;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod constants;
pub mod store;
pub mod subscription;
pub mod telemetry;

pub mod prelude {
    //! Common imports.

    pub use crate::store::{CoordinationStore, InMemoryStore, SharedStore, StoreError};
    pub use crate::subscription::{
        ChangeKind, LockedSubscription, Notification, Partition, PartitionKey, PartitionState,
        Session, SubscriptionClient, SubscriptionConfig, SubscriptionError, SubscriptionResult,
        WatchHandle,
    };
}
