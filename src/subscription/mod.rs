//! Subscription coordination core.
//!
//! # Architecture
//!
//! ```text
//! SubscriptionClient ──reads/watches──► CoordinationStore
//!        │                                      ▲
//!        └─lock()/run_locked()──► LockedSubscription ──mutations──┘
//!                                       │
//!                                   LockGuard (ephemeral lock node)
//! ```
//!
//! A rebalancer takes the lock, reads sessions and partitions, writes new
//! partition records, bumps the topology version once and releases the
//! lock. Every session watches the topology and session membership and
//! re-reads the state when notified.
//!
//! # Modules
//!
//! - [`client`]: read operations, watches, lock entry points and mutations
//! - [`lock`]: ephemeral-node mutual exclusion
//! - [`partition_state`]: ownership records and legal transitions
//! - [`keys`]: path scheme and stored value encodings
//! - [`watch`]: one-shot rearmable notifications and listener loops

pub mod client;
pub mod config;
pub mod error;
pub mod keys;
pub mod lock;
pub mod metrics;
pub mod partition_state;
pub mod retry;
pub mod session;
pub mod watch;

pub use client::{LockedSubscription, SubscriptionClient};
pub use config::SubscriptionConfig;
pub use error::{SubscriptionError, SubscriptionResult};
pub use keys::{CodecError, PartitionRecord, RecordEncoding, SubscriptionPaths};
pub use lock::{DistributedLock, LockGuard};
pub use partition_state::{Partition, PartitionKey, PartitionState};
pub use session::Session;
pub use watch::{ChangeKind, ListenerHandle, Notification, WatchHandle};
