//! Subscription coordination client.
//!
//! [`SubscriptionClient`] exposes the read side (snapshots and change
//! watches) and the subscription lock. Every mutation lives on
//! [`LockedSubscription`], which only exists while the lock is held:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use nakadi_subscription::store::InMemoryStore;
//! use nakadi_subscription::subscription::{SubscriptionClient, SubscriptionConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SubscriptionClient::new(
//!     Arc::new(InMemoryStore::new()),
//!     "sub-1",
//!     SubscriptionConfig::default(),
//! )?;
//!
//! let version = client
//!     .run_locked(|locked| Box::pin(async move { locked.increment_topology().await }))
//!     .await;
//! # let _ = version;
//! # Ok(())
//! # }
//! ```
//!
//! Reads taken without the lock are point-in-time snapshots with no
//! consistency guarantee against concurrent writers.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use backon::Retryable;
use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use super::config::SubscriptionConfig;
use super::error::{SubscriptionError, SubscriptionResult};
use super::keys::{
    CodecError, PartitionRecord, SubscriptionPaths, decode_number, encode_number,
    validate_identifier, validate_session_id,
};
use super::lock::{DistributedLock, LockGuard};
use super::metrics;
use super::partition_state::{Partition, PartitionKey, PartitionState};
use super::retry;
use super::session::Session;
use super::watch::{ChangeKind, WatchHandle};
use crate::constants::{INITIAL_TOPOLOGY_VERSION, STATE_INITIALIZED};
use crate::store::{CreateMode, SharedStore, Stat, StoreError};

struct Inner {
    store: SharedStore,
    subscription_id: String,
    paths: SubscriptionPaths,
    config: SubscriptionConfig,
    lock: DistributedLock,
}

impl Inner {
    fn fail(&self, operation: &'static str, path: &str, source: StoreError) -> SubscriptionError {
        SubscriptionError::coordination(operation, &self.subscription_id, path, source)
    }

    fn corrupted(&self, path: &str, source: CodecError) -> SubscriptionError {
        SubscriptionError::CorruptedData {
            subscription_id: self.subscription_id.clone(),
            path: path.to_string(),
            source,
        }
    }

    async fn get(&self, operation: &'static str, path: &str) -> SubscriptionResult<(Bytes, Stat)> {
        self.store
            .get_data(path)
            .await
            .map_err(|e| self.fail(operation, path, e))
    }

    async fn read_partition(
        &self,
        operation: &'static str,
        key: &PartitionKey,
    ) -> SubscriptionResult<(Partition, Stat)> {
        let path = self.paths.partition(key);
        let (data, stat) = self.get(operation, &path).await?;
        let record = PartitionRecord::decode(&data).map_err(|e| self.corrupted(&path, e))?;
        Ok((record.into_partition(key.clone()), stat))
    }
}

/// Coordination client for one subscription.
///
/// Cheap to clone; clones share the store connection and configuration.
#[derive(Clone)]
pub struct SubscriptionClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for SubscriptionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionClient")
            .field("subscription_id", &self.inner.subscription_id)
            .field("root_path", &self.inner.config.root_path)
            .finish()
    }
}

impl SubscriptionClient {
    pub fn new(
        store: SharedStore,
        subscription_id: impl Into<String>,
        config: SubscriptionConfig,
    ) -> SubscriptionResult<Self> {
        let subscription_id = subscription_id.into();
        validate_identifier("subscription id", &subscription_id)?;
        config
            .validate()
            .map_err(|errors| SubscriptionError::Config(errors.join("; ")))?;

        let paths = SubscriptionPaths::new(&config.root_path, &subscription_id);
        let lock = DistributedLock::new(store.clone(), subscription_id.clone(), paths.lock());
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                subscription_id,
                paths,
                config,
                lock,
            }),
        })
    }

    pub fn subscription_id(&self) -> &str {
        &self.inner.subscription_id
    }

    pub fn paths(&self) -> &SubscriptionPaths {
        &self.inner.paths
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.inner.config
    }

    // =========================================================================
    // Lock
    // =========================================================================

    /// Wait for the subscription lock and return the mutation handle.
    ///
    /// Prefer [`run_locked`](Self::run_locked), which always releases. A
    /// handle from this method must be released with
    /// [`LockedSubscription::release`] to observe release failures.
    pub async fn lock(&self) -> SubscriptionResult<LockedSubscription> {
        let guard = self.inner.lock.acquire().await?;
        Ok(LockedSubscription {
            client: self.clone(),
            guard,
        })
    }

    /// Run `section` while holding the subscription lock.
    ///
    /// The lock is released on every exit path. A release failure is
    /// returned even when the section succeeded; when both fail, the
    /// section's error is logged and the release error returned.
    ///
    /// The lock is not re-entrant: calling this from inside `section` on the
    /// same subscription never completes.
    pub async fn run_locked<T, F>(&self, section: F) -> SubscriptionResult<T>
    where
        F: for<'g> FnOnce(&'g LockedSubscription) -> BoxFuture<'g, SubscriptionResult<T>> + Send,
        T: Send,
    {
        debug!(subscription_id = %self.inner.subscription_id, "Taking subscription lock");
        let locked = self.lock().await?;
        let result = section(&locked).await;
        let released = locked.release().await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(release_error)) => Err(release_error),
            (Err(e), Err(release_error)) => {
                error!(
                    subscription_id = %self.inner.subscription_id,
                    error = %e,
                    "Locked section failed and the lock could not be released"
                );
                Err(release_error)
            }
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Check if `fill_empty_subscription` has completed.
    pub async fn is_initialized(&self) -> SubscriptionResult<bool> {
        let path = self.inner.paths.state();
        match self.inner.store.get_data(&path).await {
            Ok((data, _)) => Ok(data.as_ref() == STATE_INITIALIZED.as_bytes()),
            Err(StoreError::NoNode { .. }) => Ok(false),
            Err(e) => Err(self.inner.fail("is_initialized", &path, e)),
        }
    }

    /// Snapshot of all partitions, sorted by key.
    pub async fn list_partitions(&self) -> SubscriptionResult<Vec<Partition>> {
        const OP: &str = "list_partitions";
        debug!(subscription_id = %self.inner.subscription_id, "Fetching partitions");

        let store = &self.inner.store;
        let topics_path = self.inner.paths.topics();
        let topics = store
            .get_children(&topics_path)
            .await
            .map_err(|e| self.inner.fail(OP, &topics_path, e))?;

        let mut partitions = Vec::new();
        for topic in topics {
            let topic_path = self.inner.paths.topic(&topic);
            let names = store
                .get_children(&topic_path)
                .await
                .map_err(|e| self.inner.fail(OP, &topic_path, e))?;
            for name in names {
                let key = PartitionKey::new(topic.clone(), name);
                let (partition, _) = self.inner.read_partition(OP, &key).await?;
                partitions.push(partition);
            }
        }
        partitions.sort_by(|a, b| a.key().cmp(b.key()));
        Ok(partitions)
    }

    pub async fn get_partition(&self, key: &PartitionKey) -> SubscriptionResult<Partition> {
        let (partition, _) = self.inner.read_partition("get_partition", key).await?;
        Ok(partition)
    }

    /// Snapshot of the registered sessions, sorted by id.
    ///
    /// Sessions leaving while the snapshot is taken are left out.
    pub async fn list_sessions(&self) -> SubscriptionResult<Vec<Session>> {
        const OP: &str = "list_sessions";
        debug!(subscription_id = %self.inner.subscription_id, "Fetching sessions");

        let sessions_path = self.inner.paths.sessions();
        let ids = self
            .inner
            .store
            .get_children(&sessions_path)
            .await
            .map_err(|e| self.inner.fail(OP, &sessions_path, e))?;

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            let path = self.inner.paths.session(&id);
            let data = match self.inner.store.get_data(&path).await {
                Ok((data, _)) => data,
                Err(StoreError::NoNode { .. }) => continue,
                Err(e) => return Err(self.inner.fail(OP, &path, e)),
            };
            let weight = decode_number(&data).map_err(|e| self.inner.corrupted(&path, e))?;
            sessions.push(Session::new(id, weight));
        }
        sessions.sort();
        Ok(sessions)
    }

    /// Committed offset of a partition.
    pub async fn get_offset(&self, key: &PartitionKey) -> SubscriptionResult<i64> {
        let path = self.inner.paths.offset(key);
        let (data, _) = self.inner.get("get_offset", &path).await?;
        decode_number(&data).map_err(|e| self.inner.corrupted(&path, e))
    }

    pub async fn get_topology_version(&self) -> SubscriptionResult<u64> {
        let path = self.inner.paths.topology();
        let (data, _) = self.inner.get("get_topology_version", &path).await?;
        decode_number(&data).map_err(|e| self.inner.corrupted(&path, e))
    }

    // =========================================================================
    // Watches
    // =========================================================================

    /// Watch for sessions joining or leaving, including sessions lost with
    /// their connection.
    pub async fn subscribe_session_membership(&self) -> SubscriptionResult<WatchHandle> {
        self.subscribe(ChangeKind::SessionMembership, self.inner.paths.sessions())
            .await
    }

    /// Watch for topology version changes.
    pub async fn subscribe_topology(&self) -> SubscriptionResult<WatchHandle> {
        self.subscribe(ChangeKind::Topology, self.inner.paths.topology())
            .await
    }

    /// Watch for commits to a partition's offset.
    pub async fn subscribe_offset(&self, key: &PartitionKey) -> SubscriptionResult<WatchHandle> {
        self.subscribe(ChangeKind::Offset, self.inner.paths.offset(key))
            .await
    }

    async fn subscribe(&self, kind: ChangeKind, path: String) -> SubscriptionResult<WatchHandle> {
        debug!(
            subscription_id = %self.inner.subscription_id,
            kind = %kind,
            path = %path,
            "Subscribing for changes"
        );
        WatchHandle::arm(
            self.inner.store.clone(),
            &self.inner.subscription_id,
            kind,
            path,
            retry::watch_rearm_policy(&self.inner.config),
        )
        .await
    }
}

/// Mutation handle, available only while the subscription lock is held.
///
/// Dereferences to [`SubscriptionClient`] for reads.
pub struct LockedSubscription {
    client: SubscriptionClient,
    guard: LockGuard,
}

impl fmt::Debug for LockedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedSubscription")
            .field("subscription_id", &self.client.inner.subscription_id)
            .field("lock", &self.guard)
            .finish()
    }
}

impl Deref for LockedSubscription {
    type Target = SubscriptionClient;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl LockedSubscription {
    pub fn lock_guard(&self) -> &LockGuard {
        &self.guard
    }

    /// Release the subscription lock.
    pub async fn release(self) -> SubscriptionResult<()> {
        debug!(subscription_id = %self.client.inner.subscription_id, "Releasing subscription lock");
        self.guard.release().await
    }

    /// Initialize the subscription or detect a failed initialization.
    ///
    /// Returns `true` if the subscription was just created or an earlier
    /// initialization did not complete, i.e. `fill_empty_subscription`
    /// should run. Returns `false` for an initialized subscription.
    pub async fn create_subscription(&self) -> SubscriptionResult<bool> {
        const OP: &str = "create_subscription";
        let inner = &self.client.inner;
        let state_path = inner.paths.state();

        match inner.store.get_data(&state_path).await {
            Ok((data, _)) => Ok(data.as_ref() != STATE_INITIALIZED.as_bytes()),
            Err(StoreError::NoNode { .. }) => {
                inner
                    .store
                    .ensure_path(inner.paths.base())
                    .await
                    .map_err(|e| inner.fail(OP, inner.paths.base(), e))?;
                match inner
                    .store
                    .create(&state_path, &[], CreateMode::Persistent)
                    .await
                {
                    Ok(_) | Err(StoreError::NodeExists { .. }) => {}
                    Err(e) => return Err(inner.fail(OP, &state_path, e)),
                }
                info!(subscription_id = %inner.subscription_id, "Subscription created");
                Ok(true)
            }
            Err(e) => Err(inner.fail(OP, &state_path, e)),
        }
    }

    /// Reset the subscription tree and mark it initialized.
    ///
    /// Removes existing sessions, partitions and topology, then creates one
    /// `UNASSIGNED` record per partition with its starting offset and a
    /// topology counter at its initial value. A partially written tree from
    /// an earlier attempt is deleted, not merged.
    pub async fn fill_empty_subscription(
        &self,
        start_offsets: &BTreeMap<PartitionKey, i64>,
    ) -> SubscriptionResult<()> {
        const OP: &str = "fill_empty_subscription";
        let inner = &self.client.inner;
        let store = &inner.store;
        let paths = &inner.paths;
        let id = inner.subscription_id.as_str();

        for key in start_offsets.keys() {
            validate_identifier("topic", &key.topic)?;
            validate_identifier("partition", &key.partition)?;
        }
        let topics_path = paths.topics();
        let unassigned = PartitionRecord {
            session: None,
            next_session: None,
            state: PartitionState::Unassigned,
        }
        .encode(inner.config.record_encoding)
        .map_err(|e| inner.corrupted(&topics_path, e))?;

        store
            .ensure_path(paths.base())
            .await
            .map_err(|e| inner.fail(OP, paths.base(), e))?;

        info!(subscription_id = %id, "Creating sessions root");
        let sessions_path = paths.sessions();
        recreate(store, &sessions_path)
            .await
            .map_err(|e| inner.fail(OP, &sessions_path, e))?;

        info!(subscription_id = %id, "Creating topics");
        recreate(store, &topics_path)
            .await
            .map_err(|e| inner.fail(OP, &topics_path, e))?;

        info!(
            subscription_id = %id,
            partitions = start_offsets.len(),
            "Creating partitions"
        );
        let interval = inner.config.partition_progress_log_interval;
        let mut last_topic: Option<&str> = None;
        for (index, (key, offset)) in start_offsets.iter().enumerate() {
            if last_topic != Some(key.topic.as_str()) {
                let topic_path = paths.topic(&key.topic);
                store
                    .create(&topic_path, &[], CreateMode::Persistent)
                    .await
                    .map_err(|e| inner.fail(OP, &topic_path, e))?;
                last_topic = Some(key.topic.as_str());
            }

            let partition_path = paths.partition(key);
            store
                .create(&partition_path, &unassigned, CreateMode::Persistent)
                .await
                .map_err(|e| inner.fail(OP, &partition_path, e))?;
            let offset_path = paths.offset(key);
            store
                .create(&offset_path, &encode_number(offset), CreateMode::Persistent)
                .await
                .map_err(|e| inner.fail(OP, &offset_path, e))?;

            let created = index + 1;
            if created % interval == 0 {
                info!(subscription_id = %id, created, "Created partitions so far");
            }
        }

        info!(subscription_id = %id, "Creating topology node");
        let topology_path = paths.topology();
        match store.delete(&topology_path, None).await {
            Ok(()) | Err(StoreError::NoNode { .. }) => {}
            Err(e) => return Err(inner.fail(OP, &topology_path, e)),
        }
        store
            .create(
                &topology_path,
                &encode_number(INITIAL_TOPOLOGY_VERSION),
                CreateMode::Persistent,
            )
            .await
            .map_err(|e| inner.fail(OP, &topology_path, e))?;

        info!(subscription_id = %id, "Updating state");
        let state_path = paths.state();
        match store
            .set_data(&state_path, STATE_INITIALIZED.as_bytes(), None)
            .await
        {
            Ok(_) => {}
            Err(StoreError::NoNode { .. }) => {
                store
                    .create(
                        &state_path,
                        STATE_INITIALIZED.as_bytes(),
                        CreateMode::Persistent,
                    )
                    .await
                    .map_err(|e| inner.fail(OP, &state_path, e))?;
            }
            Err(e) => return Err(inner.fail(OP, &state_path, e)),
        }
        Ok(())
    }

    /// Overwrite a partition's ownership record.
    ///
    /// The record must be internally consistent. With strict transitions
    /// enabled it must also be a legal transition from the stored record.
    /// The topology version is not touched; call
    /// [`increment_topology`](Self::increment_topology) once the batch of
    /// updates is written.
    pub async fn update_partition_configuration(
        &self,
        partition: &Partition,
    ) -> SubscriptionResult<()> {
        const OP: &str = "update_partition_configuration";
        let inner = &self.client.inner;

        for session in [partition.session(), partition.next_session()]
            .into_iter()
            .flatten()
        {
            validate_session_id(session)?;
        }
        partition.validate()?;

        let expected_version = if inner.config.strict_transitions {
            let (current, stat) = inner.read_partition(OP, partition.key()).await?;
            current.validate_transition(partition)?;
            Some(stat.version)
        } else {
            None
        };
        self.write_partition(OP, partition, expected_version).await
    }

    /// Complete handovers away from `session_id`.
    ///
    /// Every listed partition owned by `session_id` and `REASSIGNING` becomes
    /// `ASSIGNED` to its next session. Other partitions are skipped. The
    /// topology version is incremented once if anything changed. Returns the
    /// number of partitions handed over.
    pub async fn transfer(
        &self,
        session_id: &str,
        keys: &[PartitionKey],
    ) -> SubscriptionResult<usize> {
        const OP: &str = "transfer";
        let inner = &self.client.inner;
        info!(
            subscription_id = %inner.subscription_id,
            session_id,
            partitions = keys.len(),
            "Session releases partitions"
        );

        let mut transferred = 0;
        for key in keys {
            let (current, stat) = inner.read_partition(OP, key).await?;
            if !(current.is_owned_by(session_id) && current.state() == PartitionState::Reassigning)
            {
                debug!(
                    subscription_id = %inner.subscription_id,
                    session_id,
                    partition = %key,
                    state = %current.state(),
                    "Skipping partition not being released by session"
                );
                continue;
            }
            let target = current.to_state(
                PartitionState::Assigned,
                current.next_session().map(str::to_string),
                None,
            );
            target.validate()?;
            self.write_partition(OP, &target, Some(stat.version)).await?;
            transferred += 1;
        }

        if transferred > 0 {
            metrics::record_partitions_transferred(transferred);
            self.increment_topology().await?;
        }
        Ok(transferred)
    }

    /// Bump the topology version and return the new value.
    pub async fn increment_topology(&self) -> SubscriptionResult<u64> {
        const OP: &str = "increment_topology";
        let inner = &self.client.inner;
        let path = inner.paths.topology();

        let (data, stat) = inner.get(OP, &path).await?;
        let current: u64 = decode_number(&data).map_err(|e| inner.corrupted(&path, e))?;
        let next = current + 1;
        inner
            .store
            .set_data(&path, &encode_number(next), Some(stat.version))
            .await
            .map_err(|e| inner.fail(OP, &path, e))?;

        metrics::record_topology_increment();
        info!(
            subscription_id = %inner.subscription_id,
            version = next,
            "Incremented topology version"
        );
        Ok(next)
    }

    /// Add a session to the registry.
    ///
    /// The record is ephemeral: it disappears with this client's store
    /// connection. A duplicate id fails (see
    /// [`SubscriptionError::is_node_exists`]).
    pub async fn register_session(&self, session: &Session) -> SubscriptionResult<()> {
        let inner = &self.client.inner;
        validate_session_id(&session.id)?;
        let path = inner.paths.session(&session.id);
        info!(
            subscription_id = %inner.subscription_id,
            session_id = %session.id,
            weight = session.weight,
            "Registering session"
        );

        match inner
            .store
            .create(&path, &encode_number(session.weight), CreateMode::Ephemeral)
            .await
        {
            Ok(_) => {
                metrics::record_session_operation("register", "ok");
                Ok(())
            }
            Err(e) => {
                metrics::record_session_operation("register", "error");
                Err(inner.fail("register_session", &path, e))
            }
        }
    }

    /// Remove a session from the registry.
    ///
    /// A session that is already gone counts as removed. Connection loss is
    /// retried with backoff; other store failures are returned.
    pub async fn unregister_session(&self, session: &Session) -> SubscriptionResult<()> {
        let inner = &self.client.inner;
        validate_session_id(&session.id)?;
        let path = inner.paths.session(&session.id);
        info!(
            subscription_id = %inner.subscription_id,
            session_id = %session.id,
            "Unregistering session"
        );

        let store = &inner.store;
        let target = path.as_str();
        let result = (move || async move {
            match store.delete(target, None).await {
                Ok(()) | Err(StoreError::NoNode { .. }) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .retry(retry::guaranteed_delete_policy(&inner.config))
        .when(retry::is_retriable_delete_error)
        .notify(|e, delay| {
            warn!(
                subscription_id = %inner.subscription_id,
                path = %target,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Session delete failed, retrying"
            );
        })
        .await;

        match result {
            Ok(()) => {
                metrics::record_session_operation("unregister", "ok");
                Ok(())
            }
            Err(e) => {
                metrics::record_session_operation("unregister", "error");
                Err(inner.fail("unregister_session", &path, e))
            }
        }
    }

    async fn write_partition(
        &self,
        operation: &'static str,
        partition: &Partition,
        expected_version: Option<i32>,
    ) -> SubscriptionResult<()> {
        let inner = &self.client.inner;
        let path = inner.paths.partition(partition.key());
        let data = PartitionRecord::from_partition(partition)
            .encode(inner.config.record_encoding)
            .map_err(|e| inner.corrupted(&path, e))?;

        info!(
            subscription_id = %inner.subscription_id,
            topic = %partition.key().topic,
            partition = %partition.key().partition,
            state = %partition.state(),
            session = partition.session().unwrap_or(""),
            next_session = partition.next_session().unwrap_or(""),
            "Updating partition state"
        );
        inner
            .store
            .set_data(&path, &data, expected_version)
            .await
            .map_err(|e| inner.fail(operation, &path, e))?;
        metrics::record_partition_write(partition.state().as_str());
        Ok(())
    }
}

/// Delete a node with its subtree and create it again, empty.
async fn recreate(store: &SharedStore, path: &str) -> Result<(), StoreError> {
    store.delete_recursive(path).await?;
    store.create(path, &[], CreateMode::Persistent).await?;
    Ok(())
}
