//! Subscription-scoped distributed lock.
//!
//! # Protocol
//!
//! 1. Create an ephemeral node at the lock path holding a random holder token
//! 2. If the node exists, register a data watch on it and wait for it to go
//!    away (released, or removed with its holder's session), then retry
//! 3. Release deletes the node only if it still carries our token
//!
//! The node being ephemeral means a crashed holder never blocks the
//! subscription for longer than its session timeout.
//!
//! The lock is not re-entrant: acquiring it again from the same holder waits
//! forever.

use std::time::Instant;

use tracing::{debug, error, warn};
use uuid::Uuid;

use super::error::{SubscriptionError, SubscriptionResult};
use super::metrics;
use crate::store::{CreateMode, SharedStore, StoreError, WatchKind, parent_path};

/// Mutual exclusion over one subscription, shared by every process using the store.
#[derive(Clone)]
pub struct DistributedLock {
    store: SharedStore,
    subscription_id: String,
    path: String,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("subscription_id", &self.subscription_id)
            .field("path", &self.path)
            .finish()
    }
}

impl DistributedLock {
    pub fn new(
        store: SharedStore,
        subscription_id: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            subscription_id: subscription_id.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait until the lock is held.
    ///
    /// There is no timeout; wrap the future in `tokio::time::timeout` for a
    /// bounded wait. Dropping the future before it resolves leaves no lock
    /// node behind unless creation already succeeded, in which case the node
    /// goes away with the session.
    pub async fn acquire(&self) -> SubscriptionResult<LockGuard> {
        let holder = Uuid::new_v4().to_string();
        let started = Instant::now();

        loop {
            match self
                .store
                .create(&self.path, holder.as_bytes(), CreateMode::Ephemeral)
                .await
            {
                Ok(_) => {
                    metrics::record_lock_acquired("acquired", started.elapsed().as_secs_f64());
                    debug!(
                        subscription_id = %self.subscription_id,
                        path = %self.path,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Subscription lock acquired"
                    );
                    return Ok(LockGuard {
                        state: LockState {
                            store: self.store.clone(),
                            subscription_id: self.subscription_id.clone(),
                            path: self.path.clone(),
                            holder,
                        },
                        released: false,
                    });
                }
                Err(StoreError::NodeExists { .. }) => {
                    let registration = self
                        .store
                        .watch(&self.path, WatchKind::Data)
                        .await
                        .map_err(|e| self.acquire_failed(e, started))?;
                    if registration.stat.is_none() {
                        // Released between our create and the watch.
                        continue;
                    }
                    debug!(
                        subscription_id = %self.subscription_id,
                        path = %self.path,
                        "Subscription lock held elsewhere, waiting"
                    );
                    // A closed channel means our own session ended; the next
                    // create attempt reports it.
                    let _ = registration.receiver.await;
                }
                Err(StoreError::NoNode { .. }) => {
                    if let Some(parent) = parent_path(&self.path) {
                        self.store
                            .ensure_path(parent)
                            .await
                            .map_err(|e| self.acquire_failed(e, started))?;
                    }
                }
                Err(e) => return Err(self.acquire_failed(e, started)),
            }
        }
    }

    fn acquire_failed(&self, source: StoreError, started: Instant) -> SubscriptionError {
        metrics::record_lock_acquired("failed", started.elapsed().as_secs_f64());
        warn!(
            subscription_id = %self.subscription_id,
            path = %self.path,
            error = %source,
            "Failed to acquire subscription lock"
        );
        SubscriptionError::coordination("lock.acquire", &self.subscription_id, &self.path, source)
    }
}

#[derive(Clone)]
struct LockState {
    store: SharedStore,
    subscription_id: String,
    path: String,
    holder: String,
}

impl LockState {
    async fn release(&self) -> SubscriptionResult<()> {
        let (data, stat) = match self.store.get_data(&self.path).await {
            Ok(found) => found,
            Err(StoreError::NoNode { .. }) => {
                warn!(
                    subscription_id = %self.subscription_id,
                    path = %self.path,
                    "Lock node already gone on release"
                );
                return Ok(());
            }
            Err(e) => return Err(self.release_failed(e)),
        };

        if data.as_ref() != self.holder.as_bytes() {
            metrics::record_lock_release_failure();
            error!(
                subscription_id = %self.subscription_id,
                path = %self.path,
                "Lock node is owned by another holder"
            );
            return Err(SubscriptionError::LockLost {
                subscription_id: self.subscription_id.clone(),
                path: self.path.clone(),
            });
        }

        match self.store.delete(&self.path, Some(stat.version)).await {
            Ok(()) => {
                debug!(
                    subscription_id = %self.subscription_id,
                    path = %self.path,
                    "Subscription lock released"
                );
                Ok(())
            }
            Err(StoreError::NoNode { .. }) => {
                warn!(
                    subscription_id = %self.subscription_id,
                    path = %self.path,
                    "Lock node already gone on release"
                );
                Ok(())
            }
            Err(e) => Err(self.release_failed(e)),
        }
    }

    fn release_failed(&self, source: StoreError) -> SubscriptionError {
        metrics::record_lock_release_failure();
        error!(
            subscription_id = %self.subscription_id,
            path = %self.path,
            error = %source,
            "Failed to release subscription lock"
        );
        SubscriptionError::coordination("lock.release", &self.subscription_id, &self.path, source)
    }
}

/// Proof of holding a subscription lock.
///
/// Release it with [`LockGuard::release`] to observe failures. A guard
/// dropped without release (panic, cancelled task) schedules a best-effort
/// release on the current tokio runtime.
pub struct LockGuard {
    state: LockState,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.state.path)
            .field("holder", &self.state.holder)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub fn path(&self) -> &str {
        &self.state.path
    }

    pub fn subscription_id(&self) -> &str {
        &self.state.subscription_id
    }

    /// Token stored in the lock node while held.
    pub fn holder(&self) -> &str {
        &self.state.holder
    }

    /// Release the lock.
    ///
    /// A lock node that already disappeared counts as released. A node now
    /// carrying another holder's token yields `LockLost`.
    pub async fn release(mut self) -> SubscriptionResult<()> {
        self.released = true;
        self.state.release().await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let state = self.state.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    subscription_id = %state.subscription_id,
                    path = %state.path,
                    "Lock guard dropped without release, releasing in background"
                );
                handle.spawn(async move {
                    // Failures are logged and counted by release itself.
                    let _ = state.release().await;
                });
            }
            Err(_) => {
                error!(
                    subscription_id = %state.subscription_id,
                    path = %state.path,
                    "Lock guard dropped outside a runtime; lock node stays until its session ends"
                );
            }
        }
    }
}
