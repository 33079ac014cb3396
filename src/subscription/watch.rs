//! Change notifications.
//!
//! A [`WatchHandle`] wraps one store watch with fire-once-then-rearm
//! semantics:
//!
//! ```text
//! armed --changed()--> fired --rearm()--> armed
//!   |                                       ^
//!   +--cancel()--> cancelled --rearm()------+
//! ```
//!
//! Delivery is at-least-once and coalescing. The handle remembers the node
//! state reported by the last notification, including that the node was
//! deleted; if the node changed again before `rearm()` (a deleted node was
//! recreated, say), the rearmed handle is immediately ready, and any number of
//! such changes yields a single notification. Notifications carry no state:
//! consumers re-read what they care about.
//!
//! A membership watch on a sessions node that does not exist yet waits for
//! the node to be created.
//!
//! [`WatchHandle::spawn_listener`] runs the `changed()`/`rearm()` loop on a
//! background task and dispatches every notification to its own task, so a
//! slow callback never delays other watches. Rearming retries connection loss
//! with backoff.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::{SubscriptionError, SubscriptionResult};
use super::metrics;
use super::retry;
use crate::store::{EventType, SharedStore, Stat, StoreError, WatchEvent, WatchKind};

/// Class of change a handle observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// A session joined or left (children of the sessions node).
    SessionMembership,
    /// The topology counter was written.
    Topology,
    /// A partition's committed offset was written.
    Offset,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::SessionMembership => "session_membership",
            ChangeKind::Topology => "topology",
            ChangeKind::Offset => "offset",
        }
    }

    fn watch_kind(&self) -> WatchKind {
        match self {
            ChangeKind::SessionMembership => WatchKind::Children,
            ChangeKind::Topology | ChangeKind::Offset => WatchKind::Data,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something changed; re-read the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: ChangeKind,
    pub path: String,
    /// Store event behind the notification, `None` when it was detected on rearm.
    pub event_type: Option<EventType>,
}

/// What a handle last saw of its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    /// Nothing to compare against: the handle is new or was cancelled.
    Unknown,
    /// The node did not exist.
    Absent,
    /// Creation zxid plus the zxid of the last change this kind of watch cares about.
    Present(u64, u64),
}

impl Observed {
    fn of(kind: WatchKind, stat: Option<&Stat>) -> Self {
        match stat {
            None => Observed::Absent,
            Some(s) => match kind {
                WatchKind::Data => Observed::Present(s.czxid, s.mzxid),
                WatchKind::Children => Observed::Present(s.czxid, s.pzxid),
            },
        }
    }
}

/// One-shot, rearmable subscription to a class of changes.
pub struct WatchHandle {
    store: SharedStore,
    subscription_id: String,
    kind: ChangeKind,
    path: String,
    receiver: Option<oneshot::Receiver<WatchEvent>>,
    /// Node state as of the last arm or notification.
    observed: Observed,
    /// A change was detected on rearm and is yet to be reported.
    pending: bool,
    /// Backoff of the listener's rearm on connection loss.
    rearm_policy: ExponentialBuilder,
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("subscription_id", &self.subscription_id)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl WatchHandle {
    /// Register a new watch.
    pub(crate) async fn arm(
        store: SharedStore,
        subscription_id: &str,
        kind: ChangeKind,
        path: String,
        rearm_policy: ExponentialBuilder,
    ) -> SubscriptionResult<Self> {
        let mut handle = Self {
            store,
            subscription_id: subscription_id.to_string(),
            kind,
            path,
            receiver: None,
            observed: Observed::Unknown,
            pending: false,
            rearm_policy,
        };
        handle.register(false).await?;
        Ok(handle)
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if `changed()` will deliver a notification.
    pub fn is_armed(&self) -> bool {
        self.pending || self.receiver.is_some()
    }

    /// Wait for the next change.
    ///
    /// Fails with `WatchNotArmed` once the handle has fired or was cancelled,
    /// until [`rearm`](Self::rearm) is called. Dropping the returned future
    /// keeps the watch armed.
    pub async fn changed(&mut self) -> SubscriptionResult<Notification> {
        if self.pending {
            self.pending = false;
            self.receiver = None;
            return Ok(self.notify(None));
        }

        let Some(receiver) = self.receiver.as_mut() else {
            return Err(SubscriptionError::WatchNotArmed {
                path: self.path.clone(),
            });
        };
        let result = receiver.await;
        self.receiver = None;

        match result {
            Ok(event) => {
                self.observed = Observed::of(self.kind.watch_kind(), event.stat.as_ref());
                Ok(self.notify(Some(event.event_type)))
            }
            // The store drops pending watches of an ended session.
            Err(_) => Err(SubscriptionError::coordination(
                "watch",
                &self.subscription_id,
                &self.path,
                StoreError::SessionExpired {
                    session_id: self.store.session_id(),
                },
            )),
        }
    }

    /// Register interest in the next change.
    ///
    /// If the node changed since the last notification, the handle is ready
    /// at once. This includes a node that was deleted and then recreated.
    /// Rearming an armed handle is a no-op.
    pub async fn rearm(&mut self) -> SubscriptionResult<()> {
        if self.is_armed() {
            return Ok(());
        }
        self.register(true).await
    }

    /// Stop delivering notifications until the next `rearm()`.
    ///
    /// Safe to call any number of times. Changes made while cancelled are
    /// not reported after rearming.
    pub fn cancel(&mut self) {
        if self.receiver.take().is_some() || self.pending {
            debug!(
                subscription_id = %self.subscription_id,
                kind = %self.kind,
                path = %self.path,
                "Watch cancelled"
            );
        }
        self.pending = false;
        self.observed = Observed::Unknown;
    }

    async fn register(&mut self, compare: bool) -> SubscriptionResult<()> {
        let kind = self.kind.watch_kind();
        let registration = loop {
            match self.store.watch(&self.path, kind).await {
                Ok(registration) => break registration,
                // Children can only be watched on an existing node; wait for its creation.
                Err(StoreError::NoNode { .. }) if kind == WatchKind::Children => {
                    let exists = self
                        .store
                        .watch(&self.path, WatchKind::Data)
                        .await
                        .map_err(|e| self.watch_error(e))?;
                    if exists.stat.is_none() {
                        break exists;
                    }
                    // Created in between.
                }
                Err(e) => return Err(self.watch_error(e)),
            }
        };

        let current = Observed::of(kind, registration.stat.as_ref());
        if compare && self.observed != Observed::Unknown && current != self.observed {
            self.pending = true;
        }
        self.observed = current;
        self.receiver = Some(registration.receiver);
        Ok(())
    }

    fn watch_error(&self, source: StoreError) -> SubscriptionError {
        SubscriptionError::coordination("watch", &self.subscription_id, &self.path, source)
    }

    /// `rearm()` with backoff on connection loss.
    async fn rearm_with_retry(&mut self) -> SubscriptionResult<()> {
        let mut backoff = self.rearm_policy.clone().build();
        loop {
            let error = match self.rearm().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if !retry::is_retriable_watch_error(&error) {
                return Err(error);
            }
            let Some(delay) = backoff.next() else {
                return Err(error);
            };
            warn!(
                subscription_id = %self.subscription_id,
                path = %self.path,
                error = %error,
                retry_in_ms = delay.as_millis() as u64,
                "Failed to rearm watch, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn notify(&self, event_type: Option<EventType>) -> Notification {
        metrics::record_watch_notification(self.kind.as_str());
        debug!(
            subscription_id = %self.subscription_id,
            kind = %self.kind,
            path = %self.path,
            event = ?event_type,
            "Change notification"
        );
        Notification {
            kind: self.kind,
            path: self.path.clone(),
            event_type,
        }
    }

    /// Deliver every change to `callback` until the returned handle is cancelled.
    ///
    /// Each invocation runs on its own task. Rearming retries connection loss
    /// with the configured backoff. The listener stops on its own when the
    /// session ended or the retries ran out; [`ListenerHandle::cancel`] then
    /// returns the error.
    pub fn spawn_listener<F, Fut>(self, callback: F) -> ListenerHandle
    where
        F: Fn(Notification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let callback = Arc::new(callback);
        let mut handle = self;

        let task = tokio::spawn(async move {
            let outcome = loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break Ok(()),
                    result = handle.changed() => {
                        let notification = match result {
                            Ok(notification) => notification,
                            Err(e) => {
                                warn!(path = %handle.path, error = %e, "Watch listener stopped");
                                break Err(e);
                            }
                        };
                        let callback = Arc::clone(&callback);
                        tokio::spawn(async move { callback(notification).await });

                        let rearmed = tokio::select! {
                            _ = shutdown_rx.recv() => break Ok(()),
                            rearmed = handle.rearm_with_retry() => rearmed,
                        };
                        if let Err(e) = rearmed {
                            warn!(path = %handle.path, error = %e, "Failed to rearm watch, listener stopped");
                            break Err(e);
                        }
                    }
                }
            };
            handle.cancel();
            outcome
        });

        ListenerHandle { shutdown_tx, task }
    }
}

/// Background listener started by [`WatchHandle::spawn_listener`].
#[derive(Debug)]
pub struct ListenerHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<SubscriptionResult<()>>,
}

impl ListenerHandle {
    /// Check if the listener loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the listener and wait for its loop to exit.
    ///
    /// Returns the error that stopped the listener on its own, if any.
    /// Callbacks already dispatched keep running.
    pub async fn cancel(self) -> SubscriptionResult<()> {
        // No receiver left means the loop already exited.
        let _ = self.shutdown_tx.send(());
        match tokio::time::timeout(Duration::from_secs(5), self.task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(error = %e, "Watch listener task failed");
                Ok(())
            }
            Err(_) => {
                warn!("Watch listener did not stop within 5s");
                Ok(())
            }
        }
    }
}
