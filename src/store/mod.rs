//! Coordination store adapter.
//!
//! The subscription core is built on a strongly consistent, hierarchical
//! key-value store with ZooKeeper semantics:
//!
//! - Nodes are addressed by absolute `/`-separated paths and carry a byte value
//! - Every write bumps the node's data version; child-set changes bump `cversion`
//! - Ephemeral nodes are removed when the connection that created them is lost
//! - Watches are one-shot: they fire once on the next change and must be re-registered
//!
//! # Available Implementations
//!
//! - [`InMemoryStore`]: Single-process store with simulated connections, used by tests
//!
//! # Other Backends
//!
//! Production deployments run against a ZooKeeper ensemble. A ZooKeeper
//! client plugs in by implementing [`CoordinationStore`] for one connection
//! and handing it to the subscription client as a [`SharedStore`]. The
//! mapping is direct:
//!
//! - `create`/`exists`/`get_data`/`set_data`/`delete`/`get_children` are the
//!   ZooKeeper calls of the same name, with `Stat` copied field by field
//! - `watch` with [`WatchKind::Data`] is `exists` with a watcher (it also
//!   fires on creation); [`WatchKind::Children`] is `getChildren` with a
//!   watcher and fails with `NoNode` on a missing node
//! - The returned `stat` must be read in the same call that registers the
//!   watch
//! - `ConnectionLoss` maps to [`StoreError::ConnectionLoss`] and an expired
//!   session to [`StoreError::SessionExpired`]; pending watches of an expired
//!   session must be dropped so their receivers close
//!
//! `ensure_path` and `delete_recursive` have default implementations built
//! on the primitives and rarely need overriding.
//!
//! # Example
//!
//! ```rust,no_run
//! use nakadi_subscription::store::{CoordinationStore, CreateMode, InMemoryStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! store.ensure_path("/nakadi/subscriptions/s1").await?;
//! store
//!     .create("/nakadi/subscriptions/s1/state", b"", CreateMode::Persistent)
//!     .await?;
//! let (data, stat) = store.get_data("/nakadi/subscriptions/s1/state").await?;
//! assert!(data.is_empty());
//! assert_eq!(stat.version, 0);
//! # Ok(())
//! # }
//! ```

mod error;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;

/// Shared handle to a store connection.
pub type SharedStore = Arc<dyn CoordinationStore>;

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Lives until explicitly deleted.
    Persistent,
    /// Removed automatically when the creating connection's session ends.
    Ephemeral,
}

/// Node metadata, modelled after ZooKeeper's `Stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Number of writes to the node's data since creation.
    pub version: i32,
    /// Number of changes to the node's child set since creation.
    pub cversion: i32,
    /// Transaction id that created the node.
    pub czxid: u64,
    /// Transaction id of the last data write.
    pub mzxid: u64,
    /// Transaction id of the last child-set change.
    pub pzxid: u64,
    /// Owning session for ephemeral nodes.
    pub ephemeral_owner: Option<u64>,
    pub num_children: usize,
}

/// What a watch observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Creation, data write or deletion of the node itself.
    Data,
    /// Creation or deletion of a direct child, or deletion of the node.
    Children,
}

/// Kind of change that fired a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    NodeCreated,
    NodeDataChanged,
    NodeChildrenChanged,
    NodeDeleted,
}

/// Delivered once when a registered watch fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub path: String,
    /// Stat of the node right after the change, `None` if it was deleted.
    pub stat: Option<Stat>,
}

/// A registered one-shot watch.
///
/// `stat` is read atomically with the registration, so a caller can compare
/// it against earlier observations without missing intervening changes.
#[derive(Debug)]
pub struct WatchRegistration {
    pub stat: Option<Stat>,
    pub receiver: oneshot::Receiver<WatchEvent>,
}

/// Operations over a consistent, watchable coordination store.
///
/// Implementations must be linearizable per connection: an operation that
/// returns `Ok` is visible to every subsequent operation on any connection.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Session id of this connection (owner of its ephemeral nodes).
    fn session_id(&self) -> u64;

    /// Create a node. Fails with `NodeExists` if present and `NoNode` if the parent is missing.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<Stat>;

    /// Stat of the node, or `None` if absent.
    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>>;

    async fn get_data(&self, path: &str) -> StoreResult<(Bytes, Stat)>;

    /// Overwrite the node's value, optionally only if its version matches.
    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i32>,
    ) -> StoreResult<Stat>;

    /// Delete a childless node, optionally only if its version matches.
    async fn delete(&self, path: &str, expected_version: Option<i32>) -> StoreResult<()>;

    /// Names (not paths) of the direct children, sorted.
    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Register a one-shot watch on the node.
    async fn watch(&self, path: &str, kind: WatchKind) -> StoreResult<WatchRegistration>;

    /// Create the node and any missing ancestors as empty persistent nodes.
    ///
    /// Concurrent creation by another client is not an error.
    async fn ensure_path(&self, path: &str) -> StoreResult<()> {
        validate_path(path)?;
        let mut current = String::with_capacity(path.len());
        for segment in path.split('/').skip(1) {
            current.push('/');
            current.push_str(segment);
            match self.create(&current, &[], CreateMode::Persistent).await {
                Ok(_) | Err(StoreError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete the node and its whole subtree. A missing node is not an error.
    async fn delete_recursive(&self, path: &str) -> StoreResult<()> {
        let mut ordered = Vec::new();
        let mut pending = vec![path.to_string()];
        while let Some(next) = pending.pop() {
            match self.get_children(&next).await {
                Ok(children) => {
                    pending.extend(children.iter().map(|child| join_path(&next, child)));
                }
                Err(StoreError::NoNode { .. }) => continue,
                Err(e) => return Err(e),
            }
            ordered.push(next);
        }
        // Parents were pushed before their children.
        for node in ordered.iter().rev() {
            match self.delete(node, None).await {
                Ok(()) | Err(StoreError::NoNode { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of an absolute path, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) => None,
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Check that a path is absolute with no empty segments.
pub fn validate_path(path: &str) -> StoreResult<()> {
    let valid = path == "/"
        || (path.starts_with('/') && !path.ends_with('/') && !path[1..].split('/').any(str::is_empty));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath {
            path: path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "nakadi"), "/nakadi");
        assert_eq!(join_path("/nakadi", "locks"), "/nakadi/locks");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/"), None);
        assert_eq!(parent_path("/nakadi"), Some("/"));
        assert_eq!(parent_path("/nakadi/locks/x"), Some("/nakadi/locks"));
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/nakadi/subscriptions").is_ok());
        assert!(validate_path("nakadi").is_err());
        assert!(validate_path("/nakadi/").is_err());
        assert!(validate_path("/nakadi//x").is_err());
        assert!(validate_path("").is_err());
    }
}
