//! In-memory coordination store.
//!
//! A full implementation of [`CoordinationStore`] over a shared tree, for
//! tests and single-process deployments. Each [`InMemoryStore`] value is one
//! *connection*: it owns a session id, its ephemeral nodes and its pending
//! watches. Further connections to the same tree are opened with
//! [`InMemoryStore::connect`].
//!
//! Connection loss is simulated with [`InMemoryStore::expire_session`], which
//! removes the connection's ephemeral nodes (firing the watches of every other
//! connection) and fails all later operations with `SessionExpired`.
//! Transient failures are injected with [`InMemoryStore::inject_connection_loss`].
//!
//! # Example
//!
//! ```rust,no_run
//! use nakadi_subscription::store::{CoordinationStore, CreateMode, InMemoryStore, WatchKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let observer = InMemoryStore::new();
//! let member = observer.connect();
//!
//! observer.ensure_path("/members").await?;
//! let registration = observer.watch("/members", WatchKind::Children).await?;
//!
//! member.create("/members/a", b"1", CreateMode::Ephemeral).await?;
//! member.expire_session().await;
//!
//! let event = registration.receiver.await?;
//! assert_eq!(event.path, "/members");
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, oneshot};

use super::{
    CoordinationStore, CreateMode, EventType, Stat, StoreError, StoreResult, WatchEvent, WatchKind,
    WatchRegistration, parent_path, validate_path,
};

#[derive(Debug)]
struct Node {
    data: Bytes,
    version: i32,
    cversion: i32,
    czxid: u64,
    mzxid: u64,
    pzxid: u64,
    ephemeral_owner: Option<u64>,
}

impl Node {
    fn new(data: Bytes, zxid: u64, ephemeral_owner: Option<u64>) -> Self {
        Self {
            data,
            version: 0,
            cversion: 0,
            czxid: zxid,
            mzxid: zxid,
            pzxid: zxid,
            ephemeral_owner,
        }
    }
}

struct PendingWatch {
    session_id: u64,
    sender: oneshot::Sender<WatchEvent>,
}

/// The tree shared by all connections.
struct Ensemble {
    nodes: BTreeMap<String, Node>,
    zxid: u64,
    expired: HashSet<u64>,
    watches: HashMap<(String, WatchKind), Vec<PendingWatch>>,
}

impl Ensemble {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Bytes::new(), 0, None));
        Self {
            nodes,
            zxid: 0,
            expired: HashSet::new(),
            watches: HashMap::new(),
        }
    }

    fn next_zxid(&mut self) -> u64 {
        self.zxid += 1;
        self.zxid
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn stat(&self, path: &str) -> Option<Stat> {
        self.nodes.get(path).map(|node| Stat {
            version: node.version,
            cversion: node.cversion,
            czxid: node.czxid,
            mzxid: node.mzxid,
            pzxid: node.pzxid,
            ephemeral_owner: node.ephemeral_owner,
            num_children: self.children(path).len(),
        })
    }

    fn fire(&mut self, path: &str, kind: WatchKind, event_type: EventType) {
        let Some(pending) = self.watches.remove(&(path.to_string(), kind)) else {
            return;
        };
        let event = WatchEvent {
            event_type,
            path: path.to_string(),
            stat: self.stat(path),
        };
        for watch in pending {
            // A dropped receiver means the watcher lost interest.
            let _ = watch.sender.send(event.clone());
        }
    }

    fn touch_parent(&mut self, path: &str, zxid: u64) {
        if let Some(parent) = parent_path(path)
            && let Some(node) = self.nodes.get_mut(parent)
        {
            node.cversion += 1;
            node.pzxid = zxid;
        }
    }

    fn create(
        &mut self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        session_id: u64,
    ) -> StoreResult<Stat> {
        validate_path(path)?;
        if self.nodes.contains_key(path) {
            return Err(StoreError::NodeExists {
                path: path.to_string(),
            });
        }
        let parent = parent_path(path).ok_or_else(|| StoreError::InvalidPath {
            path: path.to_string(),
        })?;
        match self.nodes.get(parent) {
            None => {
                return Err(StoreError::NoNode {
                    path: path.to_string(),
                });
            }
            Some(node) if node.ephemeral_owner.is_some() => {
                return Err(StoreError::NoChildrenForEphemerals {
                    path: parent.to_string(),
                });
            }
            Some(_) => {}
        }

        let zxid = self.next_zxid();
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(session_id),
        };
        self.nodes.insert(
            path.to_string(),
            Node::new(Bytes::copy_from_slice(data), zxid, owner),
        );
        self.touch_parent(path, zxid);

        self.fire(path, WatchKind::Data, EventType::NodeCreated);
        self.fire(parent, WatchKind::Children, EventType::NodeChildrenChanged);
        self.stat(path).ok_or_else(|| StoreError::NoNode {
            path: path.to_string(),
        })
    }

    fn set_data(
        &mut self,
        path: &str,
        data: &[u8],
        expected_version: Option<i32>,
    ) -> StoreResult<Stat> {
        let zxid = self.zxid + 1;
        let node = self.nodes.get_mut(path).ok_or_else(|| StoreError::NoNode {
            path: path.to_string(),
        })?;
        if let Some(expected) = expected_version
            && expected != node.version
        {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
                expected,
                actual: node.version,
            });
        }
        node.data = Bytes::copy_from_slice(data);
        node.version += 1;
        node.mzxid = zxid;
        self.zxid = zxid;

        self.fire(path, WatchKind::Data, EventType::NodeDataChanged);
        self.stat(path).ok_or_else(|| StoreError::NoNode {
            path: path.to_string(),
        })
    }

    fn delete(&mut self, path: &str, expected_version: Option<i32>) -> StoreResult<()> {
        if path == "/" {
            return Err(StoreError::InvalidPath {
                path: path.to_string(),
            });
        }
        let node = self.nodes.get(path).ok_or_else(|| StoreError::NoNode {
            path: path.to_string(),
        })?;
        if let Some(expected) = expected_version
            && expected != node.version
        {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
                expected,
                actual: node.version,
            });
        }
        if !self.children(path).is_empty() {
            return Err(StoreError::NotEmpty {
                path: path.to_string(),
            });
        }

        self.nodes.remove(path);
        let zxid = self.next_zxid();
        self.touch_parent(path, zxid);

        self.fire(path, WatchKind::Data, EventType::NodeDeleted);
        self.fire(path, WatchKind::Children, EventType::NodeDeleted);
        if let Some(parent) = parent_path(path) {
            self.fire(parent, WatchKind::Children, EventType::NodeChildrenChanged);
        }
        Ok(())
    }

    fn expire(&mut self, session_id: u64) -> usize {
        if !self.expired.insert(session_id) {
            return 0;
        }
        for pending in self.watches.values_mut() {
            pending.retain(|watch| watch.session_id != session_id);
        }
        self.watches.retain(|_, pending| !pending.is_empty());

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            // Ephemeral nodes never have children, so this cannot fail with NotEmpty.
            if let Err(e) = self.delete(path, None) {
                tracing::warn!(path = %path, error = %e, "Failed to remove ephemeral node");
            }
        }
        owned.len()
    }
}

/// One connection to a shared in-memory tree.
#[derive(Clone)]
pub struct InMemoryStore {
    ensemble: Arc<Mutex<Ensemble>>,
    next_session_id: Arc<AtomicU64>,
    session_id: u64,
    injected_failures: Arc<AtomicUsize>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty tree and open the first connection to it.
    pub fn new() -> Self {
        Self {
            ensemble: Arc::new(Mutex::new(Ensemble::new())),
            next_session_id: Arc::new(AtomicU64::new(2)),
            session_id: 1,
            injected_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Open another connection (with its own session) to the same tree.
    pub fn connect(&self) -> Self {
        Self {
            ensemble: Arc::clone(&self.ensemble),
            next_session_id: Arc::clone(&self.next_session_id),
            session_id: self.next_session_id.fetch_add(1, Ordering::SeqCst),
            injected_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Simulate loss of this connection.
    ///
    /// Removes the session's ephemeral nodes (firing watches of other
    /// connections), drops the session's pending watches and fails every
    /// further operation with `SessionExpired`. Returns the number of
    /// ephemeral nodes removed; calling it again is a no-op.
    pub async fn expire_session(&self) -> usize {
        let removed = self.ensemble.lock().await.expire(self.session_id);
        tracing::debug!(
            session_id = self.session_id,
            ephemeral_nodes = removed,
            "Expired in-memory store session"
        );
        removed
    }

    /// Fail the next `count` operations on this connection with `ConnectionLoss`.
    pub fn inject_connection_loss(&self, count: usize) {
        self.injected_failures.fetch_add(count, Ordering::SeqCst);
    }

    /// Check that this connection can serve an operation.
    fn check(&self, ensemble: &Ensemble) -> StoreResult<()> {
        if ensemble.expired.contains(&self.session_id) {
            return Err(StoreError::SessionExpired {
                session_id: self.session_id,
            });
        }
        let consumed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(StoreError::ConnectionLoss);
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<Stat> {
        let mut ensemble = self.ensemble.lock().await;
        self.check(&ensemble)?;
        ensemble.create(path, data, mode, self.session_id)
    }

    async fn exists(&self, path: &str) -> StoreResult<Option<Stat>> {
        let ensemble = self.ensemble.lock().await;
        self.check(&ensemble)?;
        Ok(ensemble.stat(path))
    }

    async fn get_data(&self, path: &str) -> StoreResult<(Bytes, Stat)> {
        let ensemble = self.ensemble.lock().await;
        self.check(&ensemble)?;
        let data = ensemble
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| StoreError::NoNode {
                path: path.to_string(),
            })?;
        let stat = ensemble.stat(path).ok_or_else(|| StoreError::NoNode {
            path: path.to_string(),
        })?;
        Ok((data, stat))
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<i32>,
    ) -> StoreResult<Stat> {
        let mut ensemble = self.ensemble.lock().await;
        self.check(&ensemble)?;
        ensemble.set_data(path, data, expected_version)
    }

    async fn delete(&self, path: &str, expected_version: Option<i32>) -> StoreResult<()> {
        let mut ensemble = self.ensemble.lock().await;
        self.check(&ensemble)?;
        ensemble.delete(path, expected_version)
    }

    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let ensemble = self.ensemble.lock().await;
        self.check(&ensemble)?;
        if !ensemble.nodes.contains_key(path) {
            return Err(StoreError::NoNode {
                path: path.to_string(),
            });
        }
        Ok(ensemble.children(path))
    }

    async fn watch(&self, path: &str, kind: WatchKind) -> StoreResult<WatchRegistration> {
        validate_path(path)?;
        let mut ensemble = self.ensemble.lock().await;
        self.check(&ensemble)?;
        let stat = ensemble.stat(path);
        if kind == WatchKind::Children && stat.is_none() {
            return Err(StoreError::NoNode {
                path: path.to_string(),
            });
        }
        let (sender, receiver) = oneshot::channel();
        ensemble
            .watches
            .entry((path.to_string(), kind))
            .or_default()
            .push(PendingWatch {
                session_id: self.session_id,
                sender,
            });
        Ok(WatchRegistration { stat, receiver })
    }
}
