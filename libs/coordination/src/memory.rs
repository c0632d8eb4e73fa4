//! In-process coordination service.
//!
//! `MemoryCluster` holds one shared node tree with the semantics the rest of
//! the crate relies on: ephemeral nodes owned by a session, per-parent
//! sequence counters, one-shot child watches and `NoNode` / `NodeExists`
//! errors. Each [`MemoryConnector`] opens one session on it and can drop,
//! restore or expire that session, which is how the tests drive
//! disconnect/reconnect cycles.
//!
//! Like a ZooKeeper server, every `children(path, true)` call arms its own
//! watch, and a session loses its pending watches when its connection drops.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::backend::{
    Backend, Connector, CreateMode, EventSink, NodeStat, SessionEvent, WatchEvent, WatchEventKind,
};
use crate::error::{CoordinationError, CoordinationResult};
use crate::paths;

type SessionId = i64;

/// A shared in-memory node tree.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<Mutex<ClusterState>>,
}

#[derive(Debug)]
struct ClusterState {
    nodes: BTreeMap<String, MemoryNode>,
    sessions: HashMap<SessionId, SessionSlot>,
    /// one-shot child watches: path => one session id per arming call
    child_watches: HashMap<String, Vec<SessionId>>,
    next_session: SessionId,
}

#[derive(Debug, Clone, Default)]
struct MemoryNode {
    data: Vec<u8>,
    version: i32,
    ephemeral_owner: SessionId,
    next_sequence: u32,
}

#[derive(Debug)]
struct SessionSlot {
    events: EventSink,
    connected: bool,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_owned(), MemoryNode::default());
        Self {
            inner: Arc::new(Mutex::new(ClusterState {
                nodes,
                sessions: HashMap::new(),
                child_watches: HashMap::new(),
                next_session: 1,
            })),
        }
    }

    /// A connector that opens (and then controls) one session on this cluster.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            cluster: self.clone(),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Number of sessions ever opened and not closed.
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Data at `path`, bypassing sessions.
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().nodes.get(path).map(|n| n.data.clone())
    }

    /// Child names of `path`, bypassing sessions.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.inner.lock().children_of(path)
    }

    /// Child watches currently armed on `path`, across all sessions.
    pub fn armed_watches(&self, path: &str) -> usize {
        self.inner.lock().child_watches.get(path).map_or(0, Vec::len)
    }

    /// Delete `path` and its subtree as an outside actor would.
    pub fn remove_external(&self, path: &str) {
        self.inner.lock().remove_subtree(path);
    }

    fn open_session(&self, events: EventSink) -> SessionId {
        let mut state = self.inner.lock();
        let id = state.next_session;
        state.next_session += 1;
        let _ = events.send(SessionEvent::Connected);
        state.sessions.insert(
            id,
            SessionSlot {
                events,
                connected: true,
            },
        );
        debug!(session = id, "memory session opened");
        id
    }

    fn with_session<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut ClusterState) -> CoordinationResult<T>,
    ) -> CoordinationResult<T> {
        let mut state = self.inner.lock();
        match state.sessions.get(&id) {
            Some(slot) if slot.connected => f(&mut state),
            _ => Err(CoordinationError::NotConnected(format!(
                "memory session {id} is not connected"
            ))),
        }
    }

    fn set_connected(&self, id: SessionId, connected: bool) {
        let mut state = self.inner.lock();
        if !connected {
            state.drop_watches(id);
        }
        if let Some(slot) = state.sessions.get_mut(&id) {
            slot.connected = connected;
            let event = if connected {
                SessionEvent::Connected
            } else {
                SessionEvent::Connecting
            };
            let _ = slot.events.send(event);
        }
    }

    fn expire(&self, id: SessionId) {
        let mut state = self.inner.lock();
        state.drop_ephemerals(id);
        state.drop_watches(id);
        if let Some(slot) = state.sessions.get_mut(&id) {
            slot.connected = false;
            let _ = slot.events.send(SessionEvent::Connecting);
        }
    }

    fn close(&self, id: SessionId) {
        let mut state = self.inner.lock();
        state.drop_ephemerals(id);
        state.sessions.remove(&id);
        state.drop_watches(id);
        debug!(session = id, "memory session closed");
    }
}

impl ClusterState {
    fn node(&self, path: &str) -> CoordinationResult<&MemoryNode> {
        self.nodes
            .get(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_owned())
            })
            .collect()
    }

    fn drop_watches(&mut self, id: SessionId) {
        self.child_watches.retain(|_, sessions| {
            sessions.retain(|s| *s != id);
            !sessions.is_empty()
        });
    }

    fn fire(&mut self, path: &str, kind: WatchEventKind) {
        let Some(watchers) = self.child_watches.remove(path) else {
            return;
        };
        for id in watchers {
            if let Some(slot) = self.sessions.get(&id) {
                trace!(session = id, path, ?kind, "firing watch");
                let _ = slot
                    .events
                    .send(SessionEvent::Watch(WatchEvent::new(path, kind)));
            }
        }
    }

    fn fire_parent(&mut self, path: &str) {
        if let Some(parent) = paths::parent(path) {
            let parent = parent.to_owned();
            self.fire(&parent, WatchEventKind::NodeChildrenChanged);
        }
    }

    fn create(
        &mut self,
        owner: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        if !path.starts_with('/') || path == "/" {
            return Err(CoordinationError::Transport(format!("bad path '{path}'")));
        }
        let parent_path = paths::parent(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))?
            .to_owned();
        let parent = self
            .nodes
            .get_mut(&parent_path)
            .ok_or_else(|| CoordinationError::NoNode(parent_path.clone()))?;
        if parent.ephemeral_owner != 0 {
            return Err(CoordinationError::Transport(format!(
                "ephemeral node '{parent_path}' cannot have children"
            )));
        }
        let actual = if mode.is_sequential() {
            let seq = parent.next_sequence;
            parent.next_sequence += 1;
            format!("{path}{seq:010}")
        } else {
            path.to_owned()
        };
        if self.nodes.contains_key(&actual) {
            return Err(CoordinationError::NodeExists(actual));
        }
        self.nodes.insert(
            actual.clone(),
            MemoryNode {
                data,
                version: 0,
                ephemeral_owner: if mode.is_ephemeral() { owner } else { 0 },
                next_sequence: 0,
            },
        );
        self.fire_parent(&actual);
        Ok(actual)
    }

    fn delete(&mut self, path: &str) -> CoordinationResult<()> {
        self.node(path)?;
        if !self.children_of(path).is_empty() {
            return Err(CoordinationError::NotEmpty(path.to_owned()));
        }
        self.nodes.remove(path);
        self.fire(path, WatchEventKind::NodeDeleted);
        self.fire_parent(path);
        Ok(())
    }

    fn remove_subtree(&mut self, path: &str) {
        let prefix = format!("{path}/");
        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&prefix))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return;
        }
        for p in &doomed {
            self.nodes.remove(p);
        }
        for p in &doomed {
            self.fire(p, WatchEventKind::NodeDeleted);
        }
        self.fire_parent(path);
    }

    fn drop_ephemerals(&mut self, owner: SessionId) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == owner)
            .map(|(p, _)| p.clone())
            .collect();
        for path in owned {
            debug!(session = owner, %path, "removing ephemeral node");
            self.nodes.remove(&path);
            self.fire(&path, WatchEventKind::NodeDeleted);
            self.fire_parent(&path);
        }
    }

    fn stat(&self, path: &str) -> Option<NodeStat> {
        self.nodes.get(path).map(|n| NodeStat {
            version: n.version,
            num_children: self.children_of(path).len() as i32,
            data_length: n.data.len() as i32,
            ephemeral_owner: n.ephemeral_owner,
        })
    }
}

/// Opens a session on a [`MemoryCluster`] and controls its connectivity.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    cluster: MemoryCluster,
    session: Arc<Mutex<Option<SessionId>>>,
}

impl MemoryConnector {
    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    /// Id of the session opened through this connector, if any.
    pub fn session_id(&self) -> Option<i64> {
        *self.session.lock()
    }

    /// Drop the session's link to the service. Ephemeral nodes survive.
    pub fn disconnect(&self) {
        if let Some(id) = self.session_id() {
            self.cluster.set_connected(id, false);
        }
    }

    /// Restore the session's link.
    pub fn reconnect(&self) {
        if let Some(id) = self.session_id() {
            self.cluster.set_connected(id, true);
        }
    }

    /// Drop the link and reap the session's ephemeral nodes. A later
    /// [`reconnect`](Self::reconnect) behaves like a freshly established
    /// session.
    pub fn expire(&self) {
        if let Some(id) = self.session_id() {
            self.cluster.expire(id);
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        servers: &[String],
        _session_timeout: Duration,
        events: EventSink,
    ) -> CoordinationResult<Arc<dyn Backend>> {
        let id = self.cluster.open_session(events);
        debug!(session = id, ?servers, "memory connector connected");
        *self.session.lock() = Some(id);
        Ok(Arc::new(MemorySession {
            id,
            cluster: self.cluster.clone(),
        }))
    }
}

/// One session on a [`MemoryCluster`].
#[derive(Debug)]
pub struct MemorySession {
    id: SessionId,
    cluster: MemoryCluster,
}

#[async_trait]
impl Backend for MemorySession {
    async fn get(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        self.cluster
            .with_session(self.id, |state| Ok(state.node(path)?.data.clone()))
    }

    async fn children(&self, path: &str, watch: bool) -> CoordinationResult<Vec<String>> {
        let id = self.id;
        self.cluster.with_session(id, |state| {
            state.node(path)?;
            if watch {
                state
                    .child_watches
                    .entry(path.to_owned())
                    .or_default()
                    .push(id);
            }
            Ok(state.children_of(path))
        })
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        let id = self.id;
        self.cluster
            .with_session(id, |state| state.create(id, path, data, mode))
    }

    async fn mkdir_recursive(&self, path: &str) -> CoordinationResult<()> {
        let id = self.id;
        self.cluster.with_session(id, |state| {
            for dir in paths::ancestors_inclusive(path) {
                if !state.nodes.contains_key(dir) {
                    state.create(id, dir, Vec::new(), CreateMode::Persistent)?;
                }
            }
            Ok(())
        })
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        self.cluster.with_session(self.id, |state| state.delete(path))
    }

    async fn stat(&self, path: &str) -> CoordinationResult<Option<NodeStat>> {
        self.cluster.with_session(self.id, |state| Ok(state.stat(path)))
    }

    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        self.cluster
            .with_session(self.id, |state| Ok(state.nodes.contains_key(path)))
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> CoordinationResult<NodeStat> {
        self.cluster.with_session(self.id, |state| {
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))?;
            node.data = data;
            node.version += 1;
            state
                .stat(path)
                .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))
        })
    }

    async fn remove_recursive(&self, path: &str) -> CoordinationResult<()> {
        self.cluster.with_session(self.id, |state| {
            state.remove_subtree(path);
            Ok(())
        })
    }

    async fn close(&self) -> CoordinationResult<()> {
        self.cluster.close(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    async fn session(cluster: &MemoryCluster) -> (
        MemoryConnector,
        Arc<dyn Backend>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let connector = cluster.connector();
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = connector
            .connect(&["memory:2181".into()], Duration::from_secs(1), tx)
            .await
            .unwrap();
        (connector, backend, rx)
    }

    #[tokio::test]
    async fn test_connect_emits_connected() {
        let cluster = MemoryCluster::new();
        let (connector, _backend, mut rx) = session(&cluster).await;
        assert_eq!(rx.recv().await, Some(SessionEvent::Connected));
        assert_eq!(cluster.session_count(), 1);
        assert!(connector.session_id().is_some());
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let cluster = MemoryCluster::new();
        let (_c, backend, _rx) = session(&cluster).await;
        let err = backend
            .create("/a/b", vec![], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(err.is_no_node());

        backend.mkdir_recursive("/a").await.unwrap();
        backend
            .create("/a/b", b"x".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        let err = backend
            .create("/a/b", vec![], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(err.is_node_exists());
        assert_eq!(backend.get("/a/b").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_sequential_names() {
        let cluster = MemoryCluster::new();
        let (_c, backend, _rx) = session(&cluster).await;
        backend.mkdir_recursive("/ns/svc").await.unwrap();
        let first = backend
            .create("/ns/svc/node-", vec![], CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let second = backend
            .create("/ns/svc/node-", vec![], CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(first, "/ns/svc/node-0000000000");
        assert_eq!(second, "/ns/svc/node-0000000001");
        let mut children = backend.children("/ns/svc", false).await.unwrap();
        children.sort();
        assert_eq!(children, vec!["node-0000000000", "node-0000000001"]);
    }

    #[tokio::test]
    async fn test_child_watch_is_one_shot() {
        let cluster = MemoryCluster::new();
        let (_c, backend, mut rx) = session(&cluster).await;
        assert_eq!(rx.recv().await, Some(SessionEvent::Connected));
        backend.mkdir_recursive("/w").await.unwrap();
        backend.children("/w", true).await.unwrap();

        backend
            .create("/w/a", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        backend
            .create("/w/b", vec![], CreateMode::Persistent)
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Watch(WatchEvent::new(
                "/w",
                WatchEventKind::NodeChildrenChanged
            )))
        );
        // not re-armed, second create fired nothing
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_every_arming_call_counts() {
        let cluster = MemoryCluster::new();
        let (connector, backend, mut rx) = session(&cluster).await;
        assert_eq!(rx.recv().await, Some(SessionEvent::Connected));
        backend.mkdir_recursive("/w").await.unwrap();
        backend.children("/w", true).await.unwrap();
        backend.children("/w", true).await.unwrap();
        backend.children("/w", false).await.unwrap();
        assert_eq!(cluster.armed_watches("/w"), 2);

        backend
            .create("/w/a", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        let fired = WatchEvent::new("/w", WatchEventKind::NodeChildrenChanged);
        assert_eq!(rx.recv().await, Some(SessionEvent::Watch(fired.clone())));
        assert_eq!(rx.recv().await, Some(SessionEvent::Watch(fired)));
        assert_eq!(cluster.armed_watches("/w"), 0);

        backend.children("/w", true).await.unwrap();
        connector.disconnect();
        assert_eq!(rx.recv().await, Some(SessionEvent::Connecting));
        assert_eq!(cluster.armed_watches("/w"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_and_expire() {
        let cluster = MemoryCluster::new();
        let (connector, backend, mut rx) = session(&cluster).await;
        assert_eq!(rx.recv().await, Some(SessionEvent::Connected));
        backend.mkdir_recursive("/e").await.unwrap();
        let eph = backend
            .create("/e/n-", vec![], CreateMode::EphemeralSequential)
            .await
            .unwrap();

        connector.disconnect();
        assert_eq!(rx.recv().await, Some(SessionEvent::Connecting));
        assert!(backend.get(&eph).await.unwrap_err().is_not_connected());
        // ephemeral node survives a plain disconnect
        assert!(cluster.data(&eph).is_some());

        connector.reconnect();
        assert_eq!(rx.recv().await, Some(SessionEvent::Connected));
        assert!(backend.exists(&eph).await.unwrap());

        connector.expire();
        assert_eq!(rx.recv().await, Some(SessionEvent::Connecting));
        assert!(cluster.data(&eph).is_none());
    }

    #[tokio::test]
    async fn test_delete_and_remove_recursive() {
        let cluster = MemoryCluster::new();
        let (_c, backend, _rx) = session(&cluster).await;
        backend.mkdir_recursive("/r/a/b").await.unwrap();
        assert!(matches!(
            backend.delete("/r/a").await,
            Err(CoordinationError::NotEmpty(_))
        ));
        assert!(backend.delete("/missing").await.unwrap_err().is_no_node());

        backend.remove_recursive("/r").await.unwrap();
        assert!(!backend.exists("/r").await.unwrap());
        // missing is fine
        backend.remove_recursive("/r").await.unwrap();
        assert!(cluster.children("/").is_empty());
    }

    #[tokio::test]
    async fn test_set_bumps_version() {
        let cluster = MemoryCluster::new();
        let (_c, backend, _rx) = session(&cluster).await;
        backend.mkdir_recursive("/v").await.unwrap();
        let stat = backend.set("/v", b"1".to_vec()).await.unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(stat.data_length, 1);
        assert!(backend.set("/nope", vec![]).await.unwrap_err().is_no_node());
        assert_eq!(backend.stat("/nope").await.unwrap(), None);
    }
}
