//! ZooKeeper backend.
//!
//! The `zookeeper` crate is blocking and runs its callbacks on its own io
//! thread. Every call goes through `spawn_blocking`; the state listener and
//! child watchers only push into the client's [`EventSink`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ::zookeeper::{
    Acl, CreateMode as ZkCreateMode, Stat, WatchedEvent, WatchedEventType, Watcher, ZkError,
    ZkResult, ZkState, ZooKeeper, ZooKeeperExt,
};
use async_trait::async_trait;
use tracing::{debug, info, trace};

use crate::backend::{
    Backend, Connector, CreateMode, EventSink, NodeStat, SessionEvent, WatchEvent, WatchEventKind,
};
use crate::error::{CoordinationError, CoordinationResult};

/// Opens sessions on a ZooKeeper ensemble.
#[derive(Debug, Default, Clone)]
pub struct ZkConnector;

struct SessionWatcher;

impl Watcher for SessionWatcher {
    fn handle(&self, event: WatchedEvent) {
        trace!(state = ?event.keeper_state, "zookeeper session event");
    }
}

#[async_trait]
impl Connector for ZkConnector {
    async fn connect(
        &self,
        servers: &[String],
        session_timeout: Duration,
        events: EventSink,
    ) -> CoordinationResult<Arc<dyn Backend>> {
        let connect_string = servers.join(",");
        info!(%connect_string, ?session_timeout, "connecting to zookeeper");
        let zk = {
            let hosts = connect_string.clone();
            tokio::task::spawn_blocking(move || {
                ZooKeeper::connect(&hosts, session_timeout, SessionWatcher)
            })
            .await
            .map_err(join_error)?
            .map_err(|e| zk_error(e, &connect_string))?
        };

        let listener_events = events.clone();
        zk.add_listener(move |state: ZkState| {
            let event = match state {
                ZkState::Connected | ZkState::ConnectedReadOnly => SessionEvent::Connected,
                other => {
                    debug!(state = ?other, "zookeeper session not connected");
                    SessionEvent::Connecting
                }
            };
            let _ = listener_events.send(event);
        });

        let backend = ZkBackend {
            zk: Arc::new(zk),
            events,
        };
        // the session may have come up before the listener was attached
        if backend.call("/", |zk| zk.exists("/", false)).await.is_ok() {
            let _ = backend.events.send(SessionEvent::Connected);
        }
        Ok(Arc::new(backend))
    }
}

#[derive(Clone)]
struct ZkBackend {
    zk: Arc<ZooKeeper>,
    events: EventSink,
}

impl fmt::Debug for ZkBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZkBackend").finish_non_exhaustive()
    }
}

impl ZkBackend {
    async fn call<T, F>(&self, path: &str, f: F) -> CoordinationResult<T>
    where
        F: FnOnce(&ZooKeeper) -> ZkResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let zk = self.zk.clone();
        tokio::task::spawn_blocking(move || f(&zk))
            .await
            .map_err(join_error)?
            .map_err(|e| zk_error(e, path))
    }
}

#[async_trait]
impl Backend for ZkBackend {
    async fn get(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        let p = path.to_owned();
        self.call(path, move |zk| zk.get_data(&p, false).map(|(data, _)| data))
            .await
    }

    async fn children(&self, path: &str, watch: bool) -> CoordinationResult<Vec<String>> {
        let p = path.to_owned();
        if !watch {
            return self
                .call(path, move |zk| zk.get_children(&p, false))
                .await;
        }
        let watcher = child_watcher(self.events.clone(), p.clone());
        self.call(path, move |zk| zk.get_children_w(&p, watcher))
            .await
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        let p = path.to_owned();
        self.call(path, move |zk| {
            zk.create(&p, data, Acl::open_unsafe().clone(), create_mode(mode))
        })
        .await
    }

    async fn mkdir_recursive(&self, path: &str) -> CoordinationResult<()> {
        let p = path.to_owned();
        self.call(path, move |zk| zk.ensure_path(&p)).await
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        let p = path.to_owned();
        self.call(path, move |zk| zk.delete(&p, None)).await
    }

    async fn stat(&self, path: &str) -> CoordinationResult<Option<NodeStat>> {
        let p = path.to_owned();
        self.call(path, move |zk| zk.exists(&p, false))
            .await
            .map(|stat| stat.as_ref().map(node_stat))
    }

    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        let p = path.to_owned();
        self.call(path, move |zk| zk.exists(&p, false))
            .await
            .map(|stat| stat.is_some())
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> CoordinationResult<NodeStat> {
        let p = path.to_owned();
        self.call(path, move |zk| zk.set_data(&p, data, None))
            .await
            .map(|stat| node_stat(&stat))
    }

    async fn remove_recursive(&self, path: &str) -> CoordinationResult<()> {
        let p = path.to_owned();
        self.call(path, move |zk| match zk.delete_recursive(&p) {
            Err(ZkError::NoNode) => Ok(()),
            other => other,
        })
        .await
    }

    async fn close(&self) -> CoordinationResult<()> {
        self.call("/", |zk| zk.close()).await
    }
}

/// Forwards a fired child watch into the session's event sink.
fn child_watcher(events: EventSink, path: String) -> impl Watcher + 'static {
    move |ev: WatchedEvent| {
        if let Some(kind) = event_kind(ev.event_type) {
            let _ = events.send(SessionEvent::Watch(WatchEvent::new(path.clone(), kind)));
        }
    }
}

fn create_mode(mode: CreateMode) -> ZkCreateMode {
    match mode {
        CreateMode::Persistent => ZkCreateMode::Persistent,
        CreateMode::Ephemeral => ZkCreateMode::Ephemeral,
        CreateMode::PersistentSequential => ZkCreateMode::PersistentSequential,
        CreateMode::EphemeralSequential => ZkCreateMode::EphemeralSequential,
    }
}

fn event_kind(event_type: WatchedEventType) -> Option<WatchEventKind> {
    match event_type {
        WatchedEventType::NodeCreated => Some(WatchEventKind::NodeCreated),
        WatchedEventType::NodeDeleted => Some(WatchEventKind::NodeDeleted),
        WatchedEventType::NodeDataChanged => Some(WatchEventKind::NodeDataChanged),
        WatchedEventType::NodeChildrenChanged => Some(WatchEventKind::NodeChildrenChanged),
        _ => None,
    }
}

fn node_stat(stat: &Stat) -> NodeStat {
    NodeStat {
        version: stat.version,
        num_children: stat.num_children,
        data_length: stat.data_length,
        ephemeral_owner: stat.ephemeral_owner,
    }
}

fn zk_error(err: ZkError, path: &str) -> CoordinationError {
    match err {
        ZkError::NoNode => CoordinationError::NoNode(path.to_owned()),
        ZkError::NodeExists => CoordinationError::NodeExists(path.to_owned()),
        ZkError::NotEmpty => CoordinationError::NotEmpty(path.to_owned()),
        ZkError::ConnectionLoss | ZkError::SessionExpired | ZkError::OperationTimeout => {
            CoordinationError::NotConnected(format!("{err:?} at '{path}'"))
        }
        other => CoordinationError::Transport(format!("{other:?} at '{path}'")),
    }
}

fn join_error(err: tokio::task::JoinError) -> CoordinationError {
    CoordinationError::Transport(format!("zookeeper call did not complete: {err}"))
}
