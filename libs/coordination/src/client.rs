//! Connection manager for the coordination service.
//!
//! One `CoordinationClient` owns one backend session. Backend callbacks never
//! touch client state: they push [`SessionEvent`]s into a channel and a single
//! event-loop task applies them. Everything else in the crate goes through the
//! guarded proxies here, or through [`CoordinationClient::ensure`] when a
//! mutation must survive a disconnect.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use config::CoordinationConfig;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, Connector, CreateMode, NodeStat, SessionEvent, WatchEvent};
use crate::error::{CoordinationError, CoordinationResult};
use crate::metrics::{
    ENSURE_QUEUE_DEPTH, ENSURE_REPLAYED, ENSURE_RESULTS, SESSION_TRANSITIONS, SKIPPED_OPS,
};

/// Port appended to server entries that do not carry one.
pub const DEFAULT_PORT: u16 = 2181;

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Session up, operations execute.
    Connected,
    /// Session exists but lost its server; the backend is retrying.
    Connecting,
    /// No session, `connect` was never called or the client was closed.
    Disconnected,
}

/// Broadcast on every session transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// connected, deferred operations already replayed
    Restored,
    /// link lost
    Lost,
}

/// A mutation that must eventually execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredOperation {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    MkdirRecursive {
        path: String,
    },
    Delete {
        path: String,
    },
    Set {
        path: String,
        data: Vec<u8>,
    },
    RemoveRecursive {
        path: String,
    },
}

impl DeferredOperation {
    pub fn name(&self) -> &'static str {
        match self {
            DeferredOperation::Create { .. } => "create",
            DeferredOperation::MkdirRecursive { .. } => "mkdir_recursive",
            DeferredOperation::Delete { .. } => "delete",
            DeferredOperation::Set { .. } => "set",
            DeferredOperation::RemoveRecursive { .. } => "remove_recursive",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            DeferredOperation::Create { path, .. }
            | DeferredOperation::MkdirRecursive { path }
            | DeferredOperation::Delete { path }
            | DeferredOperation::Set { path, .. }
            | DeferredOperation::RemoveRecursive { path } => path,
        }
    }

    async fn execute(&self, backend: &dyn Backend) -> CoordinationResult<()> {
        match self {
            DeferredOperation::Create { path, data, mode } => {
                backend.create(path, data.clone(), *mode).await.map(|_| ())
            }
            DeferredOperation::MkdirRecursive { path } => backend.mkdir_recursive(path).await,
            DeferredOperation::Delete { path } => backend.delete(path).await,
            DeferredOperation::Set { path, data } => {
                backend.set(path, data.clone()).await.map(|_| ())
            }
            DeferredOperation::RemoveRecursive { path } => backend.remove_recursive(path).await,
        }
    }
}

/// What [`CoordinationClient::ensure`] did with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// ran against the live session
    Executed,
    /// queued until the next connected transition
    Deferred,
    /// target did not exist, nothing to do
    AlreadyGone,
}

struct WatchSubscription {
    refcount: usize,
    /// a one-shot child watch is pending on the service for this path
    armed: bool,
    sender: broadcast::Sender<WatchEvent>,
}

struct ClientInner {
    config: CoordinationConfig,
    servers: Vec<String>,
    session: RwLock<Option<Arc<dyn Backend>>>,
    /// written only by the event loop and `close`
    connected: AtomicBool,
    /// held across a whole ensure or replay so ordering is strict
    ensure_queue: AsyncMutex<VecDeque<DeferredOperation>>,
    watches: Mutex<HashMap<String, WatchSubscription>>,
    connectivity: broadcast::Sender<Connectivity>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Shared handle to one coordination session.
///
/// Cloning is cheap; all clones see the same session, ensure queue and watch
/// table.
#[derive(Clone)]
pub struct CoordinationClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for CoordinationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("servers", &self.inner.servers)
            .field("env", &self.inner.config.env)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl CoordinationClient {
    /// Validate `config` without connecting. Call [`connect`](Self::connect)
    /// to open the session.
    pub fn new(config: CoordinationConfig) -> CoordinationResult<Self> {
        config
            .validate()
            .map_err(|e| CoordinationError::Config(format!("{e:#}")))?;
        let servers: Vec<String> = config
            .servers
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| normalize_server(s))
            .collect();
        let (connectivity, _) = broadcast::channel(config.channel_size);
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                servers,
                session: RwLock::new(None),
                connected: AtomicBool::new(false),
                ensure_queue: AsyncMutex::new(VecDeque::new()),
                watches: Mutex::new(HashMap::new()),
                connectivity,
                event_task: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.inner.config
    }

    pub fn env(&self) -> &str {
        &self.inner.config.env
    }

    /// Normalized `host:port` server list.
    pub fn servers(&self) -> &[String] {
        &self.inner.servers
    }

    /// Open the session through `connector`, or reuse the one already open.
    pub async fn connect(&self, connector: &dyn Connector) -> CoordinationResult<()> {
        let mut session = self.inner.session.write().await;
        if session.is_some() {
            debug!(servers = ?self.inner.servers, "reusing existing coordination session");
            return Ok(());
        }

        info!(servers = ?self.inner.servers, "opening coordination session");
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = connector
            .connect(&self.inner.servers, self.inner.config.session_timeout, tx)
            .await?;
        *session = Some(backend);

        let task = tokio::spawn(run_events(Arc::downgrade(&self.inner), rx));
        if let Some(old) = self.inner.event_task.lock().replace(task) {
            old.abort();
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        if self.inner.session.read().await.is_none() {
            ConnectionState::Disconnected
        } else if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Connecting
        }
    }

    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<Connectivity> {
        self.inner.connectivity.subscribe()
    }

    /// Deferred operations waiting for the next connected transition.
    pub async fn pending_ensures(&self) -> usize {
        self.inner.ensure_queue.lock().await.len()
    }

    /// End the session. Deferred operations still queued are kept and replay
    /// if the client is connected again.
    pub async fn close(&self) -> CoordinationResult<()> {
        let session = self.inner.session.write().await.take();
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        if let Some(task) = self.inner.event_task.lock().take() {
            task.abort();
        }
        if was_connected {
            let _ = self.inner.connectivity.send(Connectivity::Lost);
        }
        if let Some(session) = session {
            session.close().await?;
            info!("coordination session closed");
        }
        Ok(())
    }

    // -- watches --

    /// Subscribe to watch events for `path`. Every call must be paired with
    /// one [`unregister_watch`](Self::unregister_watch).
    pub fn register_watch(&self, path: &str) -> broadcast::Receiver<WatchEvent> {
        let mut watches = self.inner.watches.lock();
        let sub = watches.entry(path.to_owned()).or_insert_with(|| {
            debug!(path, "registering watch");
            WatchSubscription {
                refcount: 0,
                armed: false,
                sender: broadcast::channel(self.inner.config.channel_size).0,
            }
        });
        sub.refcount += 1;
        sub.sender.subscribe()
    }

    pub fn unregister_watch(&self, path: &str) {
        let mut watches = self.inner.watches.lock();
        let Some(sub) = watches.get_mut(path) else {
            warn!(path, "unregistering a watch that was never registered");
            return;
        };
        sub.refcount = sub.refcount.saturating_sub(1);
        if sub.refcount == 0 {
            watches.remove(path);
            debug!(path, "watch unregistered");
        }
    }

    /// Current registration count for `path`.
    pub fn watch_refcount(&self, path: &str) -> usize {
        self.inner
            .watches
            .lock()
            .get(path)
            .map_or(0, |sub| sub.refcount)
    }

    /// Whether the service currently holds a child watch armed for `path`.
    pub fn watch_armed(&self, path: &str) -> bool {
        self.inner
            .watches
            .lock()
            .get(path)
            .is_some_and(|sub| sub.armed)
    }

    /// Claim the right to arm a child watch on `path`. Registered paths are
    /// armed at most once until the watch fires.
    fn claim_watch(&self, path: &str) -> bool {
        match self.inner.watches.lock().get_mut(path) {
            Some(sub) if sub.armed => false,
            Some(sub) => {
                sub.armed = true;
                true
            }
            None => true,
        }
    }

    fn release_watch(&self, path: &str) {
        if let Some(sub) = self.inner.watches.lock().get_mut(path) {
            sub.armed = false;
        }
    }

    fn dispatch_watch(&self, event: WatchEvent) {
        let mut watches = self.inner.watches.lock();
        match watches.get_mut(&event.path) {
            Some(sub) => {
                trace!(path = %event.path, kind = ?event.kind, "dispatching watch event");
                sub.armed = false;
                let _ = sub.sender.send(event);
            }
            None => trace!(path = %event.path, "no watch registered, dropping event"),
        }
    }

    // -- session events --

    async fn on_connected(&self) {
        let reconnect = self.inner.connected.swap(true, Ordering::SeqCst);
        SESSION_TRANSITIONS.connected.inc();
        info!(reconnect, "coordination session connected");
        if !self.replay_deferred().await {
            debug!("replay interrupted, waiting for the next connected transition");
            return;
        }
        let _ = self.inner.connectivity.send(Connectivity::Restored);
    }

    fn on_connecting(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        // watches do not outlive the connection; re-arm on the next read
        for sub in self.inner.watches.lock().values_mut() {
            sub.armed = false;
        }
        SESSION_TRANSITIONS.connecting.inc();
        warn!("coordination session lost, backend is reconnecting");
        let _ = self.inner.connectivity.send(Connectivity::Lost);
    }

    /// Drain the ensure queue. `false` if the session dropped part way.
    async fn replay_deferred(&self) -> bool {
        let mut queue = self.inner.ensure_queue.lock().await;
        if queue.is_empty() {
            return true;
        }
        info!(pending = queue.len(), "replaying deferred operations");
        while let Some(op) = queue.pop_front() {
            ENSURE_QUEUE_DEPTH.dec();
            ENSURE_REPLAYED.inc();
            match self.execute_ensured(&op).await {
                Ok(outcome) => debug!(op = op.name(), path = op.path(), ?outcome, "replayed"),
                Err(CoordinationError::NotConnected(_)) => {
                    warn!(
                        op = op.name(),
                        path = op.path(),
                        remaining = queue.len() + 1,
                        "session dropped during replay"
                    );
                    queue.push_front(op);
                    ENSURE_QUEUE_DEPTH.inc();
                    return false;
                }
                Err(err) => {
                    ENSURE_RESULTS.failed.inc();
                    warn!(?err, op = op.name(), path = op.path(), "deferred operation failed, dropping");
                }
            }
        }
        true
    }

    // -- ensure --

    /// Run `op` now if possible, otherwise queue it behind every earlier
    /// deferred operation.
    pub async fn ensure(&self, op: DeferredOperation) -> CoordinationResult<EnsureOutcome> {
        let mut queue = self.inner.ensure_queue.lock().await;
        if self.is_connected() && queue.is_empty() {
            match self.execute_ensured(&op).await {
                Err(CoordinationError::NotConnected(_)) => {}
                Err(err) => {
                    ENSURE_RESULTS.failed.inc();
                    warn!(?err, op = op.name(), path = op.path(), "ensured operation failed");
                    return Err(err);
                }
                outcome => return outcome,
            }
        }
        debug!(op = op.name(), path = op.path(), "deferring until reconnect");
        queue.push_back(op);
        ENSURE_QUEUE_DEPTH.inc();
        ENSURE_RESULTS.deferred.inc();
        Ok(EnsureOutcome::Deferred)
    }

    async fn execute_ensured(&self, op: &DeferredOperation) -> CoordinationResult<EnsureOutcome> {
        let session = self
            .inner
            .session
            .read()
            .await
            .clone()
            .ok_or_else(|| CoordinationError::NotConnected("no session".into()))?;
        match op.execute(session.as_ref()).await {
            Ok(()) => {
                ENSURE_RESULTS.executed.inc();
                Ok(EnsureOutcome::Executed)
            }
            Err(CoordinationError::NoNode(path)) => {
                debug!(op = op.name(), %path, "target already gone");
                ENSURE_RESULTS.already_gone.inc();
                Ok(EnsureOutcome::AlreadyGone)
            }
            Err(err) => Err(err),
        }
    }

    // -- guarded proxies --

    async fn guarded<T, F, Fut>(&self, op: &'static str, path: &str, f: F) -> CoordinationResult<Option<T>>
    where
        F: FnOnce(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = CoordinationResult<T>>,
    {
        if !self.is_connected() {
            SKIPPED_OPS.with_label_values(&[op]).inc();
            trace!(op, path, "not connected, skipping");
            return Ok(None);
        }
        let Some(session) = self.inner.session.read().await.clone() else {
            SKIPPED_OPS.with_label_values(&[op]).inc();
            return Ok(None);
        };
        match f(session).await {
            Ok(value) => Ok(Some(value)),
            Err(CoordinationError::NotConnected(reason)) => {
                SKIPPED_OPS.with_label_values(&[op]).inc();
                debug!(op, path, %reason, "session dropped mid-call");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, path: &str) -> CoordinationResult<Option<Vec<u8>>> {
        self.guarded("get", path, |s| async move { s.get(path).await })
            .await
    }

    /// Children of `path`. With `watch`, a one-shot child watch is left on
    /// the service unless one is already pending for this path.
    pub async fn children(&self, path: &str, watch: bool) -> CoordinationResult<Option<Vec<String>>> {
        let arm = watch && self.claim_watch(path);
        let children = self
            .guarded("children", path, |s| async move { s.children(path, arm).await })
            .await;
        if arm && !matches!(children, Ok(Some(_))) {
            self.release_watch(path);
        }
        children
    }

    pub async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> CoordinationResult<Option<String>> {
        self.guarded("create", path, |s| async move { s.create(path, data, mode).await })
            .await
    }

    pub async fn mkdir_recursive(&self, path: &str) -> CoordinationResult<Option<()>> {
        self.guarded("mkdir_recursive", path, |s| async move {
            s.mkdir_recursive(path).await
        })
        .await
    }

    pub async fn delete(&self, path: &str) -> CoordinationResult<Option<()>> {
        self.guarded("delete", path, |s| async move { s.delete(path).await })
            .await
    }

    /// Metadata of `path`; a missing node is `NoNode`.
    pub async fn stat(&self, path: &str) -> CoordinationResult<Option<NodeStat>> {
        self.guarded("stat", path, |s| async move {
            s.stat(path)
                .await?
                .ok_or_else(|| CoordinationError::NoNode(path.to_owned()))
        })
        .await
    }

    pub async fn exists(&self, path: &str) -> CoordinationResult<Option<bool>> {
        self.guarded("exists", path, |s| async move { s.exists(path).await })
            .await
    }

    pub async fn set(&self, path: &str, data: Vec<u8>) -> CoordinationResult<Option<NodeStat>> {
        self.guarded("set", path, |s| async move { s.set(path, data).await })
            .await
    }

    pub async fn remove_recursive(&self, path: &str) -> CoordinationResult<Option<()>> {
        self.guarded("remove_recursive", path, |s| async move {
            s.remove_recursive(path).await
        })
        .await
    }
}

async fn run_events(inner: Weak<ClientInner>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let client = CoordinationClient { inner };
        match event {
            SessionEvent::Connected => client.on_connected().await,
            SessionEvent::Connecting => client.on_connecting(),
            SessionEvent::Watch(ev) => client.dispatch_watch(ev),
        }
    }
    debug!("coordination event loop exiting");
}

/// `host` → `host:2181`; entries with a port are kept.
pub fn normalize_server(server: &str) -> String {
    let server = server.trim();
    if has_port(server) {
        server.to_owned()
    } else {
        format!("{server}:{DEFAULT_PORT}")
    }
}

fn has_port(server: &str) -> bool {
    match server.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            // a bare v6 literal is all colons
            !host.contains(':') || host.ends_with(']')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::backend::WatchEventKind;
    use crate::memory::{MemoryCluster, MemoryConnector};

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn connected() -> (MemoryCluster, MemoryConnector, CoordinationClient) {
        let cluster = MemoryCluster::new();
        let connector = cluster.connector();
        let client = CoordinationClient::new(CoordinationConfig::new(["zk1"])).unwrap();
        let mut rx = client.subscribe_connectivity();
        client.connect(&connector).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Connectivity::Restored);
        (cluster, connector, client)
    }

    #[test]
    fn test_normalize_server() {
        assert_eq!(normalize_server("zk1"), "zk1:2181");
        assert_eq!(normalize_server("zk1:2182"), "zk1:2182");
        assert_eq!(normalize_server(" 10.0.0.1 "), "10.0.0.1:2181");
        assert_eq!(normalize_server("[::1]"), "[::1]:2181");
        assert_eq!(normalize_server("[::1]:2888"), "[::1]:2888");
    }

    #[test]
    fn test_new_requires_servers() {
        let err = CoordinationClient::new(CoordinationConfig::new(Vec::<String>::new())).unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));
        let err = CoordinationClient::new(CoordinationConfig::new(["  "])).unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));

        let client = CoordinationClient::new(CoordinationConfig::new(["a", "b:1"])).unwrap();
        assert_eq!(client.servers(), ["a:2181", "b:1"]);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (cluster, connector, client) = connected().await;
        client.connect(&connector).await.unwrap();
        client.clone().connect(&cluster.connector()).await.unwrap();
        assert_eq!(cluster.session_count(), 1);
        assert_eq!(client.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_proxies_skip_while_disconnected() {
        let (cluster, connector, client) = connected().await;
        assert_eq!(client.mkdir_recursive("/a").await.unwrap(), Some(()));

        connector.disconnect();
        let view = client.clone();
        wait_until(move || !view.is_connected()).await;
        assert_eq!(client.connection_state().await, ConnectionState::Connecting);

        assert_eq!(client.get("/a").await.unwrap(), None);
        assert_eq!(
            client
                .create("/a/b", vec![], CreateMode::Persistent)
                .await
                .unwrap(),
            None
        );
        assert!(cluster.data("/a/b").is_none());
    }

    #[tokio::test]
    async fn test_proxy_errors_propagate() {
        let (_cluster, _connector, client) = connected().await;
        assert!(client.get("/missing").await.unwrap_err().is_no_node());
        assert!(client.stat("/missing").await.unwrap_err().is_no_node());
        assert_eq!(client.exists("/missing").await.unwrap(), Some(false));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_ensure_defers_and_replays_in_order() {
        let (cluster, connector, client) = connected().await;
        connector.disconnect();
        let view = client.clone();
        wait_until(move || !view.is_connected()).await;

        let ops = vec![
            DeferredOperation::MkdirRecursive { path: "/q".into() },
            DeferredOperation::Create {
                path: "/q/x".into(),
                data: b"1".to_vec(),
                mode: CreateMode::Persistent,
            },
            DeferredOperation::Set {
                path: "/q/x".into(),
                data: b"2".to_vec(),
            },
            DeferredOperation::Set {
                path: "/q/x".into(),
                data: b"3".to_vec(),
            },
        ];
        for op in ops {
            assert_eq!(client.ensure(op).await.unwrap(), EnsureOutcome::Deferred);
        }
        assert_eq!(client.pending_ensures().await, 4);

        connector.reconnect();
        let view = client.clone();
        wait_until(move || view.is_connected()).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.pending_ensures().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(cluster.data("/q/x"), Some(b"3".to_vec()));
        assert!(logs_contain("deferring until reconnect"));
    }

    #[tokio::test]
    async fn test_ensure_no_node_is_benign() {
        let (_cluster, _connector, client) = connected().await;
        let outcome = client
            .ensure(DeferredOperation::Delete {
                path: "/nothing".into(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::AlreadyGone);

        let outcome = client
            .ensure(DeferredOperation::MkdirRecursive { path: "/x/y".into() })
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Executed);

        // other failures surface
        let err = client
            .ensure(DeferredOperation::Delete { path: "/x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NotEmpty(_)));
    }

    #[tokio::test]
    async fn test_watch_refcount_and_dispatch() {
        let (_cluster, _connector, client) = connected().await;
        let mut first = client.register_watch("/w");
        let _second = client.register_watch("/w");
        assert_eq!(client.watch_refcount("/w"), 2);

        client.mkdir_recursive("/w").await.unwrap();
        client.children("/w", true).await.unwrap();
        client
            .create("/w/a", vec![], CreateMode::Persistent)
            .await
            .unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(2), first.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev, WatchEvent::new("/w", WatchEventKind::NodeChildrenChanged));

        client.unregister_watch("/w");
        assert_eq!(client.watch_refcount("/w"), 1);
        client.unregister_watch("/w");
        assert_eq!(client.watch_refcount("/w"), 0);
    }

    #[tokio::test]
    async fn test_child_watch_armed_once() {
        let (cluster, connector, client) = connected().await;
        let mut events = client.register_watch("/w");
        client.mkdir_recursive("/w").await.unwrap();
        for _ in 0..3 {
            client.children("/w", true).await.unwrap();
        }
        assert!(client.watch_armed("/w"));
        assert_eq!(cluster.armed_watches("/w"), 1);

        client
            .create("/w/a", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        let ev = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.kind, WatchEventKind::NodeChildrenChanged);
        assert!(!client.watch_armed("/w"));
        assert_eq!(cluster.armed_watches("/w"), 0);
        assert!(events.try_recv().is_err());

        client.children("/w", true).await.unwrap();
        assert_eq!(cluster.armed_watches("/w"), 1);

        // a dropped connection takes its watches along
        let mut rx = client.subscribe_connectivity();
        connector.disconnect();
        assert_eq!(rx.recv().await.unwrap(), Connectivity::Lost);
        assert!(!client.watch_armed("/w"));
        assert_eq!(cluster.armed_watches("/w"), 0);
        connector.reconnect();
        assert_eq!(rx.recv().await.unwrap(), Connectivity::Restored);
        client.children("/w", true).await.unwrap();
        client.children("/w", true).await.unwrap();
        assert_eq!(cluster.armed_watches("/w"), 1);
        client.unregister_watch("/w");
    }

    #[tokio::test]
    async fn test_interrupted_replay_holds_restored() {
        let (cluster, connector, client) = connected().await;
        let mut rx = client.subscribe_connectivity();
        connector.disconnect();
        assert_eq!(rx.recv().await.unwrap(), Connectivity::Lost);
        let outcome = client
            .ensure(DeferredOperation::MkdirRecursive { path: "/r".into() })
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Deferred);

        // the link drops again before the event loop sees it come back
        connector.reconnect();
        connector.disconnect();
        assert_eq!(rx.recv().await.unwrap(), Connectivity::Lost);
        assert_eq!(client.pending_ensures().await, 1);
        assert!(cluster.data("/r").is_none());

        connector.reconnect();
        assert_eq!(rx.recv().await.unwrap(), Connectivity::Restored);
        assert_eq!(client.pending_ensures().await, 0);
        assert!(cluster.data("/r").is_some());
    }

    #[tokio::test]
    async fn test_connectivity_events() {
        let (_cluster, connector, client) = connected().await;
        let mut rx = client.subscribe_connectivity();
        connector.disconnect();
        assert_eq!(rx.recv().await.unwrap(), Connectivity::Lost);
        connector.reconnect();
        assert_eq!(rx.recv().await.unwrap(), Connectivity::Restored);
    }

    #[tokio::test]
    async fn test_close() {
        let (cluster, _connector, client) = connected().await;
        client.close().await.unwrap();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(cluster.session_count(), 0);
        assert_eq!(client.get("/").await.unwrap(), None);
    }
}
