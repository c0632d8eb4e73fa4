//! Service membership through an ephemeral sequential node.
//!
//! A [`Presence`] keeps exactly one member node alive under
//! `/coPresence/{env}/{service}` carrying this process's address payload,
//! repairs it when it goes missing or the address changes, and republishes the
//! sibling list whenever it changes or the session comes back.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::backend::{CreateMode, WatchEvent, WatchEventKind};
use crate::client::{Connectivity, CoordinationClient, DeferredOperation};
use crate::error::{CoordinationError, CoordinationResult};
use crate::metrics::MEMBER_NODES_CREATED;
use crate::paths::{self, PathResolver};

/// Where the member payload comes from.
#[derive(Clone)]
pub enum AddressSource {
    /// the same bytes every time
    Fixed(Vec<u8>),
    /// evaluated on every connected transition, `None` publishes an empty
    /// payload
    Dynamic(Arc<dyn Fn() -> Option<Vec<u8>> + Send + Sync>),
    /// first usable interface address, as text
    LocalIp { ipv6: bool },
}

impl fmt::Debug for AddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSource::Fixed(bytes) => f.debug_tuple("Fixed").field(&bytes.len()).finish(),
            AddressSource::Dynamic(_) => f.write_str("Dynamic"),
            AddressSource::LocalIp { ipv6 } => {
                f.debug_struct("LocalIp").field("ipv6", ipv6).finish()
            }
        }
    }
}

impl AddressSource {
    pub fn fixed(address: impl Into<Vec<u8>>) -> Self {
        AddressSource::Fixed(address.into())
    }

    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn() -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        AddressSource::Dynamic(Arc::new(f))
    }

    fn resolve(&self) -> Vec<u8> {
        match self {
            AddressSource::Fixed(bytes) => bytes.clone(),
            AddressSource::Dynamic(f) => f().unwrap_or_default(),
            AddressSource::LocalIp { ipv6 } => config::local_ip(*ipv6)
                .map(|ip| ip.to_string().into_bytes())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceOptions {
    pub service_name: String,
    pub address: AddressSource,
    pub channel_size: usize,
}

impl PresenceOptions {
    pub fn new(service_name: impl Into<String>, address: AddressSource) -> Self {
        Self {
            service_name: service_name.into(),
            address,
            channel_size: 64,
        }
    }

    pub fn with_channel_size(mut self, size: usize) -> Self {
        self.channel_size = size;
        self
    }
}

/// Published to subscribers of a [`Presence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// current sibling ids, sorted
    Nodes(Vec<String>),
    /// the session dropped, the last list may be out of date
    Stale,
}

#[derive(Debug, Default)]
struct Shared {
    nodes: RwLock<Vec<String>>,
    name: Mutex<Option<String>>,
    stale: AtomicBool,
}

#[derive(Debug)]
enum Command {
    Refresh,
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running presence actor. The actor stops, and its member node is
/// deleted, on [`shutdown`](Self::shutdown) or when every handle is dropped.
#[derive(Debug, Clone)]
pub struct Presence {
    client: CoordinationClient,
    service: Arc<str>,
    base_path: Arc<str>,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<PresenceEvent>,
    shared: Arc<Shared>,
}

impl Presence {
    pub fn spawn(client: CoordinationClient, options: PresenceOptions) -> CoordinationResult<Self> {
        let base_path = PathResolver::new(client.env())?.presence_namespace(&options.service_name)?;
        let channel_size = options.channel_size.max(1);
        let (commands, command_rx) = mpsc::channel(channel_size);
        let (events, _) = broadcast::channel(channel_size);
        let shared = Arc::new(Shared::default());

        // subscribe before spawning so nothing between here and the first
        // poll is missed
        let watch_rx = client.register_watch(&base_path);
        let conn_rx = client.subscribe_connectivity();

        let actor = PresenceActor {
            client: client.clone(),
            service: options.service_name.clone(),
            base_path: base_path.clone(),
            address: options.address,
            member: None,
            events: events.clone(),
            shared: shared.clone(),
        };
        tokio::spawn(actor.run(command_rx, watch_rx, conn_rx));
        debug!(service = %options.service_name, %base_path, "presence started");

        Ok(Self {
            client,
            service: options.service_name.into(),
            base_path: base_path.into(),
            commands,
            events,
            shared,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Last published sibling list.
    pub fn nodes(&self) -> Vec<String> {
        self.shared.nodes.read().clone()
    }

    pub fn is_stale(&self) -> bool {
        self.shared.stale.load(Ordering::SeqCst)
    }

    /// Payload of sibling `child`, `None` if it is gone or the session is
    /// down.
    pub async fn get(&self, child: &str) -> CoordinationResult<Option<Vec<u8>>> {
        match self.client.get(&paths::join(&self.base_path, child)).await {
            Err(err) if err.is_no_node() => Ok(None),
            other => other,
        }
    }

    /// Sequential id of our own member node.
    pub fn name(&self) -> Option<String> {
        self.shared.name.lock().clone()
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Re-run the connected handler, re-reading the address source.
    pub fn refresh(&self) -> CoordinationResult<()> {
        match self.commands.try_send(Command::Refresh) {
            // a refresh already queued covers this one
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CoordinationError::Closed(format!(
                "presence for '{}' has stopped",
                self.service
            ))),
        }
    }

    /// Stop the actor and delete the member node (deferred if disconnected).
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

#[derive(Debug, Clone)]
struct MemberNode {
    path: String,
    address: Vec<u8>,
}

struct PresenceActor {
    client: CoordinationClient,
    service: String,
    base_path: String,
    address: AddressSource,
    member: Option<MemberNode>,
    events: broadcast::Sender<PresenceEvent>,
    shared: Arc<Shared>,
}

impl PresenceActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut watch_rx: broadcast::Receiver<WatchEvent>,
        mut conn_rx: broadcast::Receiver<Connectivity>,
    ) {
        if self.client.is_connected() {
            self.on_connected().await;
        }
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Refresh) => {
                        if self.client.is_connected() {
                            self.on_connected().await;
                        } else {
                            debug!(service = %self.service, "refresh while disconnected, waiting for reconnect");
                        }
                    }
                    Some(Command::Shutdown(done)) => {
                        self.finalize().await;
                        let _ = done.send(());
                        return;
                    }
                    None => break,
                },
                ev = watch_rx.recv() => match ev {
                    Ok(ev) => self.on_watch(ev).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!(service = %self.service, missed = n, "watch events lagged, re-reading children");
                        self.on_children_changed().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                conn = conn_rx.recv() => match conn {
                    Ok(Connectivity::Restored) => self.on_connected().await,
                    Ok(Connectivity::Lost) => self.on_lost(),
                    Err(RecvError::Lagged(_)) => {
                        if self.client.is_connected() {
                            self.on_connected().await;
                        } else {
                            self.on_lost();
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        self.finalize().await;
    }

    async fn on_connected(&mut self) {
        let address = self.address.resolve();
        let result = match self.member.clone() {
            None => self.create_member(address).await,
            Some(member) => match self.client.exists(&member.path).await {
                // session dropped again, the next Restored retries
                Ok(None) => Ok(()),
                Ok(Some(false)) => {
                    info!(service = %self.service, path = %member.path, "member node gone, recreating");
                    self.member = None;
                    self.create_member(address).await
                }
                Ok(Some(true)) if member.address != address => {
                    info!(service = %self.service, path = %member.path, "address changed, replacing member node");
                    self.member = None;
                    if let Err(err) = self
                        .client
                        .ensure(DeferredOperation::Delete { path: member.path })
                        .await
                    {
                        warn!(?err, service = %self.service, "failed to delete old member node");
                    }
                    self.create_member(address).await
                }
                Ok(Some(true)) => self.refresh_children().await,
                Err(err) => Err(err),
            },
        };
        if let Err(err) = result {
            warn!(?err, service = %self.service, "failed to sync presence");
        }
    }

    fn on_lost(&self) {
        self.shared.stale.store(true, Ordering::SeqCst);
        debug!(service = %self.service, "membership is stale");
        let _ = self.events.send(PresenceEvent::Stale);
    }

    async fn on_watch(&mut self, ev: WatchEvent) {
        match ev.kind {
            WatchEventKind::NodeChildrenChanged => self.on_children_changed().await,
            WatchEventKind::NodeDeleted => {
                warn!(service = %self.service, path = %ev.path, "namespace deleted, re-running setup");
                self.on_connected().await;
            }
            kind => trace!(service = %self.service, ?kind, "ignoring watch event"),
        }
    }

    async fn on_children_changed(&mut self) {
        match self.refresh_children().await {
            Ok(()) => {}
            Err(err) if err.is_no_node() => {
                warn!(service = %self.service, path = %self.base_path, "namespace missing, re-running setup");
                self.on_connected().await;
            }
            Err(err) => warn!(?err, service = %self.service, "failed to read siblings"),
        }
    }

    async fn create_member(&mut self, address: Vec<u8>) -> CoordinationResult<()> {
        if self.client.mkdir_recursive(&self.base_path).await?.is_none() {
            return Ok(());
        }
        let prefix = PathResolver::member_prefix(&self.base_path);
        let Some(path) = self
            .client
            .create(&prefix, address.clone(), CreateMode::EphemeralSequential)
            .await?
        else {
            return Ok(());
        };
        MEMBER_NODES_CREATED
            .with_label_values(&[self.service.as_str()])
            .inc();
        info!(service = %self.service, %path, "member node created");
        *self.shared.name.lock() = Some(paths::last_segment(&path).to_owned());
        self.member = Some(MemberNode { path, address });
        self.refresh_children().await
    }

    /// Read the siblings and re-arm the child watch in one call.
    async fn refresh_children(&mut self) -> CoordinationResult<()> {
        let Some(mut nodes) = self.client.children(&self.base_path, true).await? else {
            return Ok(());
        };
        nodes.sort();
        trace!(service = %self.service, count = nodes.len(), "publishing siblings");
        *self.shared.nodes.write() = nodes.clone();
        self.shared.stale.store(false, Ordering::SeqCst);
        let _ = self.events.send(PresenceEvent::Nodes(nodes));
        Ok(())
    }

    async fn finalize(&mut self) {
        self.client.unregister_watch(&self.base_path);
        if let Some(member) = self.member.take() {
            match self
                .client
                .ensure(DeferredOperation::Delete {
                    path: member.path.clone(),
                })
                .await
            {
                Ok(outcome) => info!(service = %self.service, path = %member.path, ?outcome, "member node released"),
                Err(err) => warn!(?err, service = %self.service, path = %member.path, "failed to release member node"),
            }
        }
        debug!(service = %self.service, "presence stopped");
    }
}
