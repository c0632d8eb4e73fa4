//! Abstract interface to the coordination service.
//!
//! `Backend` is the exact operation set the client proxies; `Connector` opens a
//! session and hands it the [`EventSink`]. Backends run their callbacks on
//! their own threads, so the sink is the only thing a callback may touch: it
//! pushes a [`SessionEvent`] and returns.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CoordinationResult;

/// Where backend callbacks hand events to the client's event loop.
pub type EventSink = mpsc::UnboundedSender<SessionEvent>;

/// Raw events produced by a backend session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session lost its server and is retrying.
    Connecting,
    /// The session is (re)established.
    Connected,
    /// A one-shot watch fired.
    Watch(WatchEvent),
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// A fired watch, tagged with the path it was armed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<String>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Returns true for a change to the children of `path`.
    pub fn is_child_event(&self) -> bool {
        self.kind == WatchEventKind::NodeChildrenChanged
    }
}

/// Node creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn new(ephemeral: bool, sequential: bool) -> Self {
        match (ephemeral, sequential) {
            (false, false) => CreateMode::Persistent,
            (true, false) => CreateMode::Ephemeral,
            (false, true) => CreateMode::PersistentSequential,
            (true, true) => CreateMode::EphemeralSequential,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// The subset of node metadata this crate uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStat {
    /// data version, bumped by every `set`
    pub version: i32,
    pub num_children: i32,
    pub data_length: i32,
    /// owning session id, zero for persistent nodes
    pub ephemeral_owner: i64,
}

/// One open session to the coordination service.
///
/// Every method fails with `NotConnected` while the session is down and
/// `NoNode` when the target (or, for `create`, its parent) is missing.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug + 'static {
    /// Data stored at `path`.
    async fn get(&self, path: &str) -> CoordinationResult<Vec<u8>>;

    /// Child names of `path`. With `watch` set, a one-shot child watch is
    /// armed as part of the same read.
    async fn children(&self, path: &str, watch: bool) -> CoordinationResult<Vec<String>>;

    /// Create `path`, returning the actual path (sequential nodes get a
    /// suffix).
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode)
    -> CoordinationResult<String>;

    /// Create `path` and any missing ancestors. Existing nodes are fine.
    async fn mkdir_recursive(&self, path: &str) -> CoordinationResult<()>;

    async fn delete(&self, path: &str) -> CoordinationResult<()>;

    /// Metadata for `path`, `None` if it does not exist.
    async fn stat(&self, path: &str) -> CoordinationResult<Option<NodeStat>>;

    async fn exists(&self, path: &str) -> CoordinationResult<bool>;

    /// Overwrite the data at an existing `path`.
    async fn set(&self, path: &str, data: Vec<u8>) -> CoordinationResult<NodeStat>;

    /// Delete `path` and everything below it. A missing `path` is fine.
    async fn remove_recursive(&self, path: &str) -> CoordinationResult<()>;

    /// End the session. Ephemeral nodes owned by it go away.
    async fn close(&self) -> CoordinationResult<()>;
}

/// Opens backend sessions.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    /// `servers` are already normalized to `host:port`. Session transitions
    /// and fired watches must be delivered through `events`.
    async fn connect(
        &self,
        servers: &[String],
        session_timeout: Duration,
        events: EventSink,
    ) -> CoordinationResult<Arc<dyn Backend>>;
}
