//! # coordination
//!
//! Cluster membership and a shared key/value namespace on top of a
//! ZooKeeper-style coordination service.
//!
//! This library provides:
//! - **Connection manager** owning one session, with guarded proxy
//!   operations, an ordered ensure queue replayed on reconnect and
//!   refcounted watch registrations.
//! - **Presence** keeping one ephemeral sequential member node alive per
//!   service and publishing the sibling list.
//! - **Node directory** turning sibling lists into a node-id → address map.
//! - **Global store** for flat, environment scoped values.
//! - **Registry** bundling a directory and a global store.
//! - **Backends**: ZooKeeper (feature `zookeeper`) and an in-process cluster.
//!
//! ## Design Principles
//!
//! - Backend callbacks only hand events to the client's event loop.
//! - No path strings are built outside [`paths`].
//! - Payloads use an explicit, versioned byte layout ([`codec`]).

pub mod backend;
pub mod client;
pub mod codec;
pub mod directory;
pub mod error;
pub mod global;
pub mod memory;
pub mod metrics;
pub mod paths;
pub mod presence;
pub mod registry;
#[cfg(feature = "zookeeper")]
pub mod zk;

// Re-export key types for convenient access
pub use backend::{Backend, Connector, CreateMode, NodeStat, SessionEvent, WatchEvent, WatchEventKind};
pub use client::{
    ConnectionState, Connectivity, CoordinationClient, DeferredOperation, EnsureOutcome,
};
pub use codec::MemberAddress;
pub use directory::{DirectoryOptions, NodeDirectory};
pub use error::{CoordinationError, CoordinationResult};
pub use global::GlobalStore;
pub use memory::{MemoryCluster, MemoryConnector};
pub use paths::PathResolver;
pub use presence::{AddressSource, Presence, PresenceEvent, PresenceOptions};
pub use registry::{DEFAULT_REGISTRY_SERVICE, Registry, RegistryOptions};
#[cfg(feature = "zookeeper")]
pub use zk::ZkConnector;
