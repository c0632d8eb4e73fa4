//! Node and global registry over one coordination client.
//!
//! Bundles a [`NodeDirectory`] for the presence service and a [`GlobalStore`]
//! for the environment behind one handle.

use std::collections::BTreeMap;

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info};

use crate::client::CoordinationClient;
use crate::directory::{DirectoryOptions, NodeDirectory};
use crate::error::CoordinationResult;
use crate::global::GlobalStore;
use crate::paths::PathResolver;

/// Presence service the registry joins when none is given.
pub const DEFAULT_REGISTRY_SERVICE: &str = "dcell_presence";

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub service_name: String,
    /// our own (node_id, address), published at start
    pub member: Option<(String, String)>,
    pub channel_size: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_REGISTRY_SERVICE.to_owned(),
            member: None,
            channel_size: 64,
        }
    }
}

impl RegistryOptions {
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    pub fn with_member(mut self, node_id: impl Into<String>, address: impl Into<String>) -> Self {
        self.member = Some((node_id.into(), address.into()));
        self
    }

    pub fn with_channel_size(mut self, size: usize) -> Self {
        self.channel_size = size;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    directory: NodeDirectory,
    globals: GlobalStore,
}

impl Registry {
    pub fn start(client: CoordinationClient, options: RegistryOptions) -> CoordinationResult<Self> {
        let resolver = PathResolver::new(client.env())?;
        let mut dir_options =
            DirectoryOptions::new(options.service_name.clone()).with_channel_size(options.channel_size);
        if let Some((node_id, address)) = options.member {
            dir_options = dir_options.with_member(node_id, address);
        }
        let directory = NodeDirectory::spawn(client.clone(), dir_options)?;
        let globals = GlobalStore::new(client, &resolver);
        info!(
            service = %options.service_name,
            env = resolver.env(),
            "registry started"
        );
        Ok(Self { directory, globals })
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    pub fn globals(&self) -> &GlobalStore {
        &self.globals
    }

    pub fn get_node(&self, node_id: &str) -> Option<String> {
        self.directory.get(node_id)
    }

    pub fn nodes(&self) -> Vec<String> {
        self.directory.nodes()
    }

    pub fn node_entries(&self) -> BTreeMap<String, String> {
        self.directory.entries()
    }

    pub fn set_node(&self, node_id: &str, address: &str) -> CoordinationResult<()> {
        self.directory.set(node_id, address)
    }

    /// The directory tracks membership on its own; nothing to clear.
    pub fn clear_nodes(&self) {
        debug!("clear_nodes ignored, membership is maintained by presence");
    }

    pub async fn get_global<T: DeserializeOwned>(&self, key: &str) -> CoordinationResult<Option<T>> {
        self.globals.get(key).await
    }

    pub async fn set_global<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CoordinationResult<()> {
        self.globals.set(key, value).await
    }

    pub async fn global_keys(&self) -> CoordinationResult<Vec<String>> {
        self.globals.keys().await
    }

    pub async fn clear_globals(&self) -> CoordinationResult<()> {
        self.globals.clear().await
    }

    pub async fn shutdown(&self) {
        self.directory.shutdown().await;
    }
}
