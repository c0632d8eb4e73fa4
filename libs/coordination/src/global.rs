//! Flat key/value store under `/dcell_global/{env}`.

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info};

use crate::backend::CreateMode;
use crate::client::CoordinationClient;
use crate::codec;
use crate::error::{CoordinationError, CoordinationResult};
use crate::paths::{self, PathResolver};

#[derive(Debug, Clone)]
pub struct GlobalStore {
    client: CoordinationClient,
    base_path: String,
}

impl GlobalStore {
    pub fn new(client: CoordinationClient, resolver: &PathResolver) -> Self {
        Self {
            client,
            base_path: resolver.global_namespace(),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Decoded value of `key`, `None` if unset or the session is down.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CoordinationResult<Option<T>> {
        match self.get_raw(key).await? {
            Some(bytes) => codec::decode_value(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_raw(&self, key: &str) -> CoordinationResult<Option<Vec<u8>>> {
        let path = self.key_path(key)?;
        match self.client.get(&path).await {
            Err(err) if err.is_no_node() => Ok(None),
            other => other,
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CoordinationResult<()> {
        self.set_raw(key, codec::encode_value(value)?).await
    }

    /// Update `key` in place, creating it if it does not exist yet.
    pub async fn set_raw(&self, key: &str, data: Vec<u8>) -> CoordinationResult<()> {
        let path = self.key_path(key)?;
        match self.client.set(&path, data.clone()).await {
            Ok(Some(stat)) => {
                debug!(%path, version = stat.version, "global updated");
                Ok(())
            }
            Ok(None) => Err(skipped(&path)),
            Err(err) if err.is_no_node() => self.create(&path, data).await,
            Err(err) => Err(err),
        }
    }

    async fn create(&self, path: &str, data: Vec<u8>) -> CoordinationResult<()> {
        let mut created = self
            .client
            .create(path, data.clone(), CreateMode::Persistent)
            .await;
        if matches!(&created, Err(err) if err.is_no_node()) {
            debug!(base = %self.base_path, "creating global namespace");
            self.client
                .mkdir_recursive(&self.base_path)
                .await?
                .ok_or_else(|| skipped(&self.base_path))?;
            created = self.client.create(path, data, CreateMode::Persistent).await;
        }
        match created {
            Ok(Some(_)) => {
                debug!(%path, "global created");
                Ok(())
            }
            Ok(None) => Err(skipped(path)),
            // a concurrent first writer got there before us
            Err(err) if err.is_node_exists() => {
                debug!(%path, "global created concurrently");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Keys currently set, sorted.
    pub async fn keys(&self) -> CoordinationResult<Vec<String>> {
        match self.client.children(&self.base_path, false).await {
            Ok(Some(mut keys)) => {
                keys.sort();
                Ok(keys)
            }
            Ok(None) => Err(skipped(&self.base_path)),
            Err(err) if err.is_no_node() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Delete every key.
    pub async fn clear(&self) -> CoordinationResult<()> {
        self.client
            .remove_recursive(&self.base_path)
            .await?
            .ok_or_else(|| skipped(&self.base_path))?;
        self.client
            .mkdir_recursive(&self.base_path)
            .await?
            .ok_or_else(|| skipped(&self.base_path))?;
        info!(base = %self.base_path, "globals cleared");
        Ok(())
    }

    fn key_path(&self, key: &str) -> CoordinationResult<String> {
        paths::validate_segment("global key", key)?;
        Ok(paths::join(&self.base_path, key))
    }
}

fn skipped(path: &str) -> CoordinationError {
    CoordinationError::NotConnected(format!("skipped write to '{path}'"))
}
