//! node-id → address map built from a presence namespace.
//!
//! The directory owns a [`Presence`] publishing our own `(node_id, address)`
//! pair and diffs each sibling list it emits against the previous one. Only
//! newly seen siblings are fetched; removed siblings drop their mapping. The
//! result is eventually consistent: a watch firing the service coalesced is
//! repaired by the next list or connected transition.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::client::CoordinationClient;
use crate::codec::MemberAddress;
use crate::error::{CoordinationError, CoordinationResult};
use crate::metrics::{DIRECTORY_DECODE_FAILURES, DIRECTORY_SIZE};
use crate::presence::{AddressSource, Presence, PresenceEvent, PresenceOptions};

#[derive(Debug, Clone)]
pub struct DirectoryOptions {
    pub service_name: String,
    /// published before the presence node is first created
    pub member: Option<MemberAddress>,
    pub channel_size: usize,
}

impl DirectoryOptions {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            member: None,
            channel_size: 64,
        }
    }

    pub fn with_member(mut self, node_id: impl Into<String>, address: impl Into<String>) -> Self {
        self.member = Some(MemberAddress::new(node_id, address));
        self
    }

    pub fn with_channel_size(mut self, size: usize) -> Self {
        self.channel_size = size;
        self
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    /// siblings already handled; failed fetches are left out so the next list
    /// retries them
    members: BTreeSet<String>,
    /// sibling name => member it published
    children: BTreeMap<String, MemberAddress>,
    /// node id => address
    entries: HashMap<String, String>,
    stale: bool,
}

impl DirectoryState {
    fn insert_child(&mut self, child: String, member: MemberAddress) {
        self.members.insert(child.clone());
        self.entries
            .insert(member.node_id.clone(), member.address.clone());
        self.children.insert(child, member);
    }

    /// Drop `child`, returning the node id if no sibling still carries it.
    fn remove_child(&mut self, child: &str) -> Option<String> {
        self.members.remove(child);
        let removed = self.children.remove(child)?;
        // a re-registered node can briefly own two siblings; the newest
        // remaining one keeps the entry
        if let Some(remaining) = self
            .children
            .values()
            .rev()
            .find(|m| m.node_id == removed.node_id)
        {
            self.entries
                .insert(remaining.node_id.clone(), remaining.address.clone());
            return None;
        }
        self.entries.remove(&removed.node_id);
        Some(removed.node_id)
    }
}

#[derive(Debug)]
enum Command {
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running directory.
#[derive(Debug, Clone)]
pub struct NodeDirectory {
    presence: Presence,
    payload: Arc<Mutex<Option<Vec<u8>>>>,
    state: Arc<RwLock<DirectoryState>>,
    commands: mpsc::Sender<Command>,
}

impl NodeDirectory {
    pub fn spawn(client: CoordinationClient, options: DirectoryOptions) -> CoordinationResult<Self> {
        let initial = options.member.as_ref().map(MemberAddress::encode).transpose()?;
        let payload = Arc::new(Mutex::new(initial));
        let source = {
            let payload = payload.clone();
            AddressSource::dynamic(move || payload.lock().clone())
        };
        let presence = Presence::spawn(
            client,
            PresenceOptions::new(options.service_name.clone(), source)
                .with_channel_size(options.channel_size),
        )?;
        let events = presence.subscribe();
        let state = Arc::new(RwLock::new(DirectoryState::default()));
        let (commands, command_rx) = mpsc::channel(1);

        let actor = DirectoryActor {
            service: options.service_name,
            presence: presence.clone(),
            state: state.clone(),
        };
        tokio::spawn(actor.run(events, command_rx));

        Ok(Self {
            presence,
            payload,
            state,
            commands,
        })
    }

    /// Address registered for `node_id`.
    pub fn get(&self, node_id: &str) -> Option<String> {
        self.state.read().entries.get(node_id).cloned()
    }

    /// Known node ids, sorted.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.state.read().entries.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn entries(&self) -> BTreeMap<String, String> {
        self.state
            .read()
            .entries
            .iter()
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect()
    }

    /// True between a lost session and the next sibling list.
    pub fn is_stale(&self) -> bool {
        self.state.read().stale
    }

    /// Publish `(node_id, address)` as our member payload.
    pub fn set(&self, node_id: &str, address: &str) -> CoordinationResult<()> {
        let encoded = MemberAddress::new(node_id, address).encode()?;
        *self.payload.lock() = Some(encoded);
        debug!(service = %self.presence.service_name(), node_id, address, "publishing member address");
        self.presence.refresh()
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Stop the directory and its presence.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        } else {
            self.presence.shutdown().await;
        }
    }
}

struct DirectoryActor {
    service: String,
    presence: Presence,
    state: Arc<RwLock<DirectoryState>>,
}

impl DirectoryActor {
    async fn run(
        self,
        mut events: broadcast::Receiver<PresenceEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let seed = self.presence.nodes();
        if !seed.is_empty() {
            self.update(seed).await;
        }
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown(done)) => {
                        self.presence.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    None => break,
                },
                ev = events.recv() => match ev {
                    Ok(PresenceEvent::Nodes(nodes)) => self.update(nodes).await,
                    Ok(PresenceEvent::Stale) => {
                        self.state.write().stale = true;
                        debug!(service = %self.service, "directory is stale");
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(service = %self.service, missed = n, "sibling lists lagged, re-seeding");
                        self.update(self.presence.nodes()).await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!(service = %self.service, "directory stopped");
    }

    async fn update(&self, current: Vec<String>) {
        let current: BTreeSet<String> = current.into_iter().collect();
        let added: Vec<String> = {
            let mut state = self.state.write();
            let removed: Vec<String> = state.members.difference(&current).cloned().collect();
            for child in removed {
                if let Some(node_id) = state.remove_child(&child) {
                    info!(service = %self.service, %node_id, %child, "node left");
                }
            }
            current.difference(&state.members).cloned().collect()
        };

        let mut fetched = Vec::with_capacity(added.len());
        for child in added {
            match self.fetch(&child).await {
                Ok(Some(member)) => fetched.push((child, member)),
                Ok(None) => trace!(service = %self.service, %child, "sibling skipped"),
                Err(err) => warn!(?err, service = %self.service, %child, "failed to fetch sibling"),
            }
        }

        let mut state = self.state.write();
        for (child, member) in fetched {
            info!(service = %self.service, node_id = %member.node_id, address = %member.address, %child, "node joined");
            state.insert_child(child, member);
        }
        state.stale = false;
        DIRECTORY_SIZE
            .with_label_values(&[self.service.as_str()])
            .set(state.entries.len() as i64);
    }

    /// `Ok(None)` for a sibling that is gone or does not decode.
    async fn fetch(&self, child: &str) -> CoordinationResult<Option<MemberAddress>> {
        let Some(bytes) = self.presence.get(child).await? else {
            return Ok(None);
        };
        match MemberAddress::decode(&bytes) {
            Ok(member) => Ok(Some(member)),
            Err(CoordinationError::Codec(reason)) => {
                DIRECTORY_DECODE_FAILURES
                    .with_label_values(&[self.service.as_str()])
                    .inc();
                debug!(service = %self.service, child, %reason, "undecodable sibling payload");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
