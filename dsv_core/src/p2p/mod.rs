//! Peer exchange: the request/response contract between repos.
//!
//! Discovery and wire transport live outside this crate. Once a peer is
//! known, everything goes through [`PeerDirectory::dial`] and the four
//! [`PeerConnection`] requests. [`Fetcher`] drives a retrieval;
//! [`PeerService`] answers requests from a local [`Repo`](crate::repo::Repo).

mod fetch;
mod service;

pub use fetch::{CancelToken, FetchConfig, FetchOutcome, FetchState, Fetcher, RetryPolicy};
pub use service::PeerService;

use crate::dataset::{DatasetRef, Profile};
use crate::dsfs::Manifest;
use crate::error::{Error, Result};
use crate::hash::{DatasetPath, Digest};
use crate::refs::RefRecord;
use crate::repo::ListParams;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A live connection to one remote peer.
///
/// Failures that may succeed on retry are reported as `Error::Transport`.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Fill in the path (and profile ID) of a named reference.
    async fn resolve(&self, reference: &DatasetRef) -> Result<DatasetRef>;

    /// Every block reachable from a version, root first.
    async fn manifest(&self, path: &DatasetPath) -> Result<Manifest>;

    /// Raw bytes of one block.
    async fn block(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// The peer's own index entries.
    async fn list(&self, params: &ListParams) -> Result<Vec<RefRecord>>;
}

/// Known peers and how to reach them.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Profile of a known peer.
    fn lookup(&self, peername: &str) -> Option<Profile>;

    /// Open a connection to a peer.
    async fn dial(&self, peer: &Profile) -> Result<Arc<dyn PeerConnection>>;
}

/// Directory over connections registered up front, e.g. in-process services.
#[derive(Default)]
pub struct StaticPeerDirectory {
    peers: RwLock<HashMap<String, (Profile, Arc<dyn PeerConnection>)>>,
}

impl fmt::Debug for StaticPeerDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peers = self.peers.read();
        let mut names: Vec<&String> = peers.keys().collect();
        names.sort();
        f.debug_struct("StaticPeerDirectory")
            .field("peers", &names)
            .finish()
    }
}

impl StaticPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a peer.
    pub fn add_peer(&self, profile: Profile, connection: Arc<dyn PeerConnection>) {
        self.peers
            .write()
            .insert(profile.peername.clone(), (profile, connection));
    }

    pub fn remove_peer(&self, peername: &str) -> bool {
        self.peers.write().remove(peername).is_some()
    }
}

#[async_trait]
impl PeerDirectory for StaticPeerDirectory {
    fn lookup(&self, peername: &str) -> Option<Profile> {
        self.peers.read().get(peername).map(|(p, _)| p.clone())
    }

    async fn dial(&self, peer: &Profile) -> Result<Arc<dyn PeerConnection>> {
        self.peers
            .read()
            .get(&peer.peername)
            .map(|(_, conn)| Arc::clone(conn))
            .ok_or_else(|| Error::transport(format!("no route to peer {}", peer.peername)))
    }
}
