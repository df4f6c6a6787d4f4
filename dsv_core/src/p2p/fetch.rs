//! Retrieval of a remote dataset version into the local block store.
//!
//! A fetch is an explicit state machine:
//!
//! ```text
//! Requested -> Dialing -> AwaitingManifest -> TransferringBlocks -> Verified -> Complete
//! ```
//!
//! Each phase is a plain function over the run state; the only suspension
//! points are the network requests. Fetched blocks are staged in memory and
//! reach the store only after every one of them has been verified, so a
//! failed or cancelled fetch leaves the store exactly as it was.

use super::{PeerConnection, PeerDirectory};
use crate::dataset::{DatasetRef, Profile};
use crate::dsfs::{self, Manifest, ManifestEntry};
use crate::error::{Error, Result};
use crate::hash::{DatasetPath, Digest};
use crate::refs::RefRecord;
use crate::repo::ListParams;
use crate::store::BlockStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Fetch tuning: retries, timeouts and manifest ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Attempts per request, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Timeout for a single request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_manifest_blocks")]
    pub max_manifest_blocks: usize,

    #[serde(default = "default_max_manifest_bytes")]
    pub max_manifest_bytes: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_manifest_blocks() -> usize {
    100_000
}

fn default_max_manifest_bytes() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_manifest_blocks: default_max_manifest_blocks(),
            max_manifest_bytes: default_max_manifest_bytes(),
        }
    }
}

impl FetchConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("fetch.max_attempts must be at least 1".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(format!(
                "fetch.base_delay_ms ({}) exceeds fetch.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err("fetch.request_timeout_ms must be positive".to_string());
        }
        if self.max_manifest_blocks == 0 || self.max_manifest_bytes == 0 {
            return Err("fetch manifest ceilings must be positive".to_string());
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Where a fetch is, or how it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchState {
    Requested,
    Dialing,
    AwaitingManifest,
    TransferringBlocks,
    Verified,
    Complete,
    PeerUnreachable,
    ManifestInvalid,
    BlockMismatch,
    ManifestTooLarge,
    TransferFailed,
    Cancelled,
}

impl FetchState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            FetchState::Requested
                | FetchState::Dialing
                | FetchState::AwaitingManifest
                | FetchState::TransferringBlocks
                | FetchState::Verified
        )
    }

    /// Terminal state for a failed fetch.
    pub fn failed_with(error: &Error) -> Self {
        match error {
            Error::PeerUnreachable { .. } => FetchState::PeerUnreachable,
            Error::ManifestInvalid { .. } => FetchState::ManifestInvalid,
            Error::BlockMismatch { .. } => FetchState::BlockMismatch,
            Error::ManifestTooLarge { .. } => FetchState::ManifestTooLarge,
            Error::Cancelled => FetchState::Cancelled,
            _ => FetchState::TransferFailed,
        }
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation shared between a fetch and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Resolves when the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Result of a completed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// The fetched reference with peername, profile ID and path filled in.
    pub reference: DatasetRef,
    pub manifest_blocks: usize,
    /// Blocks actually transferred; the rest were already local.
    pub transferred: usize,
    pub transferred_bytes: u64,
}

/// Drives fetches against a peer directory into a local store.
pub struct Fetcher {
    directory: Arc<dyn PeerDirectory>,
    store: Arc<dyn BlockStore>,
    config: FetchConfig,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish()
    }
}

enum Call<'a> {
    Dial(&'a str),
    Request(&'a str),
}

impl Fetcher {
    pub fn new(
        directory: Arc<dyn PeerDirectory>,
        store: Arc<dyn BlockStore>,
        config: FetchConfig,
    ) -> Self {
        Self {
            directory,
            store,
            config,
        }
    }

    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch the version named by `reference` from its peer.
    ///
    /// On success every block of the version, history included, is in the
    /// local store. On failure nothing from this fetch was written.
    pub async fn fetch(&self, reference: &DatasetRef, cancel: &CancelToken) -> Result<FetchOutcome> {
        let mut run = FetchRun::new(reference.clone());
        match self.drive(&mut run, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                run.transition(FetchState::failed_with(&e));
                warn!(
                    reference = %run.reference,
                    state = ?run.state,
                    error = %e,
                    "fetch failed"
                );
                Err(e)
            }
        }
    }

    async fn drive(&self, run: &mut FetchRun, cancel: &CancelToken) -> Result<FetchOutcome> {
        loop {
            cancel.check()?;
            match run.state {
                FetchState::Requested => {
                    let peer = self.locate(&run.reference)?;
                    run.peer = Some(peer);
                    run.transition(FetchState::Dialing);
                }
                FetchState::Dialing => {
                    let peer = run.peer()?.clone();
                    let conn = self.connect(&peer, cancel).await?;
                    run.conn = Some(conn);
                    run.transition(FetchState::AwaitingManifest);
                }
                FetchState::AwaitingManifest => {
                    let conn = run.conn()?;
                    if run.reference.path.is_none() {
                        let reference = run.reference.clone();
                        let resolved = self
                            .call(Call::Request("resolve"), cancel, || conn.resolve(&reference))
                            .await?;
                        run.accept_resolved(resolved)?;
                    }
                    let root = run.root()?;
                    let manifest = self
                        .call(Call::Request("manifest"), cancel, || conn.manifest(&root))
                        .await?;
                    run.accept_manifest(manifest, &self.config)?;
                    run.select_missing(self.store.as_ref())?;
                    run.transition(FetchState::TransferringBlocks);
                }
                FetchState::TransferringBlocks => {
                    let conn = run.conn()?;
                    for entry in run.missing.clone() {
                        cancel.check()?;
                        let bytes = self
                            .call(Call::Request("block"), cancel, || conn.block(&entry.digest))
                            .await?;
                        run.stage(&entry, bytes)?;
                    }
                    run.verify(self.store.as_ref(), &self.config)?;
                    run.transition(FetchState::Verified);
                }
                FetchState::Verified => {
                    let outcome = run.commit(self.store.as_ref())?;
                    run.transition(FetchState::Complete);
                    info!(
                        reference = %outcome.reference,
                        blocks = outcome.manifest_blocks,
                        transferred = outcome.transferred,
                        bytes = outcome.transferred_bytes,
                        "fetch complete"
                    );
                    return Ok(outcome);
                }
                state => {
                    return Err(Error::transfer_failed(format!(
                        "fetch cannot continue from {:?}",
                        state
                    )));
                }
            }
        }
    }

    /// Ask the reference's peer to resolve it, without transferring blocks.
    pub async fn resolve_remote(
        &self,
        reference: &DatasetRef,
        cancel: &CancelToken,
    ) -> Result<DatasetRef> {
        cancel.check()?;
        let peer = self.locate(reference)?;
        let conn = self.connect(&peer, cancel).await?;
        let mut resolved = self
            .call(Call::Request("resolve"), cancel, || conn.resolve(reference))
            .await?;
        if resolved.path.is_none() {
            return Err(Error::not_found(format!(
                "dataset {} on peer",
                reference.alias()
            )));
        }
        if resolved.profile_id.is_none() {
            resolved.profile_id = Some(peer.id);
        }
        Ok(resolved)
    }

    /// List a remote peer's datasets.
    pub async fn list_remote(
        &self,
        peername: &str,
        params: &ListParams,
        cancel: &CancelToken,
    ) -> Result<Vec<RefRecord>> {
        cancel.check()?;
        let peer = self.locate(&DatasetRef::peer(peername))?;
        let conn = self.connect(&peer, cancel).await?;
        self.call(Call::Request("list"), cancel, || conn.list(params))
            .await
    }

    async fn connect(&self, peer: &Profile, cancel: &CancelToken) -> Result<Arc<dyn PeerConnection>> {
        self.call(Call::Dial(&peer.peername), cancel, || self.directory.dial(peer))
            .await
    }

    fn locate(&self, reference: &DatasetRef) -> Result<Profile> {
        if reference.peername.is_empty() {
            return Err(Error::bad_request(format!(
                "fetch requires a peername: {}",
                reference
            )));
        }
        self.directory
            .lookup(&reference.peername)
            .ok_or_else(|| Error::not_found(format!("peer {}", reference.peername)))
    }

    /// One network call under timeout, retry and cancellation.
    async fn call<T, F, Fut>(&self, call: Call<'_>, cancel: &CancelToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.config.retry_policy();
        let timeout = self.config.request_timeout();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = tokio::time::timeout(timeout, op()) => match r {
                    Ok(r) => r,
                    Err(_) => Err(Error::transport(format!("request timed out after {:?}", timeout))),
                },
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let retryable = error.is_transient() && attempt < policy.max_attempts;
            if !retryable {
                return Err(match call {
                    Call::Dial(peer) => Error::peer_unreachable(peer, attempt),
                    Call::Request(what) if error.is_transient() => Error::transfer_failed(format!(
                        "{} failed after {} attempts: {}",
                        what, attempt, error
                    )),
                    Call::Request(_) => error,
                });
            }

            let delay = policy.delay(attempt - 1);
            warn!(
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying peer request"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// State of one fetch in progress.
struct FetchRun {
    state: FetchState,
    reference: DatasetRef,
    peer: Option<Profile>,
    conn: Option<Arc<dyn PeerConnection>>,
    manifest: Option<Manifest>,
    missing: Vec<ManifestEntry>,
    staged: HashMap<Digest, Vec<u8>>,
}

impl FetchRun {
    fn new(reference: DatasetRef) -> Self {
        Self {
            state: FetchState::Requested,
            reference,
            peer: None,
            conn: None,
            manifest: None,
            missing: Vec::new(),
            staged: HashMap::new(),
        }
    }

    fn transition(&mut self, next: FetchState) {
        debug!(reference = %self.reference, from = ?self.state, to = ?next, "fetch state");
        self.state = next;
        if next.is_terminal() && next != FetchState::Complete {
            self.staged.clear();
        }
    }

    fn peer(&self) -> Result<&Profile> {
        self.peer
            .as_ref()
            .ok_or_else(|| Error::transfer_failed("no peer located"))
    }

    fn conn(&self) -> Result<Arc<dyn PeerConnection>> {
        self.conn
            .clone()
            .ok_or_else(|| Error::transfer_failed("no connection"))
    }

    fn root(&self) -> Result<DatasetPath> {
        self.reference
            .path
            .ok_or_else(|| Error::transfer_failed("reference has no path"))
    }

    fn accept_resolved(&mut self, resolved: DatasetRef) -> Result<()> {
        let path = resolved.path.ok_or_else(|| {
            Error::not_found(format!("dataset {} on peer", self.reference.alias()))
        })?;
        self.reference.path = Some(path);
        if self.reference.name.is_empty() {
            self.reference.name = resolved.name;
        }
        if self.reference.profile_id.is_none() {
            self.reference.profile_id = resolved.profile_id;
        }
        Ok(())
    }

    fn accept_manifest(&mut self, manifest: Manifest, config: &FetchConfig) -> Result<()> {
        let root = self.root()?;
        if manifest.root != root {
            return Err(Error::manifest_invalid(format!(
                "manifest is for {}, requested {}",
                manifest.root, root
            )));
        }
        match manifest.blocks.first() {
            Some(first) if first.digest == root.digest() => {}
            _ => {
                return Err(Error::manifest_invalid("manifest does not start with its root"));
            }
        }

        // Declared sizes come from the peer; an overflowing sum is over any ceiling.
        let bytes = manifest.total_bytes();
        if manifest.len() > config.max_manifest_blocks
            || bytes.is_none_or(|b| b > config.max_manifest_bytes)
        {
            return Err(Error::ManifestTooLarge {
                blocks: manifest.len(),
                bytes: bytes.unwrap_or(u64::MAX),
                max_blocks: config.max_manifest_blocks,
                max_bytes: config.max_manifest_bytes,
            });
        }

        let mut seen = HashSet::with_capacity(manifest.len());
        if let Some(dup) = manifest.blocks.iter().find(|e| !seen.insert(e.digest)) {
            return Err(Error::manifest_invalid(format!(
                "block {} listed twice",
                dup.digest
            )));
        }

        if self.reference.profile_id.is_none() {
            self.reference.profile_id = self.peer.as_ref().map(|p| p.id.clone());
        }
        self.manifest = Some(manifest);
        Ok(())
    }

    fn select_missing(&mut self, store: &dyn BlockStore) -> Result<()> {
        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| Error::transfer_failed("no manifest"))?;
        let mut missing = Vec::new();
        for entry in &manifest.blocks {
            if !store.has(&entry.digest)? {
                missing.push(*entry);
            }
        }
        debug!(
            reference = %self.reference,
            blocks = manifest.len(),
            missing = missing.len(),
            "selected blocks to transfer"
        );
        self.missing = missing;
        Ok(())
    }

    /// Hold a received block; oversized replies are rejected on arrival.
    fn stage(&mut self, entry: &ManifestEntry, bytes: Vec<u8>) -> Result<()> {
        if bytes.len() as u64 > entry.size {
            return Err(Error::block_mismatch(
                format!("{} ({} bytes)", entry.digest, entry.size),
                format!("{} bytes", bytes.len()),
            ));
        }
        self.staged.insert(entry.digest, bytes);
        Ok(())
    }

    fn verify(&self, store: &dyn BlockStore, config: &FetchConfig) -> Result<()> {
        for entry in &self.missing {
            let bytes = self
                .staged
                .get(&entry.digest)
                .ok_or_else(|| Error::transfer_failed(format!("block {} not received", entry.digest)))?;
            let actual = Digest::of(bytes);
            if actual != entry.digest || bytes.len() as u64 != entry.size {
                return Err(Error::block_mismatch(
                    format!("{} ({} bytes)", entry.digest, entry.size),
                    format!("{} ({} bytes)", actual, bytes.len()),
                ));
            }
        }

        let root = self.root()?;
        dsfs::walk_dag_within(&root, config.max_manifest_bytes, |digest| {
            match self.staged.get(digest) {
                Some(bytes) => Ok(bytes.clone()),
                None => store.get(digest),
            }
        })
        .map_err(|e| match e {
            Error::NotFound { what } => {
                Error::manifest_invalid(format!("DAG is not closed: missing {}", what))
            }
            other => other,
        })?;
        Ok(())
    }

    /// Write staged blocks, root last.
    fn commit(&mut self, store: &dyn BlockStore) -> Result<FetchOutcome> {
        let mut transferred_bytes = 0;
        for entry in self.missing.iter().rev() {
            if let Some(bytes) = self.staged.remove(&entry.digest) {
                transferred_bytes += bytes.len() as u64;
                store.put(&bytes)?;
            }
        }
        Ok(FetchOutcome {
            reference: self.reference.clone(),
            manifest_blocks: self.manifest.as_ref().map_or(0, Manifest::len),
            transferred: self.missing.len(),
            transferred_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Commit;
    use crate::p2p::{PeerService, StaticPeerDirectory};
    use crate::repo::{Repo, SaveParams};
    use crate::store::MemBlockStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Wraps a connection to count, corrupt or fail block requests.
    struct TestConnection {
        inner: PeerService,
        block_requests: AtomicUsize,
        tamper: Option<Digest>,
        fail_blocks: usize,
        cancel_on_block: Option<CancelToken>,
        inflate_sizes: bool,
    }

    impl TestConnection {
        fn new(inner: PeerService) -> Self {
            Self {
                inner,
                block_requests: AtomicUsize::new(0),
                tamper: None,
                fail_blocks: 0,
                cancel_on_block: None,
                inflate_sizes: false,
            }
        }
    }

    #[async_trait]
    impl PeerConnection for TestConnection {
        async fn resolve(&self, reference: &DatasetRef) -> Result<DatasetRef> {
            self.inner.resolve(reference).await
        }

        async fn manifest(&self, path: &DatasetPath) -> Result<Manifest> {
            let mut manifest = self.inner.manifest(path).await?;
            if self.inflate_sizes {
                manifest.blocks[0].size = u64::MAX;
                manifest.blocks[1].size = 2;
            }
            Ok(manifest)
        }

        async fn block(&self, digest: &Digest) -> Result<Vec<u8>> {
            let n = self.block_requests.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.cancel_on_block {
                token.cancel();
            }
            if n < self.fail_blocks {
                return Err(Error::transport("connection reset"));
            }
            let mut bytes = self.inner.block(digest).await?;
            if self.tamper == Some(*digest) {
                bytes[0] ^= 0xff;
            }
            Ok(bytes)
        }

        async fn list(&self, params: &ListParams) -> Result<Vec<RefRecord>> {
            self.inner.list(params).await
        }
    }

    struct Fixture {
        bob: Arc<Repo>,
        local: Arc<MemBlockStore>,
        directory: Arc<StaticPeerDirectory>,
    }

    fn fixture() -> Fixture {
        let bob = Repo::in_memory(Profile::new("bob").unwrap());
        let birds = DatasetRef::new("bob", "birds");
        bob.init(SaveParams::new(birds.clone()).body(b"[1]".to_vec()))
            .unwrap();
        bob.save(SaveParams::new(birds).body(b"[1,2]".to_vec()))
            .unwrap();

        Fixture {
            bob: Arc::new(bob),
            local: Arc::new(MemBlockStore::new()),
            directory: Arc::new(StaticPeerDirectory::new()),
        }
    }

    fn fast_config() -> FetchConfig {
        FetchConfig {
            base_delay_ms: 1,
            max_delay_ms: 4,
            request_timeout_ms: 1_000,
            ..FetchConfig::default()
        }
    }

    impl Fixture {
        fn connect(&self, conn: TestConnection) -> Arc<TestConnection> {
            let conn = Arc::new(conn);
            self.directory
                .add_peer(self.bob.profile().clone(), conn.clone());
            conn
        }

        fn fetcher(&self, config: FetchConfig) -> Fetcher {
            Fetcher::new(self.directory.clone(), self.local.clone(), config)
        }

        fn service(&self) -> PeerService {
            PeerService::new(self.bob.clone())
        }
    }

    #[tokio::test]
    async fn test_fetch_resolves_and_copies_history() {
        let fx = fixture();
        fx.connect(TestConnection::new(fx.service()));

        let outcome = fx
            .fetcher(fast_config())
            .fetch(&DatasetRef::new("bob", "birds"), &CancelToken::new())
            .await
            .unwrap();

        let head = fx.bob.resolve_local(&DatasetRef::new("bob", "birds")).unwrap();
        assert_eq!(outcome.reference.path, head.path);
        assert_eq!(outcome.reference.profile_id, Some(fx.bob.profile().id.clone()));
        assert_eq!(outcome.transferred, outcome.manifest_blocks);

        let log = dsfs::history(fx.local.as_ref(), &head.path.unwrap(), None).unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_skips_local_blocks() {
        let fx = fixture();
        let conn = fx.connect(TestConnection::new(fx.service()));

        let head = fx
            .bob
            .resolve_local(&DatasetRef::new("bob", "birds"))
            .unwrap();
        let manifest = fx.bob.manifest(&head.path.unwrap()).unwrap();
        let seeded = manifest.blocks[1];
        fx.local.put(&fx.bob.block(&seeded.digest).unwrap()).unwrap();

        let outcome = fx
            .fetcher(fast_config())
            .fetch(&head, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.transferred, manifest.len() - 1);
        assert_eq!(
            conn.block_requests.load(Ordering::SeqCst),
            manifest.len() - 1
        );
        assert_eq!(fx.local.len(), manifest.len());
    }

    #[tokio::test]
    async fn test_tampered_block_retains_nothing() {
        let fx = fixture();
        let head = fx
            .bob
            .resolve_local(&DatasetRef::new("bob", "birds"))
            .unwrap();
        let manifest = fx.bob.manifest(&head.path.unwrap()).unwrap();

        let mut conn = TestConnection::new(fx.service());
        conn.tamper = Some(manifest.blocks[manifest.len() - 1].digest);
        fx.connect(conn);

        let err = fx
            .fetcher(fast_config())
            .fetch(&head, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BlockMismatch { .. }));
        assert!(fx.local.is_empty());
        assert_eq!(fx.local.write_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer() {
        let fx = fixture();
        let cancel = CancelToken::new();
        let mut conn = TestConnection::new(fx.service());
        conn.cancel_on_block = Some(cancel.clone());
        let conn = fx.connect(conn);

        let err = fx
            .fetcher(fast_config())
            .fetch(&DatasetRef::new("bob", "birds"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(conn.block_requests.load(Ordering::SeqCst), 1);
        assert!(fx.local.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fx = fixture();
        let mut conn = TestConnection::new(fx.service());
        conn.fail_blocks = 2;
        fx.connect(conn);

        let config = FetchConfig {
            max_attempts: 3,
            ..fast_config()
        };
        let outcome = fx
            .fetcher(config)
            .fetch(&DatasetRef::new("bob", "birds"), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(fx.local.len(), outcome.manifest_blocks);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let fx = fixture();
        let mut conn = TestConnection::new(fx.service());
        conn.fail_blocks = usize::MAX;
        let conn = fx.connect(conn);

        let err = fx
            .fetcher(fast_config())
            .fetch(&DatasetRef::new("bob", "birds"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransferFailed { .. }));
        assert_eq!(conn.block_requests.load(Ordering::SeqCst), 3);
        assert!(fx.local.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let fx = fixture();
        fx.connect(TestConnection::new(fx.service()));

        struct Unroutable(Arc<StaticPeerDirectory>);

        #[async_trait]
        impl PeerDirectory for Unroutable {
            fn lookup(&self, peername: &str) -> Option<Profile> {
                self.0.lookup(peername)
            }

            async fn dial(&self, peer: &Profile) -> Result<Arc<dyn PeerConnection>> {
                Err(Error::transport(format!("dial {} refused", peer.peername)))
            }
        }

        let fetcher = Fetcher::new(
            Arc::new(Unroutable(fx.directory.clone())),
            fx.local.clone(),
            fast_config(),
        );
        let err = fetcher
            .fetch(&DatasetRef::new("bob", "birds"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PeerUnreachable { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_peer_and_dataset() {
        let fx = fixture();
        fx.connect(TestConnection::new(fx.service()));
        let fetcher = fx.fetcher(fast_config());

        let err = fetcher
            .fetch(&DatasetRef::new("carol", "x"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = fetcher
            .fetch(&DatasetRef::new("bob", "nope"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_resolve_and_list_remote() {
        let fx = fixture();
        let conn = fx.connect(TestConnection::new(fx.service()));
        let fetcher = fx.fetcher(fast_config());
        let cancel = CancelToken::new();

        let resolved = fetcher
            .resolve_remote(&DatasetRef::new("bob", "birds"), &cancel)
            .await
            .unwrap();
        assert_eq!(resolved.profile_id, Some(fx.bob.profile().id.clone()));
        assert!(resolved.path.is_some());

        let listed = fetcher
            .list_remote("bob", &ListParams::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        assert_eq!(conn.block_requests.load(Ordering::SeqCst), 0);
        assert!(fx.local.is_empty());
    }

    #[tokio::test]
    async fn test_manifest_ceiling() {
        let fx = fixture();
        fx.connect(TestConnection::new(fx.service()));

        let config = FetchConfig {
            max_manifest_blocks: 2,
            ..fast_config()
        };
        let err = fx
            .fetcher(config)
            .fetch(&DatasetRef::new("bob", "birds"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManifestTooLarge { max_blocks: 2, .. }));
        assert!(fx.local.is_empty());
    }

    #[tokio::test]
    async fn test_manifest_byte_ceiling() {
        let fx = fixture();
        let conn = fx.connect(TestConnection::new(fx.service()));

        let config = FetchConfig {
            max_manifest_bytes: 10,
            ..fast_config()
        };
        let err = fx
            .fetcher(config)
            .fetch(&DatasetRef::new("bob", "birds"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManifestTooLarge { max_bytes: 10, .. }));
        assert_eq!(conn.block_requests.load(Ordering::SeqCst), 0);
        assert!(fx.local.is_empty());
    }

    #[tokio::test]
    async fn test_overflowing_manifest_sizes() {
        let fx = fixture();
        let mut conn = TestConnection::new(fx.service());
        conn.inflate_sizes = true;
        let conn = fx.connect(conn);

        let err = fx
            .fetcher(fast_config())
            .fetch(&DatasetRef::new("bob", "birds"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ManifestTooLarge {
                bytes: u64::MAX,
                ..
            }
        ));
        assert_eq!(conn.block_requests.load(Ordering::SeqCst), 0);
        assert!(fx.local.is_empty());
    }

    /// Serves a hand-built DAG whose blocks all hash correctly.
    struct HandBuiltPeer {
        store: MemBlockStore,
        root: DatasetPath,
        order: Vec<Digest>,
    }

    impl HandBuiltPeer {
        /// One version whose body index declares `size` bytes over `chunks`.
        fn with_body(author: &Profile, size: u64, chunks: &[&[u8]]) -> Self {
            let store = MemBlockStore::new();
            let put = |bytes: Vec<u8>| store.put(&bytes).unwrap();

            let chunk_digests: Vec<Digest> = chunks.iter().map(|c| put(c.to_vec())).collect();
            let index = dsfs::BodyIndex {
                size,
                chunks: chunk_digests.clone(),
            };
            let body = put(serde_json::to_vec(&index).unwrap());
            let commit = Commit {
                timestamp: chrono::Utc::now(),
                title: "hand built".to_string(),
                message: String::new(),
                prior: None,
                author: author.id.clone(),
            };
            let commit = put(serde_json::to_vec(&commit).unwrap());
            let root = dsfs::RootNode {
                commit,
                structure: None,
                meta: None,
                viz: None,
                body: Some(body),
            };
            let root = put(serde_json::to_vec(&root).unwrap());

            let mut order = vec![root, commit, body];
            for digest in chunk_digests {
                if !order.contains(&digest) {
                    order.push(digest);
                }
            }
            Self {
                store,
                root: DatasetPath::new(root),
                order,
            }
        }
    }

    #[async_trait]
    impl PeerConnection for HandBuiltPeer {
        async fn resolve(&self, reference: &DatasetRef) -> Result<DatasetRef> {
            Ok(reference.clone().with_path(self.root))
        }

        async fn manifest(&self, path: &DatasetPath) -> Result<Manifest> {
            let mut blocks = Vec::new();
            for digest in &self.order {
                blocks.push(ManifestEntry {
                    digest: *digest,
                    size: self.store.get(digest)?.len() as u64,
                });
            }
            Ok(Manifest { root: *path, blocks })
        }

        async fn block(&self, digest: &Digest) -> Result<Vec<u8>> {
            self.store.get(digest)
        }

        async fn list(&self, _params: &ListParams) -> Result<Vec<RefRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_lying_body_index_is_refused() {
        let fx = fixture();
        let bob = fx.bob.profile().clone();
        fx.directory.add_peer(
            bob.clone(),
            Arc::new(HandBuiltPeer::with_body(&bob, u64::MAX, &[])),
        );

        let err = fx
            .fetcher(fast_config())
            .fetch(&DatasetRef::new("bob", "x"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManifestInvalid { .. }));
        assert!(fx.local.is_empty());
    }

    #[tokio::test]
    async fn test_body_over_byte_ceiling_is_refused() {
        let fx = fixture();
        let bob = fx.bob.profile().clone();

        // One 1 KiB chunk listed 16 times: a small manifest, a 16 KiB body.
        let chunk = [7u8; 1024];
        let chunks: Vec<&[u8]> = vec![&chunk[..]; 16];
        fx.directory.add_peer(
            bob.clone(),
            Arc::new(HandBuiltPeer::with_body(&bob, 16 * 1024, &chunks)),
        );

        let config = FetchConfig {
            max_manifest_bytes: 4_000,
            ..fast_config()
        };
        let err = fx
            .fetcher(config)
            .fetch(&DatasetRef::new("bob", "x"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManifestInvalid { .. }));
        assert!(fx.local.is_empty());

        let outcome = fx
            .fetcher(fast_config())
            .fetch(&DatasetRef::new("bob", "x"), &CancelToken::new())
            .await
            .unwrap();
        let ds = dsfs::load_dataset(fx.local.as_ref(), &outcome.reference.path.unwrap()).unwrap();
        assert_eq!(ds.body.unwrap().len(), 16 * 1024);
    }

    #[tokio::test]
    async fn test_incomplete_manifest_is_rejected() {
        let fx = fixture();

        struct Truncating(PeerService);

        #[async_trait]
        impl PeerConnection for Truncating {
            async fn resolve(&self, reference: &DatasetRef) -> Result<DatasetRef> {
                self.0.resolve(reference).await
            }

            async fn manifest(&self, path: &DatasetPath) -> Result<Manifest> {
                let mut manifest = self.0.manifest(path).await?;
                manifest.blocks.pop();
                Ok(manifest)
            }

            async fn block(&self, digest: &Digest) -> Result<Vec<u8>> {
                self.0.block(digest).await
            }

            async fn list(&self, params: &ListParams) -> Result<Vec<RefRecord>> {
                self.0.list(params).await
            }
        }

        fx.directory
            .add_peer(fx.bob.profile().clone(), Arc::new(Truncating(fx.service())));
        let err = fx
            .fetcher(fast_config())
            .fetch(&DatasetRef::new("bob", "birds"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManifestInvalid { .. }));
        assert!(fx.local.is_empty());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_failure_states() {
        assert_eq!(
            FetchState::failed_with(&Error::Cancelled),
            FetchState::Cancelled
        );
        assert_eq!(
            FetchState::failed_with(&Error::transport("x")),
            FetchState::TransferFailed
        );
        assert!(FetchState::Complete.is_terminal());
        assert!(!FetchState::Verified.is_terminal());
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        token.cancel();
        waiter.await.unwrap();
        assert!(token.check().is_err());
    }
}
