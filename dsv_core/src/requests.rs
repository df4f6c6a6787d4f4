//! Dataset operations as offered to command-line and HTTP front ends.
//!
//! [`DatasetRequests`] combines the local [`Repo`] with peer retrieval and
//! registry publishing. Front ends parse their own arguments, call one method
//! and render the result or the classified [`Error`].

use crate::dataset::{Dataset, DatasetRef};
use crate::error::{Error, Result};
use crate::p2p::{CancelToken, FetchConfig, FetchOutcome, Fetcher, PeerDirectory};
use crate::refs::RefRecord;
use crate::registry::{Registry, RegistryClient};
use crate::repo::{ListParams, LogEntry, Repo, SaveParams};
use crate::select::{self, BodyPage, BodyParams, Selector};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

pub struct DatasetRequests {
    repo: Arc<Repo>,
    fetcher: Option<Fetcher>,
    registry: Option<Registry>,
}

impl std::fmt::Debug for DatasetRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetRequests")
            .field("repo", &self.repo)
            .field("peers", &self.fetcher.is_some())
            .field("registry", &self.registry.is_some())
            .finish()
    }
}

impl DatasetRequests {
    /// Local-only requests.
    pub fn new(repo: Arc<Repo>) -> Self {
        Self {
            repo,
            fetcher: None,
            registry: None,
        }
    }

    /// Enable remote resolution and retrieval through `directory`.
    pub fn with_peers(mut self, directory: Arc<dyn PeerDirectory>, config: FetchConfig) -> Self {
        self.fetcher = Some(Fetcher::new(directory, Arc::clone(self.repo.store()), config));
        self
    }

    /// Enable publishing through `client`.
    pub fn with_registry(mut self, client: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(Registry::new(Arc::clone(&self.repo), client));
        self
    }

    pub fn repo(&self) -> &Arc<Repo> {
        &self.repo
    }

    /// The fetcher, if `peername` is a known remote peer.
    fn remote_for(&self, peername: &str) -> Option<&Fetcher> {
        if peername.is_empty() || self.repo.is_local_peer(peername) {
            return None;
        }
        self.fetcher
            .as_ref()
            .filter(|f| f.directory().lookup(peername).is_some())
    }

    /// Resolve locally, falling back to the owning peer.
    pub async fn resolve(&self, reference: &DatasetRef, cancel: &CancelToken) -> Result<DatasetRef> {
        match self.repo.resolve_local(reference) {
            Ok(resolved) => Ok(resolved),
            Err(e) if e.is_not_found() => match self.remote_for(&reference.peername) {
                Some(fetcher) => {
                    debug!(reference = %reference, "resolving on peer");
                    fetcher.resolve_remote(reference, cancel).await
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Load a dataset, fetching its blocks from the owning peer if needed.
    ///
    /// Fetched blocks stay in the store; no index entry is created.
    pub async fn get(
        &self,
        reference: &DatasetRef,
        cancel: &CancelToken,
    ) -> Result<(DatasetRef, Dataset)> {
        let resolved = self.resolve(reference, cancel).await?;
        let path = resolved
            .path
            .ok_or_else(|| Error::not_found(format!("dataset {}", resolved.alias())))?;

        if !self.repo.store().has(&path.digest())?
            && let Some(fetcher) = self.remote_for(&resolved.peername)
        {
            fetcher.fetch(&resolved, cancel).await?;
        }

        let dataset = crate::dsfs::load_dataset(self.repo.store().as_ref(), &path)?;
        Ok((resolved, dataset))
    }

    /// A window of body rows, fetching the version from its peer if needed.
    pub async fn body(
        &self,
        reference: &DatasetRef,
        params: &BodyParams,
        cancel: &CancelToken,
    ) -> Result<BodyPage> {
        let (resolved, dataset) = self.get(reference, cancel).await?;
        let body = dataset
            .body
            .as_deref()
            .ok_or_else(|| Error::not_found(format!("body of {}", resolved.alias())))?;
        let rows = select::decode_rows(body, dataset.structure.as_ref())?;
        Ok(select::page_rows(rows, params))
    }

    /// One component of a version, or a field inside it, e.g. `meta.title`.
    /// An empty selector returns every component.
    pub async fn select(
        &self,
        reference: &DatasetRef,
        selector: &str,
        cancel: &CancelToken,
    ) -> Result<Value> {
        let selector = Selector::parse(selector)?;
        let (resolved, dataset) = self.get(reference, cancel).await?;
        debug!(dataset = %resolved, selector = ?selector.component, "selecting");
        selector.select(&dataset)
    }

    /// Copy another peer's dataset and record it in the local index.
    pub async fn add(&self, reference: &DatasetRef, cancel: &CancelToken) -> Result<RefRecord> {
        if reference.is_empty() {
            return Err(Error::EmptyRef);
        }
        if self.repo.is_local_peer(&reference.peername) {
            return Err(Error::bad_request(format!(
                "{} is a local dataset",
                reference.alias()
            )));
        }
        if reference.name.is_empty() {
            return Err(Error::bad_request("add requires a dataset name"));
        }
        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| Error::bad_request("peer retrieval is not enabled"))?;

        let outcome: FetchOutcome = fetcher.fetch(reference, cancel).await?;
        let record = self.repo.import(&outcome.reference)?;
        info!(
            dataset = %record.to_ref(),
            transferred = outcome.transferred,
            "added dataset"
        );
        Ok(record)
    }

    /// List local entries, or a remote peer's when none are held locally.
    pub async fn list(&self, params: &ListParams, cancel: &CancelToken) -> Result<Vec<RefRecord>> {
        let local = self.repo.list(params)?;
        if !local.is_empty() {
            return Ok(local);
        }
        match params
            .peername
            .as_deref()
            .and_then(|p| self.remote_for(p).map(|f| (p, f)))
        {
            Some((peername, fetcher)) => {
                let records = fetcher.list_remote(peername, params, cancel).await?;
                Ok(params.apply(records))
            }
            None => Ok(local),
        }
    }

    pub fn init(&self, params: SaveParams) -> Result<DatasetRef> {
        self.repo.init(params)
    }

    pub fn save(&self, params: SaveParams) -> Result<DatasetRef> {
        self.repo.save(params)
    }

    pub fn rename(&self, current: &DatasetRef, new: &DatasetRef) -> Result<DatasetRef> {
        self.repo.rename(current, new)
    }

    pub fn remove(&self, reference: &DatasetRef) -> Result<DatasetRef> {
        self.repo.remove(reference)
    }

    pub fn log(&self, reference: &DatasetRef, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        self.repo.log(reference, limit)
    }

    pub async fn publish(&self, reference: &DatasetRef) -> Result<bool> {
        self.registry()?.publish(reference).await
    }

    pub async fn unpublish(&self, reference: &DatasetRef) -> Result<()> {
        self.registry()?.unpublish(reference).await
    }

    fn registry(&self) -> Result<&Registry> {
        self.registry
            .as_ref()
            .ok_or_else(|| Error::bad_request("no registry configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Profile;
    use crate::p2p::{PeerService, StaticPeerDirectory};
    use crate::registry::MemRegistry;

    fn peers() -> (DatasetRequests, Arc<Repo>) {
        let bob = Arc::new(Repo::in_memory(Profile::new("bob").unwrap()));
        bob.init(SaveParams::new(DatasetRef::new("bob", "birds")).body(b"[1,2]".to_vec()))
            .unwrap();

        let directory = Arc::new(StaticPeerDirectory::new());
        directory.add_peer(
            bob.profile().clone(),
            Arc::new(PeerService::new(bob.clone())),
        );

        let alice = Arc::new(Repo::in_memory(Profile::new("alice").unwrap()));
        let requests = DatasetRequests::new(alice)
            .with_peers(directory, FetchConfig::default())
            .with_registry(Arc::new(MemRegistry::new()));
        (requests, bob)
    }

    #[tokio::test]
    async fn test_get_remote_creates_no_entry() {
        let (requests, bob) = peers();
        let cancel = CancelToken::new();

        let (resolved, ds) = requests
            .get(&DatasetRef::new("bob", "birds"), &cancel)
            .await
            .unwrap();
        assert_eq!(ds.body.as_deref(), Some(&b"[1,2]"[..]));
        assert_eq!(resolved.profile_id, Some(bob.profile().id.clone()));
        assert!(requests.repo().refs().is_empty());
    }

    #[tokio::test]
    async fn test_select_component_of_remote() {
        let (requests, _bob) = peers();
        let cancel = CancelToken::new();
        let birds = DatasetRef::new("bob", "birds");

        let title = requests.select(&birds, "commit.title", &cancel).await.unwrap();
        assert_eq!(title, Value::String("created dataset".into()));

        let second = requests.select(&birds, "body.1", &cancel).await.unwrap();
        assert_eq!(second, serde_json::json!(2));

        assert!(requests
            .select(&birds, "meta", &cancel)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(matches!(
            requests.select(&birds, "readme", &cancel).await,
            Err(Error::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_body_of_remote() {
        let (requests, _bob) = peers();
        let cancel = CancelToken::new();

        let page = requests
            .body(&DatasetRef::new("bob", "birds"), &BodyParams::page(1, 5), &cancel)
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.rows, vec![serde_json::json!(2)]);
    }

    #[tokio::test]
    async fn test_add_imports_entry() {
        let (requests, bob) = peers();
        let cancel = CancelToken::new();

        let record = requests
            .add(&DatasetRef::new("bob", "birds"), &cancel)
            .await
            .unwrap();
        assert!(!record.authored);
        assert_eq!(record.profile_id, bob.profile().id);

        // Now resolvable without the peer.
        let local = requests
            .repo()
            .resolve_local(&DatasetRef::new("bob", "birds"))
            .unwrap();
        assert_eq!(local.path, Some(record.path));
    }

    #[tokio::test]
    async fn test_add_rejects_local_and_unnamed() {
        let (requests, _) = peers();
        let cancel = CancelToken::new();

        assert!(matches!(
            requests.add(&DatasetRef::new("me", "cats"), &cancel).await,
            Err(Error::BadRequest { .. })
        ));
        assert!(matches!(
            requests.add(&DatasetRef::peer("bob"), &cancel).await,
            Err(Error::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_falls_back_to_peer() {
        let (requests, _) = peers();
        let cancel = CancelToken::new();

        let remote = requests
            .list(&ListParams::peer("bob"), &cancel)
            .await
            .unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].name, "birds");

        let unknown = requests
            .list(&ListParams::peer("carol"), &cancel)
            .await
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_everywhere() {
        let (requests, _) = peers();
        let cancel = CancelToken::new();

        assert!(requests
            .resolve(&DatasetRef::new("bob", "nope"), &cancel)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(requests
            .resolve(&DatasetRef::new("carol", "x"), &cancel)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(matches!(
            requests.resolve(&DatasetRef::default(), &cancel).await,
            Err(Error::EmptyRef)
        ));
    }

    #[tokio::test]
    async fn test_publish_without_registry() {
        let alice = Arc::new(Repo::in_memory(Profile::new("alice").unwrap()));
        let requests = DatasetRequests::new(alice);
        assert!(matches!(
            requests.publish(&DatasetRef::new("me", "cats")).await,
            Err(Error::BadRequest { .. })
        ));
    }
}
