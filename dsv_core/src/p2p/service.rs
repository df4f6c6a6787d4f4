use super::PeerConnection;
use crate::dataset::DatasetRef;
use crate::dsfs::Manifest;
use crate::error::Result;
use crate::hash::{DatasetPath, Digest};
use crate::refs::RefRecord;
use crate::repo::{ListParams, Repo};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Serves peer requests from a local repo.
#[derive(Debug, Clone)]
pub struct PeerService {
    repo: Arc<Repo>,
}

impl PeerService {
    pub fn new(repo: Arc<Repo>) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &Arc<Repo> {
        &self.repo
    }
}

#[async_trait]
impl PeerConnection for PeerService {
    async fn resolve(&self, reference: &DatasetRef) -> Result<DatasetRef> {
        debug!(reference = %reference, "serving resolve");
        self.repo.resolve_local(reference)
    }

    async fn manifest(&self, path: &DatasetPath) -> Result<Manifest> {
        debug!(path = %path, "serving manifest");
        self.repo.manifest(path)
    }

    async fn block(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.repo.block(digest)
    }

    async fn list(&self, params: &ListParams) -> Result<Vec<RefRecord>> {
        let mut params = params.clone();
        // Only this peer's own datasets are offered.
        params.peername = Some(self.repo.profile().peername.clone());
        self.repo.list(&params)
    }
}
