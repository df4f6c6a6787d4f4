//! Publishing dataset summaries to a discovery registry.
//!
//! The registry only ever sees summaries; blocks stay with their peers.
//! Which path was last published is recorded in the reference index so
//! repeated publishes of an unchanged head send nothing.

use crate::dataset::{DatasetRef, ProfileId};
use crate::error::{Error, Result};
use crate::hash::DatasetPath;
use crate::repo::Repo;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

/// Public record of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub peername: String,
    pub name: String,
    pub profile_id: ProfileId,
    pub path: DatasetPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Transport to a registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Create or replace the record for `(peername, name)`.
    async fn put_dataset(&self, summary: &DatasetSummary) -> Result<()>;

    /// Delete a record; `Error::NotFound` when there is none.
    async fn delete_dataset(&self, peername: &str, name: &str) -> Result<()>;
}

/// Registry held in memory.
#[derive(Debug, Default)]
pub struct MemRegistry {
    records: RwLock<BTreeMap<(String, String), DatasetSummary>>,
    puts: AtomicUsize,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peername: &str, name: &str) -> Option<DatasetSummary> {
        self.records
            .read()
            .get(&(peername.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Number of `put_dataset` calls received.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryClient for MemRegistry {
    async fn put_dataset(&self, summary: &DatasetSummary) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.records.write().insert(
            (summary.peername.clone(), summary.name.clone()),
            summary.clone(),
        );
        Ok(())
    }

    async fn delete_dataset(&self, peername: &str, name: &str) -> Result<()> {
        self.records
            .write()
            .remove(&(peername.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("registry record {}/{}", peername, name)))
    }
}

/// Publishes a repo's datasets through a registry client.
pub struct Registry {
    repo: Arc<Repo>,
    client: Arc<dyn RegistryClient>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("repo", &self.repo).finish()
    }
}

impl Registry {
    pub fn new(repo: Arc<Repo>, client: Arc<dyn RegistryClient>) -> Self {
        Self { repo, client }
    }

    /// Publish the current head of a local dataset.
    ///
    /// Returns false when the registry already holds this head.
    pub async fn publish(&self, reference: &DatasetRef) -> Result<bool> {
        let resolved = self.repo.resolve_local(reference)?;
        let record = self
            .repo
            .refs()
            .get(&resolved.peername, &resolved.name)?
            .ok_or_else(|| Error::not_found(format!("dataset {}", resolved.alias())))?;

        if record.published == Some(record.path) {
            debug!(dataset = %resolved.alias(), path = %record.path, "already published");
            return Ok(false);
        }

        let public_key = if self.repo.is_local_peer(&record.peername) {
            self.repo.profile().public_key.clone()
        } else {
            None
        };
        let summary = DatasetSummary {
            peername: record.peername.clone(),
            name: record.name.clone(),
            profile_id: record.profile_id.clone(),
            path: record.path,
            meta: self.repo.meta(&record.path)?,
            public_key,
        };
        self.client
            .put_dataset(&summary)
            .await
            .map_err(into_registry_error)?;

        self.repo
            .set_published(&record.to_ref(), Some(record.path))?;
        info!(dataset = %resolved.alias(), path = %record.path, "published dataset");
        Ok(true)
    }

    /// Remove a dataset's registry record. A missing record is not an error.
    pub async fn unpublish(&self, reference: &DatasetRef) -> Result<()> {
        let resolved = self.repo.resolve_local(reference)?;
        if resolved.name.is_empty() {
            return Err(Error::not_found(format!("dataset {}", reference)));
        }

        match self
            .client
            .delete_dataset(&resolved.peername, &resolved.name)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(dataset = %resolved.alias(), "registry had no record");
            }
            Err(e) => return Err(into_registry_error(e)),
        }

        self.repo.set_published(&resolved, None)?;
        info!(dataset = %resolved.alias(), "unpublished dataset");
        Ok(())
    }
}

fn into_registry_error(error: Error) -> Error {
    match error {
        e @ Error::Registry { .. } => e,
        other => Error::registry(other.to_string()),
    }
}
