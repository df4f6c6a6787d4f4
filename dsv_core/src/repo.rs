//! Repo: named datasets over the block store.
//!
//! A repo ties a [`BlockStore`], the [`RefIndex`] and the local [`Profile`]
//! together. Every mutating operation takes the slot lock for the dataset it
//! touches, writes all new blocks, and only then swaps the head pointer.

use crate::chunking::ChunkerConfig;
use crate::config::DsvConfig;
use crate::dataset::{Commit, Dataset, DatasetRef, ME, Profile, Structure, validate_name};
use crate::dsfs::{self, Manifest};
use crate::error::{Error, Result};
use crate::hash::{DatasetPath, Digest};
use crate::refs::{RefIndex, RefRecord};
use crate::select::{self, BodyPage, BodyParams};
use crate::store::{BlockStore, FsBlockStore, MemBlockStore};
use crate::validate::{FormatValidator, Validator};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Index file name under the repo root.
pub const REFS_FILE: &str = "refs.json";
/// Block store directory under the repo root.
pub const BLOCKS_DIR: &str = "blocks";

/// Input to Init and Save.
///
/// Components left as `None` carry over from the current head.
#[derive(Debug, Clone, Default)]
pub struct SaveParams {
    pub reference: DatasetRef,
    pub title: String,
    pub message: String,
    pub structure: Option<Structure>,
    pub meta: Option<Value>,
    pub viz: Option<Value>,
    pub body: Option<Vec<u8>>,
    /// Create the dataset if it does not exist yet.
    pub create: bool,
}

impl SaveParams {
    pub fn new(reference: DatasetRef) -> Self {
        Self {
            reference,
            ..Self::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn structure(mut self, structure: Structure) -> Self {
        self.structure = Some(structure);
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn viz(mut self, viz: Value) -> Self {
        self.viz = Some(viz);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }
}

/// Sort key for List.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderBy {
    #[default]
    Name,
    Created,
    Updated,
}

/// Input to List.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListParams {
    /// Restrict to one peer; all entries when unset.
    #[serde(default)]
    pub peername: Option<String>,
    #[serde(default)]
    pub order_by: OrderBy,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListParams {
    pub fn peer(peername: impl Into<String>) -> Self {
        Self {
            peername: Some(peername.into()),
            ..Self::default()
        }
    }

    /// Sort and paginate `records` in place.
    pub fn apply(&self, mut records: Vec<RefRecord>) -> Vec<RefRecord> {
        records.sort_by(|a, b| {
            let ord = match self.order_by {
                OrderBy::Name => (&a.name, &a.peername).cmp(&(&b.name, &b.peername)),
                OrderBy::Created => a.created.cmp(&b.created),
                OrderBy::Updated => a.updated.cmp(&b.updated),
            };
            if self.descending { ord.reverse() } else { ord }
        });
        records
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// One version in a dataset's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub path: DatasetPath,
    pub commit: Commit,
}

/// A set of named datasets owned by one local peer.
pub struct Repo {
    root: Option<PathBuf>,
    store: Arc<dyn BlockStore>,
    refs: RefIndex,
    profile: Profile,
    validator: Arc<dyn Validator>,
    chunker: ChunkerConfig,
}

impl fmt::Debug for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repo")
            .field("root", &self.root)
            .field("peername", &self.profile.peername)
            .field("datasets", &self.refs.len())
            .finish()
    }
}

impl Repo {
    /// Open the repo at `root`, creating its store and index on first use.
    pub fn open<P: AsRef<Path>>(root: P, config: &DsvConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        config.store.chunker.validate().map_err(Error::config)?;

        let store = FsBlockStore::open_or_init(root.join(BLOCKS_DIR))?
            .with_compression_threshold(config.store.compression_threshold);
        let refs = RefIndex::open(root.join(REFS_FILE))?;

        let mut profile = Profile::new(&config.profile.peername)?;
        profile.addresses = config.profile.addresses.clone();

        info!(
            root = %root.display(),
            peername = %profile.peername,
            datasets = refs.len(),
            "opened repo"
        );

        Ok(Self {
            root: Some(root),
            store: Arc::new(store),
            refs,
            profile,
            validator: Arc::new(FormatValidator),
            chunker: config.store.chunker.clone(),
        })
    }

    /// Repo held entirely in memory.
    pub fn in_memory(profile: Profile) -> Self {
        Self::with_store(profile, Arc::new(MemBlockStore::new()))
    }

    /// Repo over an existing block store with an in-memory index.
    pub fn with_store(profile: Profile, store: Arc<dyn BlockStore>) -> Self {
        Self {
            root: None,
            store,
            refs: RefIndex::in_memory(),
            profile,
            validator: Arc::new(FormatValidator),
            chunker: ChunkerConfig::default(),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// Replace the body chunker; sizes FastCDC rejects are a config error.
    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Result<Self> {
        chunker.validate().map_err(Error::config)?;
        self.chunker = chunker;
        Ok(self)
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn refs(&self) -> &RefIndex {
        &self.refs
    }

    /// Flush and close the reference index.
    pub fn close(&self) -> Result<()> {
        self.refs.close()
    }

    /// Whether `peername` names the local peer (directly or via `me`).
    pub fn is_local_peer(&self, peername: &str) -> bool {
        peername == ME || peername == self.profile.peername
    }

    /// Rewrite `me` and a missing peername to the local peername.
    pub fn canonicalize(&self, reference: &DatasetRef) -> DatasetRef {
        let mut out = reference.clone();
        if out.peername == ME || (out.peername.is_empty() && !out.name.is_empty()) {
            out.peername = self.profile.peername.clone();
        }
        if out.peername == self.profile.peername && out.profile_id.is_none() && !out.name.is_empty()
        {
            out.profile_id = Some(self.profile.id.clone());
        }
        out
    }

    /// Resolve a reference using only local state.
    ///
    /// A path is authoritative; the name is filled in from the index when
    /// possible. A named reference resolves to its index entry's head.
    pub fn resolve_local(&self, reference: &DatasetRef) -> Result<DatasetRef> {
        if reference.is_empty() {
            return Err(Error::EmptyRef);
        }
        let reference = self.canonicalize(reference);

        if let Some(path) = reference.path {
            let mut out = reference;
            if out.name.is_empty()
                && let Some(record) = self.refs.find_by_path(&path)?
            {
                out.peername = record.peername;
                out.name = record.name;
                out.profile_id = Some(record.profile_id);
            }
            return Ok(out);
        }

        if reference.name.is_empty() {
            return Err(Error::bad_request(format!(
                "'{}' names a peer, not a dataset",
                reference.peername
            )));
        }

        match self.refs.get(&reference.peername, &reference.name)? {
            Some(record) => Ok(record.to_ref()),
            None => Err(Error::not_found(format!("dataset {}", reference.alias()))),
        }
    }

    /// Resolve and load a dataset version.
    pub fn get(&self, reference: &DatasetRef) -> Result<(DatasetRef, Dataset)> {
        let resolved = self.resolve_local(reference)?;
        let path = resolved
            .path
            .ok_or_else(|| Error::not_found(format!("dataset {}", resolved.alias())))?;
        let dataset = dsfs::load_dataset(self.store.as_ref(), &path)?;
        Ok((resolved, dataset))
    }

    /// Create a new dataset; `Exists` if the name is taken.
    pub fn init(&self, params: SaveParams) -> Result<DatasetRef> {
        self.write_version(params, SaveMode::Init)
    }

    /// Record a new version of a dataset.
    pub fn save(&self, params: SaveParams) -> Result<DatasetRef> {
        self.write_version(params, SaveMode::Save)
    }

    fn write_version(&self, params: SaveParams, mode: SaveMode) -> Result<DatasetRef> {
        let reference = self.canonicalize(&params.reference);
        if reference.is_empty() {
            return Err(Error::EmptyRef);
        }
        if reference.peername != self.profile.peername {
            return Err(Error::bad_request(format!(
                "cannot save to another peer's dataset: {}",
                reference.alias()
            )));
        }
        validate_name(&reference.name, "dataset name")?;

        let slot = self.refs.slot(&reference.peername, &reference.name);
        let _guard = slot.lock();

        let current = self.refs.get(&reference.peername, &reference.name)?;
        match (&current, mode) {
            (Some(_), SaveMode::Init) => return Err(Error::exists(reference.alias())),
            (None, SaveMode::Save) if !params.create => {
                return Err(Error::not_found(format!("dataset {}", reference.alias())));
            }
            _ => {}
        }

        let previous = current
            .as_ref()
            .map(|record| dsfs::load_dataset(self.store.as_ref(), &record.path))
            .transpose()?;

        let changes = Changes::between(previous.as_ref(), &params);
        if previous.is_some() && changes.is_empty() {
            return Err(Error::NoChanges);
        }

        let structure = params
            .structure
            .or_else(|| previous.as_ref().and_then(|p| p.structure.clone()));
        let meta = params
            .meta
            .or_else(|| previous.as_ref().and_then(|p| p.meta.clone()));
        let viz = params
            .viz
            .or_else(|| previous.as_ref().and_then(|p| p.viz.clone()));
        let body = params
            .body
            .or_else(|| previous.as_ref().and_then(|p| p.body.clone()));

        if (changes.body || changes.structure)
            && let Some(body) = &body
        {
            self.validator.validate(body, structure.as_ref())?;
        }

        let title = if params.title.is_empty() {
            changes.describe(previous.is_none())
        } else {
            params.title
        };
        let commit = Commit {
            timestamp: Utc::now(),
            title,
            message: params.message,
            prior: current.as_ref().map(|record| record.path),
            author: self.profile.id.clone(),
        };

        let dataset = Dataset {
            commit,
            structure,
            meta,
            viz,
            body,
        };
        let path = dsfs::write_dataset(self.store.as_ref(), &dataset, &self.chunker)?;

        let now = Utc::now();
        let record = RefRecord {
            peername: reference.peername.clone(),
            name: reference.name.clone(),
            profile_id: self.profile.id.clone(),
            path,
            created: current.as_ref().map_or(now, |r| r.created),
            updated: now,
            authored: true,
            published: current.as_ref().and_then(|r| r.published),
        };
        self.refs.put(record.clone())?;

        info!(
            dataset = %reference.alias(),
            path = %path,
            prior = ?dataset.commit.prior,
            "saved dataset version"
        );
        Ok(record.to_ref())
    }

    /// Move a dataset to a new name under the same peer.
    pub fn rename(&self, current: &DatasetRef, new: &DatasetRef) -> Result<DatasetRef> {
        let from = self.canonicalize(current);
        let to = self.canonicalize(new);
        if from.name.is_empty() || to.name.is_empty() {
            return Err(Error::bad_request("rename requires a dataset name on both sides"));
        }
        if from.peername != to.peername {
            return Err(Error::bad_request(format!(
                "cannot rename across peers: {} -> {}",
                from.alias(),
                to.alias()
            )));
        }
        validate_name(&to.name, "dataset name")?;
        if from.slot() == to.slot() {
            return Err(Error::exists(to.alias()));
        }

        let (first, second) = if from.slot() < to.slot() {
            (&from, &to)
        } else {
            (&to, &from)
        };
        let first_slot = self.refs.slot(&first.peername, &first.name);
        let second_slot = self.refs.slot(&second.peername, &second.name);
        let _first = first_slot.lock();
        let _second = second_slot.lock();

        let record = self.refs.rename(&from.slot(), &to.slot())?;
        info!(from = %from.alias(), to = %to.alias(), path = %record.path, "renamed dataset");
        Ok(record.to_ref())
    }

    /// Delete a dataset's index entry. Its blocks stay in the store.
    pub fn remove(&self, reference: &DatasetRef) -> Result<DatasetRef> {
        let reference = self.canonicalize(reference);
        if reference.is_empty() {
            return Err(Error::EmptyRef);
        }
        if reference.name.is_empty() {
            return Err(Error::bad_request("remove requires a dataset name"));
        }

        let slot = self.refs.slot(&reference.peername, &reference.name);
        let _guard = slot.lock();

        let record = self.refs.remove(&reference.peername, &reference.name)?;
        info!(dataset = %reference.alias(), path = %record.path, "removed dataset");
        Ok(record.to_ref())
    }

    /// Index entries, filtered, sorted and paginated.
    pub fn list(&self, params: &ListParams) -> Result<Vec<RefRecord>> {
        let peername = params.peername.as_deref().map(|p| {
            if p == ME {
                self.profile.peername.as_str()
            } else {
                p
            }
        });
        let records = self.refs.list(peername)?;
        Ok(params.apply(records))
    }

    /// History of a dataset, newest first.
    pub fn log(&self, reference: &DatasetRef, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let resolved = self.resolve_local(reference)?;
        let head = resolved
            .path
            .ok_or_else(|| Error::not_found(format!("dataset {}", resolved.alias())))?;
        let entries = dsfs::history(self.store.as_ref(), &head, limit)?
            .into_iter()
            .map(|(path, commit)| LogEntry { path, commit })
            .collect();
        Ok(entries)
    }

    /// Record a dataset fetched from another peer.
    ///
    /// The version's blocks must already be in the store. The entry keeps the
    /// remote peername and profile ID and is marked as not authored here.
    pub fn import(&self, reference: &DatasetRef) -> Result<RefRecord> {
        if self.is_local_peer(&reference.peername) {
            return Err(Error::bad_request(format!(
                "cannot add a dataset from the local peer: {}",
                reference.alias()
            )));
        }
        validate_name(&reference.peername, "peername")?;
        validate_name(&reference.name, "dataset name")?;
        let (Some(path), Some(profile_id)) = (reference.path, reference.profile_id.clone()) else {
            return Err(Error::bad_request(format!(
                "import requires a resolved reference: {}",
                reference
            )));
        };
        if !self.store.has(&path.digest())? {
            return Err(Error::not_found(format!("dataset {}", path)));
        }

        let slot = self.refs.slot(&reference.peername, &reference.name);
        let _guard = slot.lock();

        let existing = self.refs.get(&reference.peername, &reference.name)?;
        let now = Utc::now();
        let record = RefRecord {
            peername: reference.peername.clone(),
            name: reference.name.clone(),
            profile_id,
            path,
            created: existing.as_ref().map_or(now, |r| r.created),
            updated: now,
            authored: false,
            published: existing.as_ref().and_then(|r| r.published),
        };
        self.refs.put(record.clone())?;

        info!(dataset = %reference.alias(), path = %path, "imported dataset");
        Ok(record)
    }

    /// Record the path last sent to the registry, or clear it.
    pub fn set_published(
        &self,
        reference: &DatasetRef,
        published: Option<DatasetPath>,
    ) -> Result<RefRecord> {
        let reference = self.canonicalize(reference);
        let slot = self.refs.slot(&reference.peername, &reference.name);
        let _guard = slot.lock();
        self.refs
            .update(&reference.peername, &reference.name, |record| {
                record.published = published;
            })
    }

    /// Transfer manifest of a locally stored version.
    pub fn manifest(&self, path: &DatasetPath) -> Result<Manifest> {
        let manifest = dsfs::manifest(self.store.as_ref(), path)?;
        debug!(
            root = %path,
            blocks = manifest.len(),
            bytes = ?manifest.total_bytes(),
            "built manifest"
        );
        Ok(manifest)
    }

    /// Raw bytes of one block.
    pub fn block(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.store.get(digest)
    }

    /// Meta document of a version, if it has one.
    pub fn meta(&self, path: &DatasetPath) -> Result<Option<Value>> {
        let root = dsfs::load_root(self.store.as_ref(), path)?;
        match root.meta {
            Some(digest) => Ok(Some(serde_json::from_slice(&self.store.get(&digest)?)?)),
            None => Ok(None),
        }
    }

    /// A window of decoded body rows from a dataset version.
    pub fn body(&self, reference: &DatasetRef, params: &BodyParams) -> Result<BodyPage> {
        let (resolved, dataset) = self.get(reference)?;
        let body = dataset
            .body
            .as_deref()
            .ok_or_else(|| Error::not_found(format!("body of {}", resolved.alias())))?;
        let rows = select::decode_rows(body, dataset.structure.as_ref())?;
        Ok(select::page_rows(rows, params))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveMode {
    Init,
    Save,
}

/// Which components of a save differ from the current head.
#[derive(Debug, Default)]
struct Changes {
    structure: bool,
    meta: bool,
    viz: bool,
    body: bool,
}

impl Changes {
    fn between(previous: Option<&Dataset>, params: &SaveParams) -> Self {
        fn differs<T: PartialEq>(new: Option<&T>, old: Option<&T>) -> bool {
            new.is_some_and(|n| Some(n) != old)
        }
        Changes {
            structure: differs(
                params.structure.as_ref(),
                previous.and_then(|p| p.structure.as_ref()),
            ),
            meta: differs(params.meta.as_ref(), previous.and_then(|p| p.meta.as_ref())),
            viz: differs(params.viz.as_ref(), previous.and_then(|p| p.viz.as_ref())),
            body: differs(params.body.as_ref(), previous.and_then(|p| p.body.as_ref())),
        }
    }

    fn is_empty(&self) -> bool {
        !(self.structure || self.meta || self.viz || self.body)
    }

    fn describe(&self, created: bool) -> String {
        if created {
            return "created dataset".to_string();
        }
        let mut parts = Vec::new();
        if self.structure {
            parts.push("structure");
        }
        if self.meta {
            parts.push("meta");
        }
        if self.viz {
            parts.push("viz");
        }
        if self.body {
            parts.push("body");
        }
        format!("updated {}", parts.join(", "))
    }
}
