//! Dataset version encoding over the block store.
//!
//! A version is a small Merkle DAG:
//!
//! ```text
//! root ──┬── commit ── prior ──> previous root
//!        ├── structure
//!        ├── meta
//!        ├── viz
//!        └── body index ──┬── chunk
//!                         └── chunk ...
//! ```
//!
//! Node blocks are JSON; chunks are raw bytes. Every link is a digest looked
//! up in the store, never an in-memory pointer.

use crate::chunking::{ChunkerConfig, chunk_body};
use crate::dataset::{Commit, Dataset, Structure};
use crate::error::{Error, Result};
use crate::hash::{DatasetPath, Digest};
use crate::store::BlockStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Root block of a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootNode {
    pub commit: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viz: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Digest>,
}

/// Index of a chunked body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyIndex {
    pub size: u64,
    pub chunks: Vec<Digest>,
}

/// One block to transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub digest: Digest,
    pub size: u64,
}

/// Ordered list of every block reachable from a version, history included.
///
/// The root block is always first; no digest appears twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub root: DatasetPath,
    pub blocks: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Sum of the declared block sizes; `None` if it does not fit in a `u64`.
    pub fn total_bytes(&self) -> Option<u64> {
        self.blocks
            .iter()
            .try_fold(0u64, |total, b| total.checked_add(b.size))
    }
}

fn put_json<T: Serialize>(store: &dyn BlockStore, value: &T) -> Result<Digest> {
    let bytes = serde_json::to_vec(value)?;
    store.put(&bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8], digest: &Digest, what: &str) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::manifest_invalid(format!("block {} is not a {}: {}", digest, what, e)))
}

fn get_json<T: DeserializeOwned>(store: &dyn BlockStore, digest: &Digest, what: &str) -> Result<T> {
    let bytes = store.get(digest)?;
    decode(&bytes, digest, what)
}

/// Write a body as chunk blocks plus an index block.
pub fn write_body(store: &dyn BlockStore, body: &[u8], chunker: &ChunkerConfig) -> Result<Digest> {
    let mut chunks = Vec::new();
    for chunk in chunk_body(body, chunker)? {
        chunks.push(store.put(chunk.slice(body))?);
    }
    put_json(
        store,
        &BodyIndex {
            size: body.len() as u64,
            chunks,
        },
    )
}

/// Reassemble a body from its index block.
///
/// The declared size is only compared against, never allocated up front.
pub fn read_body(store: &dyn BlockStore, index: &Digest) -> Result<Vec<u8>> {
    let index: BodyIndex = get_json(store, index, "body index")?;
    let mismatch = |held: u64| {
        Error::manifest_invalid(format!(
            "body size mismatch: index says {}, chunks hold {}",
            index.size, held
        ))
    };

    let mut body = Vec::new();
    for chunk in &index.chunks {
        body.extend_from_slice(&store.get(chunk)?);
        if body.len() as u64 > index.size {
            return Err(mismatch(body.len() as u64));
        }
    }
    if body.len() as u64 != index.size {
        return Err(mismatch(body.len() as u64));
    }
    Ok(body)
}

/// Write every component of a version, leaves first, and return its path.
///
/// The root is written last, so a present root implies a complete DAG.
pub fn write_dataset(
    store: &dyn BlockStore,
    dataset: &Dataset,
    chunker: &ChunkerConfig,
) -> Result<DatasetPath> {
    let structure = dataset
        .structure
        .as_ref()
        .map(|s| put_json(store, s))
        .transpose()?;
    let meta = dataset.meta.as_ref().map(|m| put_json(store, m)).transpose()?;
    let viz = dataset.viz.as_ref().map(|v| put_json(store, v)).transpose()?;
    let body = dataset
        .body
        .as_ref()
        .map(|b| write_body(store, b, chunker))
        .transpose()?;
    let commit = put_json(store, &dataset.commit)?;

    let root = RootNode {
        commit,
        structure,
        meta,
        viz,
        body,
    };
    Ok(DatasetPath::new(put_json(store, &root)?))
}

/// Read only the root node of a version.
pub fn load_root(store: &dyn BlockStore, path: &DatasetPath) -> Result<RootNode> {
    match store.get(&path.digest()) {
        Ok(bytes) => decode(&bytes, &path.digest(), "dataset root"),
        Err(e) if e.is_not_found() => Err(Error::not_found(format!("dataset {}", path))),
        Err(e) => Err(e),
    }
}

/// Read only the commit of a version.
pub fn load_commit(store: &dyn BlockStore, path: &DatasetPath) -> Result<Commit> {
    let root = load_root(store, path)?;
    get_json(store, &root.commit, "commit")
}

/// Load a complete version.
pub fn load_dataset(store: &dyn BlockStore, path: &DatasetPath) -> Result<Dataset> {
    let root = load_root(store, path)?;

    let commit: Commit = get_json(store, &root.commit, "commit")?;
    let structure: Option<Structure> = root
        .structure
        .map(|d| get_json(store, &d, "structure"))
        .transpose()?;
    let meta: Option<Value> = root.meta.map(|d| get_json(store, &d, "meta")).transpose()?;
    let viz: Option<Value> = root.viz.map(|d| get_json(store, &d, "viz")).transpose()?;
    let body = root.body.map(|d| read_body(store, &d)).transpose()?;

    Ok(Dataset {
        commit,
        structure,
        meta,
        viz,
        body,
    })
}

/// Walk `Commit.prior` from `head`, newest first.
pub fn history(
    store: &dyn BlockStore,
    head: &DatasetPath,
    limit: Option<usize>,
) -> Result<Vec<(DatasetPath, Commit)>> {
    let mut log = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some(*head);

    while let Some(path) = next {
        if limit.is_some_and(|l| log.len() >= l) {
            break;
        }
        if !seen.insert(path) {
            return Err(Error::manifest_invalid(format!("history cycle at {}", path)));
        }
        let commit = load_commit(store, &path)?;
        next = commit.prior;
        log.push((path, commit));
    }

    Ok(log)
}

/// Walk every block reachable from `root`, reading through `fetch`.
///
/// The order is the manifest order: each version's root, commit, structure,
/// meta, viz, body index and chunks, then its prior version.
pub fn walk_dag<F>(root: &DatasetPath, fetch: F) -> Result<Vec<ManifestEntry>>
where
    F: FnMut(&Digest) -> Result<Vec<u8>>,
{
    walk_dag_within(root, u64::MAX, fetch)
}

/// [`walk_dag`], also rejecting any body larger than `max_body_bytes`.
///
/// Every body index must declare exactly the summed size of its chunks.
pub fn walk_dag_within<F>(
    root: &DatasetPath,
    max_body_bytes: u64,
    fetch: F,
) -> Result<Vec<ManifestEntry>>
where
    F: FnMut(&Digest) -> Result<Vec<u8>>,
{
    let mut walker = Walker {
        fetch,
        entries: Vec::new(),
        sizes: HashMap::new(),
    };

    let mut next = Some(*root);
    while let Some(path) = next.take() {
        let Some(root_bytes) = walker.visit(&path.digest())? else {
            break;
        };
        let node: RootNode = decode(&root_bytes, &path.digest(), "dataset root")?;

        if let Some(bytes) = walker.visit(&node.commit)? {
            let commit: Commit = decode(&bytes, &node.commit, "commit")?;
            next = commit.prior;
        }

        for doc in [node.structure, node.meta, node.viz].into_iter().flatten() {
            walker.visit(&doc)?;
        }

        if let Some(index_digest) = node.body
            && let Some(bytes) = walker.visit(&index_digest)?
        {
            let index: BodyIndex = decode(&bytes, &index_digest, "body index")?;
            let mut held = Some(0u64);
            for chunk in &index.chunks {
                walker.visit(chunk)?;
                held = held.and_then(|total| total.checked_add(walker.size(chunk)));
            }
            if held != Some(index.size) {
                return Err(Error::manifest_invalid(format!(
                    "body index {} declares {} bytes, chunks hold {}",
                    index_digest,
                    index.size,
                    held.map_or_else(|| "more than u64::MAX".to_string(), |h| h.to_string())
                )));
            }
            if index.size > max_body_bytes {
                return Err(Error::manifest_invalid(format!(
                    "body index {} declares {} bytes, limit is {}",
                    index_digest, index.size, max_body_bytes
                )));
            }
        }
    }

    Ok(walker.entries)
}

struct Walker<F> {
    fetch: F,
    entries: Vec<ManifestEntry>,
    sizes: HashMap<Digest, u64>,
}

impl<F> Walker<F>
where
    F: FnMut(&Digest) -> Result<Vec<u8>>,
{
    /// Record a block once; `None` when it was already visited.
    fn visit(&mut self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        if self.sizes.contains_key(digest) {
            return Ok(None);
        }
        let bytes = (self.fetch)(digest)?;
        let size = bytes.len() as u64;
        self.sizes.insert(*digest, size);
        self.entries.push(ManifestEntry {
            digest: *digest,
            size,
        });
        Ok(Some(bytes))
    }

    /// Size of a visited block.
    fn size(&self, digest: &Digest) -> u64 {
        self.sizes.get(digest).copied().unwrap_or_default()
    }
}

/// Transfer manifest for a locally stored version.
pub fn manifest(store: &dyn BlockStore, root: &DatasetPath) -> Result<Manifest> {
    if !store.has(&root.digest())? {
        return Err(Error::not_found(format!("dataset {}", root)));
    }
    let blocks = walk_dag(root, |d| store.get(d))?;
    Ok(Manifest {
        root: *root,
        blocks,
    })
}
