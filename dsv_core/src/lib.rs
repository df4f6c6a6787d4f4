//! # dsv core
//!
//! Content-addressed version control for structured datasets.
//!
//! Datasets live under human-readable names (`peername/name`). Every save
//! writes an immutable snapshot into a BLAKE3 block store and links it to
//! its predecessor, so history is a Merkle chain of commits. Datasets can be
//! fetched from other peers by reference, verified block by block, and
//! published to a registry for discovery.
//!
//! ## Features
//!
//! - Content-addressed block storage with zstd compression
//! - Content-defined chunking so large bodies dedupe across versions
//! - Reference index with per-dataset locking and atomic persistence
//! - Verified peer retrieval with retries, ceilings and cancellation
//! - Paged body reads and component selection
//! - Registry publishing
//!
//! ## Example
//!
//! ```no_run
//! use dsv_core::{DatasetRef, DsvConfig, Repo, SaveParams};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let root = Path::new("./my-repo");
//! let config = DsvConfig::load(root)?;
//! let repo = Repo::open(root, &config)?;
//!
//! // Create a dataset, then record a second version
//! let cats = DatasetRef::new("me", "cats");
//! repo.init(SaveParams::new(cats.clone()).body(b"[1,2]".to_vec()))?;
//! repo.save(SaveParams::new(cats.clone()).body(b"[1,2,3]".to_vec()))?;
//!
//! for entry in repo.log(&cats, None)? {
//!     println!("{} {}", entry.path, entry.commit.title);
//! }
//! repo.close()?;
//! # Ok(())
//! # }
//! ```

mod chunking;
mod config;
mod dataset;
mod dsfs;
mod error;
mod hash;
pub mod logging;
mod object;
pub mod p2p;
mod refs;
mod registry;
mod repo;
mod requests;
mod select;
mod store;
mod validate;

pub use chunking::{Chunk, ChunkerConfig, chunk_body};
pub use self::config::{CONFIG_FILE, DsvConfig, ProfileConfig, RegistryConfig, StoreConfig};
pub use dataset::{
    Commit, DataFormat, Dataset, DatasetRef, ME, Profile, ProfileId, Structure, validate_name,
};
pub use dsfs::{
    BodyIndex, Manifest, ManifestEntry, RootNode, history, load_commit, load_dataset, load_root,
    manifest, read_body, walk_dag, write_body, write_dataset,
};
pub use error::{Error, Result};
pub use hash::{Algorithm, DatasetPath, Digest};
pub use logging::{LoggingConfig, init_logging};
pub use object::{BlockHeader, CompressionType};
pub use p2p::{
    CancelToken, FetchConfig, FetchOutcome, FetchState, Fetcher, PeerConnection, PeerDirectory,
    PeerService, RetryPolicy, StaticPeerDirectory,
};
pub use refs::{RefIndex, RefRecord, SlotKey};
pub use registry::{DatasetSummary, MemRegistry, Registry, RegistryClient};
pub use repo::{BLOCKS_DIR, ListParams, LogEntry, OrderBy, REFS_FILE, Repo, SaveParams};
pub use requests::DatasetRequests;
pub use select::{
    BodyPage, BodyParams, Component, DEFAULT_BODY_LIMIT, Selector, decode_rows, page_rows,
};
pub use store::{BlockStore, DEFAULT_COMPRESSION_THRESHOLD, FsBlockStore, MemBlockStore};
pub use validate::{FormatValidator, NoopValidator, Validator};
