//! Content-addressed block storage.
//!
//! [`BlockStore`] is the seam every higher layer talks to. Blocks are
//! immutable and keyed by the BLAKE3 digest of their bytes, so `put` is
//! idempotent and concurrent writers of identical content need no
//! coordination.

use crate::error::{Error, Result};
use crate::hash::{Algorithm, Digest};
use crate::object::{BlockHeader, CompressionType, HEADER_SIZE};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Blocks of at least this many bytes are compressed on disk.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 4096;

/// Immutable block storage keyed by content digest.
pub trait BlockStore: Send + Sync + fmt::Debug {
    /// Store bytes and return their digest. Storing existing content is a no-op.
    fn put(&self, data: &[u8]) -> Result<Digest>;

    /// Fetch the bytes for a digest, or `Error::NotFound`.
    fn get(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Whether a block is present locally.
    fn has(&self, digest: &Digest) -> Result<bool>;
}

/// A block store on the local filesystem.
///
/// Layout under the root:
/// - `objects/blake3/{prefix}/{suffix}` block files
/// - `config` with version and algorithm
#[derive(Debug)]
pub struct FsBlockStore {
    root: PathBuf,
    algorithm: Algorithm,
    compression_threshold: usize,
}

impl FsBlockStore {
    /// Initialize a new store at the given path.
    pub fn init<P: AsRef<Path>>(root: P, algorithm: Algorithm) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("objects").join(algorithm.as_str()))?;

        let config_content = format!("version=1\nalgo={}\n", algorithm.as_str());
        fs::write(root.join("config"), config_content)?;

        Ok(Self {
            root,
            algorithm,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        })
    }

    /// Open an existing store, validating its layout.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            return Err(Error::invalid_store(&root, "directory does not exist"));
        }

        let config_path = root.join("config");
        if !config_path.exists() {
            return Err(Error::invalid_store(&root, "config file not found"));
        }

        let config_content = fs::read_to_string(&config_path)?;
        let algorithm = Self::parse_config(&config_content)
            .map_err(|e| Error::invalid_store(&root, e.to_string()))?;

        if !root.join("objects").join(algorithm.as_str()).exists() {
            return Err(Error::invalid_store(&root, "objects directory missing"));
        }

        Ok(Self {
            root,
            algorithm,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        })
    }

    /// Open the store at `root`, initializing it first if absent.
    pub fn open_or_init<P: AsRef<Path>>(root: P) -> Result<Self> {
        if root.as_ref().join("config").exists() {
            Self::open(root)
        } else {
            Self::init(root, Algorithm::Blake3)
        }
    }

    /// Override the compression threshold.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    fn parse_config(content: &str) -> Result<Algorithm> {
        let mut version = None;
        let mut algo = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "algo" => algo = Some(value.trim()),
                    _ => {}
                }
            }
        }

        if version != Some("1") {
            return Err(Error::invalid_digest(format!(
                "unsupported store version: {:?}",
                version
            )));
        }

        let algo_str = algo.ok_or_else(|| Error::invalid_digest("missing algo in config"))?;
        Algorithm::parse(algo_str)
    }

    /// Path of a block file: `objects/{algorithm}/{prefix}/{suffix}`.
    pub fn block_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("objects")
            .join(self.algorithm.as_str())
            .join(digest.prefix())
            .join(digest.suffix())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Write a block file atomically and durably.
    fn write_block_atomic(
        &self,
        digest: &Digest,
        header: &BlockHeader,
        payload: &[u8],
    ) -> Result<()> {
        let path = self.block_path(digest);
        let parent = path
            .parent()
            .ok_or_else(|| Error::invalid_store(&self.root, "block path has no parent"))?;
        fs::create_dir_all(parent)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        temp_file.write_all(&header.encode())?;
        temp_file.write_all(payload)?;
        temp_file.flush()?;
        temp_file.as_file().sync_all()?;

        temp_file.persist(&path)?;
        Ok(())
    }

    fn read_block_file(&self, path: &Path) -> Result<(BlockHeader, Vec<u8>)> {
        let mut file = fs::File::open(path)?;
        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)
            .map_err(|e| Error::corrupted_block(path, format!("unreadable header: {}", e)))?;
        let header = BlockHeader::decode(&header_buf)
            .map_err(|e| Error::corrupted_block(path, e.to_string()))?;

        let mut stored = Vec::new();
        file.read_to_end(&mut stored)?;

        if stored.len() as u64 != header.stored_len {
            return Err(Error::corrupted_block(
                path,
                format!(
                    "payload length mismatch: expected {}, got {}",
                    header.stored_len,
                    stored.len()
                ),
            ));
        }

        Ok((header, stored))
    }
}

impl BlockStore for FsBlockStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of(data);

        if self.block_path(&digest).exists() {
            return Ok(digest);
        }

        let compression = CompressionType::for_len(data.len(), self.compression_threshold);
        let stored = compression.encode(data)?;
        let header = BlockHeader {
            algorithm: self.algorithm,
            compression,
            stored_len: stored.len() as u64,
        };

        self.write_block_atomic(&digest, &header, &stored)?;
        Ok(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.block_path(digest);

        if !path.exists() {
            return Err(Error::not_found(format!("block {}", digest)));
        }

        let (header, stored) = self.read_block_file(&path)?;
        let payload = header.compression.decode(stored)?;

        let computed = Digest::of(&payload);
        if computed != *digest {
            return Err(Error::corrupted_block(
                &path,
                format!("digest mismatch: expected {}, got {}", digest, computed),
            ));
        }

        Ok(payload)
    }

    fn has(&self, digest: &Digest) -> Result<bool> {
        Ok(self.block_path(digest).exists())
    }
}

/// An in-memory block store.
#[derive(Debug, Default)]
pub struct MemBlockStore {
    blocks: RwLock<HashMap<Digest, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks held.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Number of `put` calls that stored new content.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockStore for MemBlockStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of(data);
        let mut blocks = self.blocks.write();
        if !blocks.contains_key(&digest) {
            blocks.insert(digest, data.to_vec());
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.blocks
            .read()
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("block {}", digest)))
    }

    fn has(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blocks.read().contains_key(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_init_and_open() {
        let temp_dir = TempDir::new().unwrap();
        let store_path = temp_dir.path().join("blocks");

        FsBlockStore::init(&store_path, Algorithm::Blake3).unwrap();
        assert!(store_path.join("objects/blake3").exists());

        let store = FsBlockStore::open(&store_path).unwrap();
        assert_eq!(store.algorithm(), Algorithm::Blake3);
    }

    #[test]
    fn test_store_open_invalid() {
        let temp_dir = TempDir::new().unwrap();
        assert!(FsBlockStore::open(temp_dir.path().join("missing")).is_err());

        // directory without config
        assert!(FsBlockStore::open(temp_dir.path()).is_err());
    }

    #[test]
    fn test_parse_config() {
        let config = "# comment\nversion=1\nalgo=blake3\n";
        assert_eq!(FsBlockStore::parse_config(config).unwrap(), Algorithm::Blake3);
        assert!(FsBlockStore::parse_config("version=99\nalgo=blake3\n").is_err());
        assert!(FsBlockStore::parse_config("version=1\n").is_err());
    }

    #[test]
    fn test_put_get_has() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlockStore::init(temp_dir.path(), Algorithm::Blake3).unwrap();

        let digest = store.put(b"hello blocks").unwrap();
        assert_eq!(digest, Digest::of(b"hello blocks"));
        assert!(store.has(&digest).unwrap());
        assert_eq!(store.get(&digest).unwrap(), b"hello blocks");
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlockStore::init(temp_dir.path(), Algorithm::Blake3).unwrap();

        let err = store.get(&Digest::of(b"nope")).unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.has(&Digest::of(b"nope")).unwrap());
    }

    #[test]
    fn test_put_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlockStore::init(temp_dir.path(), Algorithm::Blake3).unwrap();

        let a = store.put(b"same").unwrap();
        let modified = fs::metadata(store.block_path(&a)).unwrap().modified().unwrap();
        let b = store.put(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(
            fs::metadata(store.block_path(&b)).unwrap().modified().unwrap(),
            modified
        );
    }

    #[test]
    fn test_large_block_is_compressed() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlockStore::init(temp_dir.path(), Algorithm::Blake3).unwrap();

        let data = vec![7u8; 64 * 1024];
        let digest = store.put(&data).unwrap();

        let on_disk = fs::read(store.block_path(&digest)).unwrap();
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&on_disk[..HEADER_SIZE]);
        let header = BlockHeader::decode(&header_bytes).unwrap();
        assert_eq!(header.compression, CompressionType::Zstd);
        assert!(on_disk.len() < data.len());
        assert_eq!(store.get(&digest).unwrap(), data);
    }

    #[test]
    fn test_corruption_detection() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlockStore::init(temp_dir.path(), Algorithm::Blake3).unwrap();

        let digest = store.put(b"precious").unwrap();
        let path = store.block_path(&digest);
        let mut raw = fs::read(&path).unwrap();
        raw[HEADER_SIZE] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        assert!(matches!(
            store.get(&digest),
            Err(Error::CorruptedBlock { .. })
        ));
    }

    #[test]
    fn test_mem_store_counts_new_writes_only() {
        let store = MemBlockStore::new();
        store.put(b"a").unwrap();
        store.put(b"a").unwrap();
        store.put(b"b").unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.write_count(), 2);
        assert!(store.get(&Digest::of(b"c")).unwrap_err().is_not_found());
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 48,
            max_shrink_iters: 1000,
            ..ProptestConfig::default()
        })]

        /// Stored bytes come back unchanged regardless of compression
        #[test]
        fn prop_put_get_lossless(data in prop::collection::vec(any::<u8>(), 0..20_000)) {
            let temp_dir = TempDir::new().unwrap();
            let store = FsBlockStore::init(temp_dir.path(), Algorithm::Blake3)?;
            let digest = store.put(&data)?;
            prop_assert_eq!(store.get(&digest)?, data);
        }
    }
}
