//! The reference index: `(peername, name)` → head record.
//!
//! This is the only mutable shared state in a repo. Readers take snapshots
//! under a read lock. Writers compute the new map on a copy, persist it with
//! write-new-then-replace, and only then swap it in, so a failed write leaves
//! the last valid state both on disk and in memory.
//!
//! Callers that must read a head and later replace it (Save, Rename) hold the
//! slot lock from [`RefIndex::slot`] across the whole sequence.

use crate::dataset::{DatasetRef, ProfileId};
use crate::error::{Error, Result};
use crate::hash::DatasetPath;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Index key: `(peername, name)`.
pub type SlotKey = (String, String);

/// One persisted index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefRecord {
    pub peername: String,
    pub name: String,
    pub profile_id: ProfileId,
    pub path: DatasetPath,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// False for datasets imported from another peer.
    #[serde(default = "default_authored")]
    pub authored: bool,
    /// Path last sent to the registry, if the dataset is listed there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DatasetPath>,
}

fn default_authored() -> bool {
    true
}

impl RefRecord {
    pub fn key(&self) -> SlotKey {
        (self.peername.clone(), self.name.clone())
    }

    /// Fully resolved reference for this entry.
    pub fn to_ref(&self) -> DatasetRef {
        DatasetRef::new(&self.peername, &self.name)
            .with_profile_id(self.profile_id.clone())
            .with_path(self.path)
    }
}

/// Handle to the reference index.
#[derive(Debug)]
pub struct RefIndex {
    file: Option<PathBuf>,
    records: RwLock<BTreeMap<SlotKey, RefRecord>>,
    slots: Mutex<HashMap<SlotKey, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

impl RefIndex {
    /// Open the index persisted at `file`, starting empty if it does not exist.
    pub fn open<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref().to_path_buf();

        let records = if file.exists() {
            let content = fs::read(&file)?;
            let list: Vec<RefRecord> = serde_json::from_slice(&content)?;
            list.into_iter().map(|r| (r.key(), r)).collect()
        } else {
            BTreeMap::new()
        };

        debug!(path = %file.display(), entries = records.len(), "opened reference index");

        Ok(Self {
            file: Some(file),
            records: RwLock::new(records),
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// An index that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            file: None,
            records: RwLock::new(BTreeMap::new()),
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The per-slot lock for `(peername, name)`.
    ///
    /// Locks nobody holds a handle to are dropped here, so the map stays
    /// bounded by the number of slots in use at once.
    pub fn slot(&self, peername: &str, name: &str) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock();
        slots.retain(|_, lock| Arc::strong_count(lock) > 1);
        slots
            .entry((peername.to_string(), name.to_string()))
            .or_default()
            .clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::IndexClosed);
        }
        Ok(())
    }

    pub fn get(&self, peername: &str, name: &str) -> Result<Option<RefRecord>> {
        self.ensure_open()?;
        Ok(self
            .records
            .read()
            .get(&(peername.to_string(), name.to_string()))
            .cloned())
    }

    /// First entry whose head is `path`.
    pub fn find_by_path(&self, path: &DatasetPath) -> Result<Option<RefRecord>> {
        self.ensure_open()?;
        Ok(self
            .records
            .read()
            .values()
            .find(|r| r.path == *path)
            .cloned())
    }

    /// Snapshot of the entries, optionally limited to one peername.
    pub fn list(&self, peername: Option<&str>) -> Result<Vec<RefRecord>> {
        self.ensure_open()?;
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| peername.is_none_or(|p| r.peername == p))
            .cloned()
            .collect())
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Insert or replace an entry.
    pub fn put(&self, record: RefRecord) -> Result<()> {
        self.mutate(|records| {
            records.insert(record.key(), record);
            Ok(())
        })
    }

    /// Delete an entry, returning it.
    pub fn remove(&self, peername: &str, name: &str) -> Result<RefRecord> {
        self.mutate(|records| {
            records
                .remove(&(peername.to_string(), name.to_string()))
                .ok_or_else(|| Error::not_found(format!("dataset {}/{}", peername, name)))
        })
    }

    /// Move an entry to a new slot; the head is unchanged.
    pub fn rename(&self, from: &SlotKey, to: &SlotKey) -> Result<RefRecord> {
        self.mutate(|records| {
            if records.contains_key(to) {
                return Err(Error::exists(format!("{}/{}", to.0, to.1)));
            }
            let mut record = records
                .remove(from)
                .ok_or_else(|| Error::not_found(format!("dataset {}/{}", from.0, from.1)))?;
            record.peername = to.0.clone();
            record.name = to.1.clone();
            record.updated = Utc::now();
            records.insert(to.clone(), record.clone());
            Ok(record)
        })
    }

    /// Apply `f` to an existing entry.
    pub fn update<F>(&self, peername: &str, name: &str, f: F) -> Result<RefRecord>
    where
        F: FnOnce(&mut RefRecord),
    {
        self.mutate(|records| {
            let record = records
                .get_mut(&(peername.to_string(), name.to_string()))
                .ok_or_else(|| Error::not_found(format!("dataset {}/{}", peername, name)))?;
            f(record);
            Ok(record.clone())
        })
    }

    fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut BTreeMap<SlotKey, RefRecord>) -> Result<T>,
    {
        self.ensure_open()?;
        let mut guard = self.records.write();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }

    /// Write the current entries to disk.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let guard = self.records.read();
        self.persist(&guard)
    }

    /// Flush and refuse further use.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.closed.store(true, Ordering::SeqCst);
        debug!("closed reference index");
        Ok(())
    }

    fn persist(&self, records: &BTreeMap<SlotKey, RefRecord>) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let dir = match file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let list: Vec<&RefRecord> = records.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(&dir)?;
        temp_file.write_all(&bytes)?;
        temp_file.flush()?;
        temp_file.as_file().sync_all()?;
        temp_file.persist(file)?;
        Ok(())
    }
}
