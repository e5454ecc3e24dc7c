//! LRU index variant: a bounded in-memory cache over a file-backed hash
//! table.
//!
//! Hot entries live in a plain map; once the map exceeds its capacity the
//! oldest-inserted entries spill to a [`HashIndexFile`] as bare
//! `(segment, offset)` item indexes. A miss pulls the entry back and
//! reconstructs its operation record; the value length is not stored in
//! the slot, so reconstructed records carry `len = 0` and readers rely on
//! the data file's own length prefix.
//!
//! The backing file is scratch space, not a source of truth: recovery
//! rebuilds the index from the segment logs, so the file is wiped on open.

use std::collections::VecDeque;
use std::path::Path;

use eyre::{Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use super::hash_file::{HashIndexFile, ItemIndex};
use super::IndexMap;
use crate::journal::OpRecord;
use crate::key::StoreKey;

pub struct LruIndex {
    inner: Mutex<LruInner>,
}

struct LruInner {
    cache: HashMap<StoreKey, OpRecord>,
    /// Insertion order; stale entries (removed keys) are skipped lazily.
    order: VecDeque<StoreKey>,
    capacity: usize,
    backing: HashIndexFile,
}

impl LruIndex {
    /// Creates the LRU index with an in-memory capacity of `capacity`
    /// records, spilling to a hash-index file at `path` with
    /// `bucket_count` buckets. Any previous spill file is discarded.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize, bucket_count: usize) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).wrap_err_with(|| {
                    format!("failed to reset index spill file '{}'", path.display())
                })
            }
        }

        let backing = HashIndexFile::open(path, bucket_count)?;

        Ok(Self {
            inner: Mutex::new(LruInner {
                cache: HashMap::with_capacity(capacity.min(1024)),
                order: VecDeque::new(),
                capacity: capacity.max(1),
                backing,
            }),
        })
    }
}

impl LruInner {
    fn insert(&mut self, key: StoreKey, record: OpRecord) -> Result<()> {
        if self.cache.insert(key, record).is_none() {
            self.order.push_back(key);
        }
        self.evict_overflow()
    }

    fn evict_overflow(&mut self) -> Result<()> {
        while self.cache.len() > self.capacity {
            let oldest = match self.order.pop_front() {
                Some(key) => key,
                None => break,
            };
            if let Some(record) = self.cache.remove(&oldest) {
                self.backing
                    .put(&oldest, ItemIndex::new(record.segment(), record.offset()))?;
            }
            // A missing entry was removed since it was queued; skip it.
        }
        Ok(())
    }

    fn lookup(&mut self, key: &StoreKey) -> Result<Option<OpRecord>> {
        if let Some(record) = self.cache.get(key) {
            return Ok(Some(*record));
        }

        match self.backing.get(key)? {
            Some(item) => {
                // The slot stores no length; the data file's record prefix
                // is authoritative when this entry is read.
                let record = OpRecord::add(*key, item.segment(), item.offset(), 0);
                self.insert(*key, record)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

impl IndexMap for LruIndex {
    fn get(&self, key: &StoreKey) -> Result<Option<OpRecord>> {
        self.inner.lock().lookup(key)
    }

    fn put(&self, key: StoreKey, record: OpRecord) -> Result<()> {
        self.inner.lock().insert(key, record)
    }

    fn remove(&self, key: &StoreKey) -> Result<Option<OpRecord>> {
        let mut inner = self.inner.lock();
        let cached = inner.cache.remove(key);
        let spilled = inner.backing.remove(key)?;
        Ok(cached.or_else(|| {
            spilled.map(|item| OpRecord::add(*key, item.segment(), item.offset(), 0))
        }))
    }

    fn put_all(&self, entries: Vec<(StoreKey, OpRecord)>) -> Result<()> {
        let mut inner = self.inner.lock();
        for (key, record) in entries {
            inner.insert(key, record)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<StoreKey>> {
        let inner = self.inner.lock();
        let mut keys: HashSet<StoreKey> = inner.cache.keys().copied().collect();
        for key in inner.backing.occupied_keys() {
            keys.insert(key);
        }
        Ok(keys.into_iter().collect())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.cache.clear();
        inner.order.clear();
        inner.backing.flush()
    }
}
