//! # In-Memory Index
//!
//! The journal store keeps one live [`OpRecord`] per key in an index map.
//! The map is a capability with two interchangeable implementations:
//!
//! - [`MemIndex`] — everything in RAM behind a `RwLock`; the default.
//! - [`LruIndex`] — a bounded cache that spills cold entries to a
//!   [`HashIndexFile`], for stores whose key population outgrows memory.
//!
//! Both are safe to share across threads; the file-backed table underneath
//! the LRU variant is single-owner and guarded by the LRU's lock.

mod hash_file;
mod lru;

pub use hash_file::{HashIndexFile, ItemIndex, BUCKET_BYTES, SLOTS_PER_BUCKET, SLOT_BYTES};
pub use lru::LruIndex;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::journal::OpRecord;
use crate::key::StoreKey;

/// Map from key to its live operation record.
pub trait IndexMap: Send + Sync {
    fn get(&self, key: &StoreKey) -> Result<Option<OpRecord>>;

    fn put(&self, key: StoreKey, record: OpRecord) -> Result<()>;

    fn remove(&self, key: &StoreKey) -> Result<Option<OpRecord>>;

    /// Bulk load used by recovery when merging a replayed segment.
    fn put_all(&self, entries: Vec<(StoreKey, OpRecord)>) -> Result<()>;

    /// Snapshot of the current keys; never a live view.
    fn keys(&self) -> Result<Vec<StoreKey>>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Releases any backing resources. The map must not be used afterwards.
    fn close(&self) -> Result<()>;
}

/// Fully in-memory concurrent index.
#[derive(Default)]
pub struct MemIndex {
    entries: RwLock<HashMap<StoreKey, OpRecord>>,
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexMap for MemIndex {
    fn get(&self, key: &StoreKey) -> Result<Option<OpRecord>> {
        Ok(self.entries.read().get(key).copied())
    }

    fn put(&self, key: StoreKey, record: OpRecord) -> Result<()> {
        self.entries.write().insert(key, record);
        Ok(())
    }

    fn remove(&self, key: &StoreKey) -> Result<Option<OpRecord>> {
        Ok(self.entries.write().remove(key))
    }

    fn put_all(&self, entries: Vec<(StoreKey, OpRecord)>) -> Result<()> {
        let mut map = self.entries.write();
        for (key, record) in entries {
            map.insert(key, record);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<StoreKey>> {
        Ok(self.entries.read().keys().copied().collect())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.read().len())
    }

    fn close(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(segment: u32) -> OpRecord {
        OpRecord::add(StoreKey::new([1; 16]), segment, 0, 4)
    }

    #[test]
    fn mem_index_put_get_remove() {
        let index = MemIndex::new();
        let key = StoreKey::new([1; 16]);

        index.put(key, record(1)).unwrap();
        assert_eq!(index.get(&key).unwrap().unwrap().segment(), 1);
        assert_eq!(index.len().unwrap(), 1);

        index.put(key, record(2)).unwrap();
        assert_eq!(index.get(&key).unwrap().unwrap().segment(), 2);
        assert_eq!(index.len().unwrap(), 1);

        assert!(index.remove(&key).unwrap().is_some());
        assert!(index.get(&key).unwrap().is_none());
        assert!(index.is_empty().unwrap());
    }
}
