//! # File-Backed Hash Index Tests
//!
//! Drives the bucket/slot protocol through its visible contract, including
//! the single-bucket linear-probing scenario: 141 slots per 4096-byte
//! bucket, EMPTY terminating scans, RELEASED slots skipped on lookup but
//! reused by inserts.

use tempfile::tempdir;

use journalkv::{HashIndexFile, ItemIndex, StoreKey};

fn key(n: u32) -> StoreKey {
    let mut k = [0u8; 16];
    k[..4].copy_from_slice(&n.to_be_bytes());
    k[8..12].copy_from_slice(&n.rotate_left(13).to_be_bytes());
    StoreKey::new(k)
}

mod single_bucket_tests {
    use super::*;

    #[test]
    fn fills_all_141_slots_and_reuses_tombstones() {
        let dir = tempdir().unwrap();
        let mut index = HashIndexFile::open(dir.path().join("idx"), 1).unwrap();

        // One bucket: every key probes the same 141 slots.
        for n in 0..141u32 {
            let previous = index.put(&key(n), ItemIndex::new(n, n as u64)).unwrap();
            assert!(previous.is_none(), "slot {} SHOULD have been free", n);
        }

        for n in 0..141u32 {
            assert_eq!(
                index.get(&key(n)).unwrap(),
                Some(ItemIndex::new(n, n as u64))
            );
        }

        // Release two slots, then re-insert one key: it lands in the first
        // released slot and reports no previous value.
        assert!(index.remove(&key(0)).unwrap().is_some());
        assert!(index.remove(&key(1)).unwrap().is_some());

        let previous = index.put(&key(1), ItemIndex::new(900, 900)).unwrap();
        assert!(previous.is_none());
        assert_eq!(index.get(&key(1)).unwrap(), Some(ItemIndex::new(900, 900)));
        assert!(index.get(&key(0)).unwrap().is_none());
    }

    #[test]
    fn a_full_bucket_rejects_new_keys() {
        let dir = tempdir().unwrap();
        let mut index = HashIndexFile::open(dir.path().join("idx"), 1).unwrap();

        for n in 0..141u32 {
            index.put(&key(n), ItemIndex::new(n, 0)).unwrap();
        }

        let overflow = index.put(&key(999), ItemIndex::new(999, 0));
        assert!(overflow.is_err(), "the 142nd key SHOULD overflow the bucket");

        // Existing keys can still be replaced in place.
        let previous = index.put(&key(5), ItemIndex::new(55, 55)).unwrap();
        assert_eq!(previous, Some(ItemIndex::new(5, 0)));
    }

    #[test]
    fn released_slots_do_not_terminate_lookups() {
        let dir = tempdir().unwrap();
        let mut index = HashIndexFile::open(dir.path().join("idx"), 1).unwrap();

        for n in 0..10u32 {
            index.put(&key(n), ItemIndex::new(n, 0)).unwrap();
        }
        // Tombstone the first few slots; later keys must stay reachable.
        for n in 0..5u32 {
            index.remove(&key(n)).unwrap();
        }

        for n in 5..10u32 {
            assert_eq!(index.get(&key(n)).unwrap(), Some(ItemIndex::new(n, 0)));
        }
        for n in 0..5u32 {
            assert!(index.get(&key(n)).unwrap().is_none());
        }
    }
}

mod durability_tests {
    use super::*;

    #[test]
    fn flush_then_reopen_preserves_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx");
        {
            let mut index = HashIndexFile::open(&path, 16).unwrap();
            for n in 0..500u32 {
                index.put(&key(n), ItemIndex::new(n % 7, n as u64 * 13)).unwrap();
            }
            index.close().unwrap();
        }

        let index = HashIndexFile::open(&path, 16).unwrap();
        for n in 0..500u32 {
            assert_eq!(
                index.get(&key(n)).unwrap(),
                Some(ItemIndex::new(n % 7, n as u64 * 13))
            );
        }
        assert_eq!(index.occupied_keys().len(), 500);
    }

    #[test]
    fn tombstones_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx");
        {
            let mut index = HashIndexFile::open(&path, 4).unwrap();
            index.put(&key(1), ItemIndex::new(1, 1)).unwrap();
            index.put(&key(2), ItemIndex::new(2, 2)).unwrap();
            index.remove(&key(1)).unwrap();
            index.close().unwrap();
        }

        let index = HashIndexFile::open(&path, 4).unwrap();
        assert!(index.get(&key(1)).unwrap().is_none());
        assert_eq!(index.get(&key(2)).unwrap(), Some(ItemIndex::new(2, 2)));
    }
}
