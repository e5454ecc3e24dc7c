//! # Recovery Tests
//!
//! Close/reopen equivalence, log replay corner cases, and the healing of a
//! dangling update (an ADD whose matching DEL was lost). The hand-crafted
//! cases write segment files directly in the on-disk format: an 8-byte
//! big-endian capacity header plus `len:u32be | bytes` records in the data
//! file, and 33-byte operation records
//! (`op:u8 | key:16 | segment:u32be | offset:u64be | len:u32be`) in the
//! log.

use std::path::Path;

use tempfile::tempdir;

use journalkv::JournalStore;

fn key(n: u32) -> [u8; 16] {
    let mut k = [0u8; 16];
    k[..4].copy_from_slice(&n.to_be_bytes());
    k[12..].copy_from_slice(&n.wrapping_mul(31).to_be_bytes());
    k
}

fn op_record(op: u8, key: &[u8; 16], segment: u32, offset: u64, len: u32) -> Vec<u8> {
    let mut record = Vec::with_capacity(33);
    record.push(op);
    record.extend_from_slice(key);
    record.extend_from_slice(&segment.to_be_bytes());
    record.extend_from_slice(&offset.to_be_bytes());
    record.extend_from_slice(&len.to_be_bytes());
    record
}

/// Writes a sealed segment holding one value record for `key`.
fn write_segment(dir: &Path, name: &str, serial: u32, key: &[u8; 16], value: &[u8]) {
    let capacity = 8 + 4 + value.len() as u64;
    let mut data = capacity.to_be_bytes().to_vec();
    data.extend_from_slice(&(value.len() as u32).to_be_bytes());
    data.extend_from_slice(value);
    std::fs::write(dir.join(format!("{}.{}", name, serial)), data).unwrap();

    let log = op_record(1, key, serial, 0, value.len() as u32);
    std::fs::write(dir.join(format!("{}.{}.log", name, serial)), log).unwrap();
}

mod reopen_tests {
    use super::*;

    #[test]
    fn reopen_restores_the_exact_index() {
        let dir = tempdir().unwrap();
        {
            let store = JournalStore::builder(dir.path(), "store")
                .file_size(4096)
                .open()
                .unwrap();
            for n in 0..100u32 {
                store.add(&key(n), format!("v{}", n).as_bytes()).unwrap();
            }
            for n in 0..20u32 {
                store.remove(&key(n)).unwrap();
            }
            for n in 20..30u32 {
                store.update(&key(n), b"updated").unwrap();
            }
            store.close().unwrap();
        }

        let store = JournalStore::builder(dir.path(), "store")
            .file_size(4096)
            .open()
            .unwrap();

        assert_eq!(store.len().unwrap(), 80);
        for n in 0..20u32 {
            assert!(store.get(&key(n)).unwrap().is_none());
        }
        for n in 20..30u32 {
            assert_eq!(store.get(&key(n)).unwrap().unwrap(), b"updated");
        }
        for n in 30..100u32 {
            assert_eq!(
                store.get(&key(n)).unwrap().unwrap(),
                format!("v{}", n).into_bytes()
            );
        }
    }

    #[test]
    fn reopen_after_reopen_is_stable() {
        let dir = tempdir().unwrap();
        for round in 0..3u32 {
            let store = JournalStore::open(dir.path(), "store").unwrap();
            store.add_sync(&key(round), &round.to_be_bytes()).unwrap();
            assert_eq!(store.len().unwrap(), round as usize + 1);
            store.close().unwrap();
        }

        let store = JournalStore::open(dir.path(), "store").unwrap();
        assert_eq!(store.len().unwrap(), 3);
        for round in 0..3u32 {
            assert_eq!(
                store.get(&key(round)).unwrap().unwrap(),
                round.to_be_bytes()
            );
        }
    }

    #[test]
    fn a_fully_drained_store_reopens_empty() {
        let dir = tempdir().unwrap();
        {
            let store = JournalStore::open(dir.path(), "store").unwrap();
            for n in 0..10u32 {
                store.add(&key(n), b"gone").unwrap();
            }
            for n in 0..10u32 {
                store.remove(&key(n)).unwrap();
            }
            store.close().unwrap();
        }

        let store = JournalStore::open(dir.path(), "store").unwrap();
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn checkpoint_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let store = JournalStore::open(dir.path(), "store").unwrap();
            store.add_sync(&key(1), b"tracked").unwrap();
            store.close().unwrap();
        }
        assert!(dir.path().join("checkpoint").exists());

        let store = JournalStore::open(dir.path(), "store").unwrap();
        assert_eq!(store.get(&key(1)).unwrap().unwrap(), b"tracked");
    }

    #[test]
    fn recovered_refcounts_match_live_records() {
        let dir = tempdir().unwrap();
        {
            let store = JournalStore::builder(dir.path(), "store")
                .file_size(128)
                .open()
                .unwrap();
            // Seal a few segments, with one removal in the middle.
            for n in 0..6u32 {
                store.add_sync(&key(n), &[n as u8; 40]).unwrap();
            }
            store.remove_sync(&key(2)).unwrap();
            store.close().unwrap();
        }

        let store = JournalStore::builder(dir.path(), "store")
            .file_size(128)
            .open()
            .unwrap();

        assert_eq!(store.len().unwrap(), 5);
        assert!(store.get(&key(2)).unwrap().is_none());
        for n in [0u32, 1, 3, 4, 5] {
            assert_eq!(store.get(&key(n)).unwrap().unwrap(), vec![n as u8; 40]);
        }
    }
}

mod replay_tests {
    use super::*;

    #[test]
    fn heals_a_dangling_update_across_segments() {
        let dir = tempdir().unwrap();
        let k = key(7);

        // Two sealed segments both holding an ADD for the same key and no
        // DEL — the state a crash leaves when it hits between the re-add
        // and the journaled DEL of an update.
        write_segment(dir.path(), "store", 1, &k, b"stale revision");
        write_segment(dir.path(), "store", 2, &k, b"live revision");

        let store = JournalStore::builder(dir.path(), "store")
            .file_size(64)
            .open()
            .unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(&k).unwrap().unwrap(), b"live revision");

        // The healed DEL drained segment 1 entirely, so it was deleted.
        store.sync().unwrap();
        assert!(!dir.path().join("store.1").exists());
        assert!(!dir.path().join("store.1.log").exists());
        assert!(dir.path().join("store.2").exists());
    }

    #[test]
    fn unknown_op_bytes_are_skipped() {
        let dir = tempdir().unwrap();
        let k = key(1);

        write_segment(dir.path(), "store", 1, &k, b"kept");
        // Append a record with a bogus op byte to the log.
        let mut log = std::fs::read(dir.path().join("store.1.log")).unwrap();
        log.extend_from_slice(&op_record(9, &key(2), 1, 0, 4));
        std::fs::write(dir.path().join("store.1.log"), log).unwrap();

        let store = JournalStore::builder(dir.path(), "store")
            .file_size(64)
            .open()
            .unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(&k).unwrap().unwrap(), b"kept");
    }

    #[test]
    fn a_torn_trailing_log_record_is_ignored() {
        let dir = tempdir().unwrap();
        let k = key(1);

        write_segment(dir.path(), "store", 1, &k, b"kept");
        // A partial record at the tail, as a crash mid-append leaves it.
        let mut log = std::fs::read(dir.path().join("store.1.log")).unwrap();
        log.extend_from_slice(&[1u8; 20]);
        std::fs::write(dir.path().join("store.1.log"), log).unwrap();

        let store = JournalStore::builder(dir.path(), "store")
            .file_size(64)
            .open()
            .unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(&k).unwrap().unwrap(), b"kept");
    }

    #[test]
    fn a_short_sealed_segment_refuses_to_start() {
        let dir = tempdir().unwrap();
        let k = key(1);

        // Segment 1 claims a capacity far beyond its actual length, so it
        // is neither full nor the terminal segment once segment 2 exists.
        let mut data = 4096u64.to_be_bytes().to_vec();
        data.extend_from_slice(&4u32.to_be_bytes());
        data.extend_from_slice(b"oops");
        std::fs::write(dir.path().join("store.1"), data).unwrap();
        std::fs::write(
            dir.path().join("store.1.log"),
            op_record(1, &k, 1, 0, 4),
        )
        .unwrap();
        write_segment(dir.path(), "store", 2, &key(2), b"fine");

        let result = JournalStore::builder(dir.path(), "store")
            .file_size(64)
            .open();

        assert!(
            result.is_err(),
            "a sealed segment shorter than its capacity SHOULD fail recovery"
        );
    }

    #[test]
    fn stale_checkpoint_past_all_segments_is_ignored() {
        let dir = tempdir().unwrap();
        {
            let store = JournalStore::open(dir.path(), "store").unwrap();
            store.add_sync(&key(1), b"value").unwrap();
            store.close().unwrap();
        }

        // Replace the checkpoint with one pointing far past any segment.
        let mut fake = b"jkvckpt\x00".to_vec();
        fake.extend_from_slice(&1u32.to_be_bytes());
        fake.extend_from_slice(&key(1));
        fake.extend_from_slice(&99u32.to_be_bytes());
        fake.extend_from_slice(&0u64.to_be_bytes());
        std::fs::write(dir.path().join("checkpoint"), fake).unwrap();

        let store = JournalStore::open(dir.path(), "store").unwrap();
        assert_eq!(store.get(&key(1)).unwrap().unwrap(), b"value");
    }

    #[test]
    fn same_segment_readds_do_not_double_count() {
        let dir = tempdir().unwrap();
        {
            let store = JournalStore::builder(dir.path(), "store")
                .file_size(4096)
                .open()
                .unwrap();
            // Same key updated repeatedly inside one segment.
            store.add(&key(1), b"r1").unwrap();
            store.update(&key(1), b"r2").unwrap();
            store.update(&key(1), b"r3").unwrap();
            store.close().unwrap();
        }

        let store = JournalStore::builder(dir.path(), "store")
            .file_size(4096)
            .open()
            .unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(&key(1)).unwrap().unwrap(), b"r3");

        // Removing the single live record must drain the store completely.
        store.remove_sync(&key(1)).unwrap();
        store.close().unwrap();

        let store = JournalStore::builder(dir.path(), "store")
            .file_size(4096)
            .open()
            .unwrap();
        assert_eq!(store.len().unwrap(), 0);
    }
}
