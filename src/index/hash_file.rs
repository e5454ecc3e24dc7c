//! # File-Backed Hash Index
//!
//! A durable hash table mapping 16-byte keys to `(segment, offset)` item
//! indexes. The whole table is one memory-mapped file of fixed-size
//! buckets; capacity is chosen at open time and never grows.
//!
//! ## Layout
//!
//! ```text
//! file = bucket*                      (bucket_count × 4096 bytes)
//! bucket = slot[141] | 7 pad bytes
//! slot = state:u8 | key:[u8;16] | segment:u32be | offset:u64be   (29 bytes)
//! ```
//!
//! Slot states: EMPTY (never written), OCCUPIED, RELEASED (tombstone).
//!
//! ## Probing protocol
//!
//! A key hashes to one bucket; within the bucket, slots are scanned
//! linearly:
//!
//! - `put` claims the first EMPTY slot, or overwrites an OCCUPIED slot with
//!   a matching key, or — only after scanning the whole bucket — reuses the
//!   first RELEASED slot it saw. A bucket with no room is an error: the
//!   file was sized too small for the population.
//! - `get`/`remove` stop at the first EMPTY slot, because `put` never
//!   writes past one — no live key can lie beyond it. RELEASED slots are
//!   skipped, not terminal.
//!
//! Bucket placement must be stable across process restarts, so hashing
//! uses `DefaultHasher` with its fixed default keys.
//!
//! Not thread-safe: the owner serializes access (the LRU index map guards
//! it with its own lock).

use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions};
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::MmapMut;
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::key::{StoreKey, KEY_BYTES};

pub const BUCKET_BYTES: usize = 4096;
pub const SLOT_BYTES: usize = 29;
pub const SLOTS_PER_BUCKET: usize = BUCKET_BYTES / SLOT_BYTES;

const STATE_EMPTY: u8 = 0;
const STATE_OCCUPIED: u8 = 1;
const STATE_RELEASED: u8 = 2;

/// Position of one item: the segment holding it and the body-relative
/// offset of its value record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ItemIndex {
    segment: U32,
    offset: U64,
}

const _: () = assert!(std::mem::size_of::<ItemIndex>() == 12);
const _: () = assert!(1 + KEY_BYTES + std::mem::size_of::<ItemIndex>() == SLOT_BYTES);

impl ItemIndex {
    pub fn new(segment: u32, offset: u64) -> Self {
        Self {
            segment: U32::new(segment),
            offset: U64::new(offset),
        }
    }

    pub fn segment(&self) -> u32 {
        self.segment.get()
    }

    pub fn offset(&self) -> u64 {
        self.offset.get()
    }
}

pub struct HashIndexFile {
    path: PathBuf,
    // Declared before `file` so the mapping is dropped (unmapped) first;
    // some platforms hold a lock on the file while a mapping exists.
    mmap: MmapMut,
    file: File,
    bucket_count: usize,
}

impl HashIndexFile {
    /// Opens or creates the index file with `bucket_count` buckets. An
    /// existing file must match that capacity exactly — the table never
    /// grows.
    pub fn open<P: AsRef<Path>>(path: P, bucket_count: usize) -> Result<Self> {
        let path = path.as_ref();
        ensure!(bucket_count > 0, "hash index needs at least one bucket");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open hash index file '{}'", path.display()))?;

        let expected = (bucket_count * BUCKET_BYTES) as u64;
        let current = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat hash index file '{}'", path.display()))?
            .len();

        if current == 0 {
            file.set_len(expected)
                .wrap_err_with(|| format!("failed to size hash index file '{}'", path.display()))?;
        } else {
            ensure!(
                current == expected,
                "hash index file '{}' is {} bytes but {} buckets require {}",
                path.display(),
                current,
                bucket_count,
                expected
            );
        }

        // SAFETY: the file was just opened read+write and sized to the full
        // bucket region. The store owns its files exclusively (no
        // multi-process access), and the mapping's lifetime is tied to this
        // struct, which unmaps before the file handle is dropped. All slot
        // access below is bounds-limited to bucket_count * BUCKET_BYTES.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            file,
            bucket_count,
        })
    }

    /// Inserts or replaces, returning the previous value for the key.
    pub fn put(&mut self, key: &StoreKey, item: ItemIndex) -> Result<Option<ItemIndex>> {
        let bucket = self.bucket_of(key);
        let mut first_released: Option<usize> = None;

        for slot in 0..SLOTS_PER_BUCKET {
            match self.slot_state(bucket, slot)? {
                STATE_EMPTY => {
                    self.write_slot(bucket, slot, key, item);
                    return Ok(None);
                }
                STATE_OCCUPIED => {
                    if self.slot_key_matches(bucket, slot, key) {
                        let previous = self.slot_item(bucket, slot)?;
                        self.write_slot(bucket, slot, key, item);
                        return Ok(Some(previous));
                    }
                }
                STATE_RELEASED => {
                    if first_released.is_none() {
                        first_released = Some(slot);
                    }
                }
                _ => unreachable!(),
            }
            // Keep scanning: the key may still occupy a later slot.
        }

        match first_released {
            Some(slot) => {
                self.write_slot(bucket, slot, key, item);
                Ok(None)
            }
            None => bail!(
                "bucket {} of '{}' is full ({} slots); the index file was sized too small",
                bucket,
                self.path.display(),
                SLOTS_PER_BUCKET
            ),
        }
    }

    pub fn get(&self, key: &StoreKey) -> Result<Option<ItemIndex>> {
        let bucket = self.bucket_of(key);

        for slot in 0..SLOTS_PER_BUCKET {
            match self.slot_state(bucket, slot)? {
                // No live key can lie past an EMPTY slot.
                STATE_EMPTY => return Ok(None),
                STATE_OCCUPIED => {
                    if self.slot_key_matches(bucket, slot, key) {
                        return Ok(Some(self.slot_item(bucket, slot)?));
                    }
                }
                STATE_RELEASED => {}
                _ => unreachable!(),
            }
        }
        Ok(None)
    }

    /// Tombstones the key's slot, returning the value it held.
    pub fn remove(&mut self, key: &StoreKey) -> Result<Option<ItemIndex>> {
        let bucket = self.bucket_of(key);

        for slot in 0..SLOTS_PER_BUCKET {
            match self.slot_state(bucket, slot)? {
                STATE_EMPTY => return Ok(None),
                STATE_OCCUPIED => {
                    if self.slot_key_matches(bucket, slot, key) {
                        let item = self.slot_item(bucket, slot)?;
                        let base = self.slot_base(bucket, slot);
                        self.mmap[base] = STATE_RELEASED;
                        return Ok(Some(item));
                    }
                }
                STATE_RELEASED => {}
                _ => unreachable!(),
            }
        }
        Ok(None)
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err_with(|| format!("failed to flush hash index '{}'", self.path.display()))
    }

    /// Forces the mapping, unmaps it, and closes the file.
    pub fn close(self) -> Result<()> {
        self.flush()?;
        drop(self.mmap);
        drop(self.file);
        Ok(())
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Every key currently held in an OCCUPIED slot. A full-file scan,
    /// intended for snapshots and diagnostics, not hot paths.
    pub fn occupied_keys(&self) -> Vec<StoreKey> {
        let mut keys = Vec::new();
        for bucket in 0..self.bucket_count {
            for slot in 0..SLOTS_PER_BUCKET {
                let base = self.slot_base(bucket, slot);
                match self.mmap[base] {
                    STATE_EMPTY => break, // rest of the bucket is empty
                    STATE_OCCUPIED => {
                        let mut key = [0u8; KEY_BYTES];
                        key.copy_from_slice(&self.mmap[base + 1..base + 1 + KEY_BYTES]);
                        keys.push(StoreKey::new(key));
                    }
                    _ => {}
                }
            }
        }
        keys
    }

    fn bucket_of(&self, key: &StoreKey) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write(key.as_bytes());
        (hasher.finish() % self.bucket_count as u64) as usize
    }

    fn slot_base(&self, bucket: usize, slot: usize) -> usize {
        bucket * BUCKET_BYTES + slot * SLOT_BYTES
    }

    fn slot_state(&self, bucket: usize, slot: usize) -> Result<u8> {
        let state = self.mmap[self.slot_base(bucket, slot)];
        ensure!(
            state == STATE_EMPTY || state == STATE_OCCUPIED || state == STATE_RELEASED,
            "unknown slot state {} in bucket {} of '{}'",
            state,
            bucket,
            self.path.display()
        );
        Ok(state)
    }

    fn slot_key_matches(&self, bucket: usize, slot: usize, key: &StoreKey) -> bool {
        let base = self.slot_base(bucket, slot) + 1;
        &self.mmap[base..base + KEY_BYTES] == key.as_bytes().as_slice()
    }

    fn slot_item(&self, bucket: usize, slot: usize) -> Result<ItemIndex> {
        let base = self.slot_base(bucket, slot) + 1 + KEY_BYTES;
        ItemIndex::read_from_bytes(&self.mmap[base..base + std::mem::size_of::<ItemIndex>()])
            .map_err(|e| eyre::eyre!("invalid item index in slot: {:?}", e))
    }

    fn write_slot(&mut self, bucket: usize, slot: usize, key: &StoreKey, item: ItemIndex) {
        let base = self.slot_base(bucket, slot);
        self.mmap[base] = STATE_OCCUPIED;
        self.mmap[base + 1..base + 1 + KEY_BYTES].copy_from_slice(key.as_bytes());
        self.mmap[base + 1 + KEY_BYTES..base + SLOT_BYTES].copy_from_slice(item.as_bytes());
    }
}
