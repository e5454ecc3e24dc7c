//! # Store Coordinator
//!
//! [`JournalStore`] is the public face of the crate: a persistent map from
//! 16-byte keys to byte strings, backed by numbered segments under one
//! directory:
//!
//! ```text
//! store_dir/
//! ├── mystore.1        # segment 1 data (sealed, read-only)
//! ├── mystore.1.log    # segment 1 operation journal
//! ├── mystore.2        # active segment data
//! ├── mystore.2.log
//! ├── mystore_indexCache   # LRU index spill file (optional)
//! └── checkpoint       # replay bound for recovery
//! ```
//!
//! ## Write path
//!
//! `add` validates, hands the value to the writer thread (which resolves
//! the record's segment and offset at enqueue time), then updates the
//! in-memory index, the last-modified map, and the checkpoint's resume
//! map. `update` re-adds and cancels the old record — with a journaled DEL
//! when the new record landed in a different segment, or a bare reference
//! count decrement when it stayed in the same one. `remove` journals a DEL
//! and forgets the key everywhere.
//!
//! ## Read path
//!
//! `get` consults the writer's in-flight buffer first, so a value is
//! readable the moment `add` returns, fsynced or not. It then follows the
//! index entry to a positional read of the data file. An index entry whose
//! segment no longer exists is stale; `get` heals by dropping it.
//!
//! ## Recovery
//!
//! On open, every segment's log is replayed in serial order to rebuild the
//! index and the per-segment reference counts. The checkpoint bounds the
//! work: segments entirely below the earliest still-live record are not
//! replayed (they are drained by construction, and deleted once confirmed
//! full and unused). Replay heals the one anomaly the journal protocol
//! permits — an ADD whose matching DEL was lost to a crash mid-`update` —
//! by journaling the missing DEL on the spot.
//!
//! ## Compaction
//!
//! An optional background task wakes at half-day boundaries and walks the
//! key population: records older than `interval_for_remove` are dropped;
//! records older than `interval_for_compact` are re-added so they migrate
//! into the active segment and their old segments can drain to zero and be
//! deleted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{RecvTimeoutError, Sender};
use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::appender::Appender;
use super::checkpoint::{Checkpoint, JournalLocation};
use super::op_record::{OpRecord, OP_RECORD_BYTES};
use super::segment::{Segment, SegmentRegistry, DATA_HEADER_BYTES};
use super::{FILE_SIZE, HALF_DAY_MILLIS, INTERVAL_FOR_COMPACT, INTERVAL_FOR_REMOVE, MAX_BATCH_SIZE};
use crate::index::{IndexMap, LruIndex, MemIndex};
use crate::key::StoreKey;

const CHECKPOINT_FILE: &str = "checkpoint";

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Builds a [`JournalStore`].
pub struct JournalStoreBuilder {
    path: PathBuf,
    name: String,
    file_size: u64,
    max_batch_size: usize,
    force: bool,
    index_lru: bool,
    lru_capacity: usize,
    lru_buckets: usize,
    file_check: bool,
    max_file_count: u64,
    interval_for_compact: i64,
    interval_for_remove: i64,
}

impl JournalStoreBuilder {
    pub fn new<P: AsRef<Path>>(path: P, name: &str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            name: name.to_string(),
            file_size: FILE_SIZE,
            max_batch_size: MAX_BATCH_SIZE,
            force: false,
            index_lru: false,
            lru_capacity: 65_536,
            lru_buckets: 1024,
            file_check: false,
            max_file_count: u64::MAX,
            interval_for_compact: INTERVAL_FOR_COMPACT,
            interval_for_remove: INTERVAL_FOR_REMOVE,
        }
    }

    /// Segment data file capacity. Mostly useful for tests; production
    /// stores keep the 64 MiB default.
    pub fn file_size(mut self, bytes: u64) -> Self {
        self.file_size = bytes;
        self
    }

    pub fn max_batch_size(mut self, bytes: usize) -> Self {
        self.max_batch_size = bytes;
        self
    }

    /// Fsync every batch instead of only on demand.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Use the bounded LRU index with a spill file instead of keeping every
    /// entry in memory.
    pub fn index_lru(mut self, enable: bool) -> Self {
        self.index_lru = enable;
        self
    }

    pub fn lru_capacity(mut self, entries: usize) -> Self {
        self.lru_capacity = entries;
        self
    }

    pub fn lru_buckets(mut self, buckets: usize) -> Self {
        self.lru_buckets = buckets;
        self
    }

    /// Run the background compaction task.
    pub fn file_check(mut self, enable: bool) -> Self {
        self.file_check = enable;
        self
    }

    pub fn max_file_count(mut self, count: u64) -> Self {
        self.max_file_count = count;
        self
    }

    pub fn interval_for_compact(mut self, millis: i64) -> Self {
        self.interval_for_compact = millis;
        self
    }

    /// `-1` disables age-based removal.
    pub fn interval_for_remove(mut self, millis: i64) -> Self {
        self.interval_for_remove = millis;
        self
    }

    pub fn open(self) -> Result<JournalStore> {
        ensure!(
            self.file_size > DATA_HEADER_BYTES + 4,
            "file size {} cannot hold the {}-byte header and a record",
            self.file_size,
            DATA_HEADER_BYTES
        );
        ensure!(!self.name.is_empty(), "store name must not be empty");

        std::fs::create_dir_all(&self.path)
            .wrap_err_with(|| format!("failed to create store directory '{}'", self.path.display()))?;

        let checkpoint = Arc::new(Checkpoint::load(self.path.join(CHECKPOINT_FILE)));

        let index: Box<dyn IndexMap> = if self.index_lru {
            Box::new(LruIndex::open(
                self.path.join(format!("{}_indexCache", self.name)),
                self.lru_capacity,
                self.lru_buckets,
            )?)
        } else {
            Box::new(MemIndex::new())
        };

        let registry = Arc::new(SegmentRegistry::new(
            self.path.clone(),
            self.name.clone(),
            self.file_size,
            self.force,
            self.max_file_count,
            checkpoint.clone(),
        ));
        let appender = Appender::start(registry.clone(), self.force, self.max_batch_size);

        let shared = Arc::new(StoreShared {
            path: self.path,
            name: self.name,
            index,
            last_modified: RwLock::new(HashMap::new()),
            registry,
            appender,
            checkpoint,
            interval_for_compact: AtomicI64::new(self.interval_for_compact),
            interval_for_remove: AtomicI64::new(self.interval_for_remove),
            closed: AtomicBool::new(false),
            check_lock: Mutex::new(()),
        });

        shared.recover()?;

        let checker = if self.file_check {
            info!(store = %shared.name, "starting compaction task");
            Some(spawn_checker(shared.clone()))
        } else {
            None
        };

        Ok(JournalStore {
            shared,
            checker: Mutex::new(checker),
        })
    }
}

struct StoreShared {
    path: PathBuf,
    name: String,
    index: Box<dyn IndexMap>,
    /// Wall-clock millis of each key's original insertion, preserved when
    /// compaction re-adds the record.
    last_modified: RwLock<HashMap<StoreKey, i64>>,
    registry: Arc<SegmentRegistry>,
    appender: Appender,
    checkpoint: Arc<Checkpoint>,
    interval_for_compact: AtomicI64,
    interval_for_remove: AtomicI64,
    closed: AtomicBool,
    check_lock: Mutex<()>,
}

/// Persistent key/value store over an append-only segment journal.
pub struct JournalStore {
    shared: Arc<StoreShared>,
    checker: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl JournalStore {
    pub fn builder<P: AsRef<Path>>(path: P, name: &str) -> JournalStoreBuilder {
        JournalStoreBuilder::new(path, name)
    }

    /// Opens a store with default configuration.
    pub fn open<P: AsRef<Path>>(path: P, name: &str) -> Result<Self> {
        Self::builder(path, name).open()
    }

    /// Stores `value` under `key`, overwriting any existing record. Returns
    /// once enqueued; the value is immediately readable.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.add_opts(key, value, false)
    }

    /// Like [`JournalStore::add`], but blocks until the record is fsynced.
    pub fn add_sync(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.add_opts(key, value, true)
    }

    fn add_opts(&self, key: &[u8], value: &[u8], sync: bool) -> Result<()> {
        let key = StoreKey::from_slice(key)?;
        self.shared.inner_add(key, value, None, sync)?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = StoreKey::from_slice(key)?;
        self.shared.get(&key)
    }

    /// Replaces the value of an existing key. Returns `false` when the key
    /// is not present.
    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let key = StoreKey::from_slice(key)?;
        self.shared.update(key, value)
    }

    /// Removes a key. Returns `false` when it was not present.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let key = StoreKey::from_slice(key)?;
        self.shared.remove(&key, false)
    }

    /// Like [`JournalStore::remove`], but blocks until the DEL is fsynced.
    pub fn remove_sync(&self, key: &[u8]) -> Result<bool> {
        let key = StoreKey::from_slice(key)?;
        self.shared.remove(&key, true)
    }

    /// Snapshot of the current keys. Removing through the snapshot is not
    /// possible; use [`JournalStore::remove`].
    pub fn keys(&self) -> Result<Vec<StoreKey>> {
        self.shared.check_open()?;
        self.shared.index.keys()
    }

    pub fn len(&self) -> Result<usize> {
        self.shared.check_open()?;
        self.shared.index.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Blocks until everything written so far is durable.
    pub fn sync(&self) -> Result<()> {
        self.shared.check_open()?;
        self.shared.appender.sync()
    }

    /// One compaction pass over the whole key population. The background
    /// task calls this on schedule; tests call it directly.
    pub fn check(&self) -> Result<()> {
        self.shared.check()
    }

    /// Flushes, stops background work, and closes every file. Idempotent;
    /// also runs on drop.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some((stop, handle)) = self.checker.lock().take() {
            drop(stop); // disconnects the channel, waking the task
            if handle.join().is_err() {
                warn!("compaction task panicked during close");
            }
        }

        let flush = self.shared.appender.shutdown();
        if let Err(e) = &flush {
            warn!(error = %e, "final flush failed during close");
        }

        if let Err(e) = self.shared.checkpoint.persist() {
            warn!(error = %e, "failed to persist checkpoint during close");
        }

        self.shared.registry.clear();
        self.shared.index.close()?;
        self.shared.last_modified.write().clear();
        info!(store = %self.shared.name, "store closed");
        flush
    }

    // ---- observability --------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// One line per open segment.
    pub fn data_files_info(&self) -> String {
        self.shared
            .registry
            .snapshot()
            .iter()
            .map(|s| s.info())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn active_file_info(&self) -> Option<String> {
        self.shared.registry.active().ok().map(|s| s.info())
    }

    /// Serial of the active segment.
    pub fn current_serial(&self) -> Option<u32> {
        self.shared.registry.active().ok().map(|s| s.serial())
    }

    /// Every index entry, one per line.
    pub fn index_info(&self) -> Result<String> {
        let mut lines = Vec::new();
        for key in self.shared.index.keys()? {
            if let Some(record) = self.shared.index.get(&key)? {
                lines.push(format!(
                    "{:?} -> segment {} offset {} len {}",
                    key,
                    record.segment(),
                    record.offset(),
                    record.len()
                ));
            }
        }
        Ok(lines.join("\n"))
    }

    pub fn interval_for_compact(&self) -> i64 {
        self.shared.interval_for_compact.load(Ordering::Acquire)
    }

    pub fn set_interval_for_compact(&self, millis: i64) {
        self.shared
            .interval_for_compact
            .store(millis, Ordering::Release);
    }

    pub fn interval_for_remove(&self) -> i64 {
        self.shared.interval_for_remove.load(Ordering::Acquire)
    }

    pub fn set_interval_for_remove(&self, millis: i64) {
        self.shared
            .interval_for_remove
            .store(millis, Ordering::Release);
    }

    pub fn max_file_count(&self) -> u64 {
        self.shared.registry.max_file_count()
    }

    pub fn set_max_file_count(&self, count: u64) {
        self.shared.registry.set_max_file_count(count);
    }
}

impl Drop for JournalStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error while closing store on drop");
        }
    }
}

impl StoreShared {
    fn check_open(&self) -> Result<()> {
        ensure!(!self.closed.load(Ordering::Acquire), "store is closed");
        Ok(())
    }

    fn inner_add(
        &self,
        key: StoreKey,
        value: &[u8],
        preserved_time: Option<i64>,
        sync: bool,
    ) -> Result<OpRecord> {
        self.check_open()?;

        let data: Arc<[u8]> = Arc::from(value);
        let (record, location) = self.appender.store(key, data, sync)?;

        self.index.put(key, record)?;
        self.last_modified
            .write()
            .insert(key, preserved_time.unwrap_or_else(now_millis));
        self.checkpoint.record(key, location);
        Ok(record)
    }

    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        self.check_open()?;

        if let Some(data) = self.appender.in_fly_data(key) {
            return Ok(Some(data.to_vec()));
        }

        loop {
            let Some(record) = self.index.get(key)? else {
                return Ok(None);
            };

            if let Some(segment) = self.registry.get(record.segment()) {
                return segment.read_record(record.offset()).map(Some);
            }

            // The segment is gone. Unless a concurrent update moved the key
            // elsewhere in the meantime, the entry is stale: heal and miss.
            let current = self.index.get(key)?;
            if current.is_some_and(|c| c.segment() != record.segment()) {
                continue;
            }
            warn!(
                segment = record.segment(),
                "index entry points at a missing data file; dropping it"
            );
            self.index.remove(key)?;
            self.last_modified.write().remove(key);
            self.checkpoint.forget(key);
            return Ok(None);
        }
    }

    fn update(&self, key: StoreKey, value: &[u8]) -> Result<bool> {
        self.check_open()?;

        let Some(old) = self.index.get(&key)? else {
            return Ok(false);
        };

        let new = self.inner_add(key, value, None, false)?;
        if new.segment() == old.segment() {
            // The re-add incremented the segment it also still holds the
            // old record in; cancel the double count without journaling.
            if let Some(segment) = self.registry.get(old.segment()) {
                segment.decrement();
            }
        } else {
            self.appender.remove(&old, false)?;
        }
        Ok(true)
    }

    fn remove(&self, key: &StoreKey, sync: bool) -> Result<bool> {
        self.check_open()?;

        let Some(record) = self.index.get(key)? else {
            return Ok(false);
        };
        if self.registry.get(record.segment()).is_none() {
            return Ok(false);
        }

        self.appender.remove(&record, sync)?;
        self.index.remove(key)?;
        self.last_modified.write().remove(key);
        self.checkpoint.forget(key);
        Ok(true)
    }

    /// Migrates a live record into the active segment, keeping its original
    /// last-modified stamp, so its old segment can drain and be deleted.
    fn reuse(&self, key: StoreKey, sync: bool) -> Result<()> {
        let Some(value) = self.get(&key)? else {
            return Ok(());
        };
        let preserved = self.last_modified.read().get(&key).copied();
        if self.remove(&key, false)? {
            self.inner_add(key, &value, preserved, sync)?;
        }
        Ok(())
    }

    fn check(&self) -> Result<()> {
        self.check_open()?;
        let _guard = self.check_lock.lock();

        let now = now_millis();
        let compact_after = self.interval_for_compact.load(Ordering::Acquire);
        let remove_after = self.interval_for_remove.load(Ordering::Acquire);
        info!(store = %self.name, "compaction pass starting");

        let mut removed = 0usize;
        let mut migrated = 0usize;
        for key in self.index.keys()? {
            let Some(stamp) = self.last_modified.read().get(&key).copied() else {
                continue;
            };
            let age = now - stamp;
            if remove_after != -1 && age > remove_after {
                if self.remove(&key, true)? {
                    removed += 1;
                }
            } else if age > compact_after {
                self.reuse(key, true)?;
                migrated += 1;
            }
        }

        if let Err(e) = self.checkpoint.persist() {
            warn!(error = %e, "failed to persist checkpoint after compaction");
        }
        info!(store = %self.name, removed, migrated, "compaction pass finished");
        Ok(())
    }

    // ---- recovery -------------------------------------------------------

    fn recover(&self) -> Result<()> {
        info!(store = %self.name, "recovering");

        let serials = self.list_segment_serials()?;
        let replay_from = match self.checkpoint.replay_start() {
            Some(location) if serials.last().is_some_and(|&max| location.segment <= max) => {
                location.segment
            }
            // No checkpoint, or it points past every existing segment:
            // replay everything.
            _ => 0,
        };
        self.checkpoint.clear();

        for &serial in &serials {
            let segment = self.registry.open_segment(serial)?;
            let mut local: HashMap<StoreKey, (OpRecord, u64)> = HashMap::new();

            if serial >= replay_from {
                self.replay_log(&segment, &mut local)?;
            } else {
                debug!(serial, "skipping replay below the checkpoint");
            }

            if segment.data_len() >= segment.capacity() && segment.is_unused() {
                info!(serial, "deleting full, unused segment");
                if let Err(e) = segment.delete() {
                    warn!(serial, error = %e, "failed to delete drained segment");
                }
                continue;
            }

            self.registry.register(segment.clone());
            if !segment.is_unused() {
                let stamp = segment.log_modified_millis().unwrap_or_else(|_| now_millis() as u64) as i64;
                let mut entries = Vec::with_capacity(local.len());
                {
                    let mut last_modified = self.last_modified.write();
                    for (key, (record, log_offset)) in local {
                        last_modified.insert(key, stamp);
                        self.checkpoint
                            .record(key, JournalLocation::new(serial, log_offset));
                        entries.push((key, record));
                    }
                }
                debug!(serial, live = entries.len(), refs = segment.ref_count(), "registered segment");
                self.index.put_all(entries)?;
            }
        }

        // Healing may have drained an already-registered segment; sweep
        // before validating so it is deleted rather than flagged.
        let active_serial = self.registry.highest_serial();
        for segment in self.registry.snapshot() {
            if Some(segment.serial()) != active_serial {
                self.registry.maybe_retire(&segment);
            }
        }

        for segment in self.registry.snapshot() {
            if Some(segment.serial()) == active_serial {
                continue;
            }
            ensure!(
                segment.data_len() >= segment.capacity(),
                "segment {} is sealed but only {} of {} bytes long; refusing to start",
                segment.serial(),
                segment.data_len(),
                segment.capacity()
            );
        }

        match active_serial.and_then(|s| self.registry.get(s)) {
            Some(active) => self.registry.set_active(active),
            None => {
                self.registry.roll()?;
            }
        }

        info!(
            store = %self.name,
            segments = self.registry.len(),
            keys = self.index.len()?,
            "recovery complete"
        );
        Ok(())
    }

    fn replay_log(
        &self,
        segment: &Arc<Segment>,
        local: &mut HashMap<StoreKey, (OpRecord, u64)>,
    ) -> Result<()> {
        let count = segment.log_record_count();
        for i in 0..count {
            let record = match segment.read_log_record(i) {
                Ok(record) => record,
                Err(e) => {
                    warn!(serial = segment.serial(), index = i, error = %e, "unreadable log record; skipping");
                    continue;
                }
            };
            let key = record.key();

            if record.is_add() {
                if let Some(previous) = self.index.get(&key)? {
                    // A live record from an earlier segment means this is a
                    // re-add whose DEL never made it to disk; journal the
                    // missing DEL now.
                    debug!(serial = segment.serial(), "healing dangling update");
                    self.appender.remove(&previous, true)?;
                    self.index.remove(&key)?;
                    self.last_modified.write().remove(&key);
                    self.checkpoint.forget(&key);
                }

                let first_in_segment = !local.contains_key(&key);
                local.insert(key, (record, i * OP_RECORD_BYTES as u64));
                if first_in_segment {
                    segment.increment();
                }
            } else if record.is_del() {
                local.remove(&key);
                segment.decrement();
            } else {
                warn!(
                    serial = segment.serial(),
                    op = record.op(),
                    "unknown op byte in log; skipping"
                );
            }
        }
        Ok(())
    }

    fn list_segment_serials(&self) -> Result<Vec<u32>> {
        let prefix = format!("{}.", self.name);
        let mut serials = Vec::new();

        let entries = std::fs::read_dir(&self.path)
            .wrap_err_with(|| format!("failed to read store directory '{}'", self.path.display()))?;
        for entry in entries {
            let entry = entry.wrap_err("failed to read store directory entry")?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.ends_with(".log") {
                continue;
            }
            if let Some(rest) = file_name.strip_prefix(&prefix) {
                match rest.parse::<u32>() {
                    Ok(serial) => serials.push(serial),
                    Err(_) => {
                        warn!(file = %file_name, "ignoring file with non-numeric segment suffix")
                    }
                }
            }
        }

        serials.sort_unstable();
        Ok(serials)
    }
}

fn spawn_checker(shared: Arc<StoreShared>) -> (Sender<()>, JoinHandle<()>) {
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

    let handle = std::thread::Builder::new()
        .name("journalkv-check".to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(delay_until_next_check(now_millis())) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = shared.check() {
                        warn!(error = %e, "compaction pass failed");
                    }
                }
            }
        })
        .expect("failed to spawn compaction thread");

    (stop_tx, handle)
}

/// Time until the next half-day boundary (06:00 / 18:00 UTC).
fn delay_until_next_check(now_millis: i64) -> Duration {
    const SIX_HOURS: i64 = HALF_DAY_MILLIS / 2;
    let position = now_millis.rem_euclid(HALF_DAY_MILLIS);
    let mut delay = (SIX_HOURS - position).rem_euclid(HALF_DAY_MILLIS);
    if delay == 0 {
        delay = HALF_DAY_MILLIS;
    }
    Duration::from_millis(delay as u64)
}
