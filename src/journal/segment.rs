//! # Segments
//!
//! A segment is a numbered pair of files: a data file holding value records
//! and a log file journaling the operations that touched them.
//!
//! ```text
//! <root>/<name>.3        8-byte capacity header | len:u32be | bytes | …
//! <root>/<name>.3.log    33-byte OpRecord | OpRecord | …
//! ```
//!
//! Record offsets are body-relative: offset 0 is the first byte after the
//! data file's reserved header. Only the highest-numbered segment accepts
//! appends; all appends come from the single writer thread, while reads may
//! arrive from any thread as positional reads on the shared handles.
//!
//! The segment owns an in-memory reference count: +1 per live ADD journaled
//! in its log, -1 per matching DEL. It is rebuilt by log replay on startup.
//! A segment whose data file has reached its capacity and whose count is
//! zero holds nothing live and is deleted.
//!
//! Write positions are split in two counters: `reserved` advances when an
//! operation is enqueued (callers learn their offset immediately), and
//! `written` trails it as the writer thread lands batches. Batches land in
//! reservation order, so `written` never passes `reserved`.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use eyre::{ensure, Result, WrapErr};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::checkpoint::Checkpoint;
use super::op_record::{OpRecord, OP_RECORD_BYTES};

/// Reserved bytes at the head of every data file (big-endian capacity).
pub const DATA_HEADER_BYTES: u64 = 8;

/// Bytes a value of length `n` occupies in the data file.
pub fn value_record_len(n: usize) -> u64 {
    4 + n as u64
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "unexpected end of file",
                ))
            }
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

pub struct Segment {
    serial: u32,
    data_path: PathBuf,
    log_path: PathBuf,
    data: File,
    log: File,
    capacity: u64,
    force: bool,
    refs: AtomicI32,
    data_reserved: AtomicU64,
    data_written: AtomicU64,
    log_reserved: AtomicU64,
    log_written: AtomicU64,
}

impl Segment {
    /// Opens segment `serial` of store `name` under `root`, creating both
    /// files when absent. A fresh data file gets its capacity header; an
    /// existing one keeps the capacity it was created with.
    pub fn open(root: &Path, name: &str, serial: u32, capacity: u64, force: bool) -> Result<Self> {
        let data_path = root.join(format!("{}.{}", name, serial));
        let log_path = root.join(format!("{}.{}.log", name, serial));

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)
            .wrap_err_with(|| format!("failed to open data file '{}'", data_path.display()))?;

        let mut data_len = data
            .metadata()
            .wrap_err_with(|| format!("failed to stat data file '{}'", data_path.display()))?
            .len();

        let capacity = if data_len == 0 {
            write_all_at(&data, &capacity.to_be_bytes(), 0)
                .wrap_err_with(|| format!("failed to write header to '{}'", data_path.display()))?;
            data_len = DATA_HEADER_BYTES;
            capacity
        } else {
            ensure!(
                data_len >= DATA_HEADER_BYTES,
                "data file '{}' is shorter than its {}-byte header",
                data_path.display(),
                DATA_HEADER_BYTES
            );
            let mut header = [0u8; DATA_HEADER_BYTES as usize];
            read_exact_at(&data, &mut header, 0)
                .wrap_err_with(|| format!("failed to read header of '{}'", data_path.display()))?;
            u64::from_be_bytes(header)
        };

        let log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)
            .wrap_err_with(|| format!("failed to open log file '{}'", log_path.display()))?;

        let log_len = log
            .metadata()
            .wrap_err_with(|| format!("failed to stat log file '{}'", log_path.display()))?
            .len();

        let body = data_len - DATA_HEADER_BYTES;
        Ok(Self {
            serial,
            data_path,
            log_path,
            data,
            log,
            capacity,
            force,
            refs: AtomicI32::new(0),
            data_reserved: AtomicU64::new(body),
            data_written: AtomicU64::new(body),
            log_reserved: AtomicU64::new(log_len),
            log_written: AtomicU64::new(log_len),
        })
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total data file length including the header and reserved tail.
    pub fn data_len(&self) -> u64 {
        DATA_HEADER_BYTES + self.data_reserved.load(Ordering::Acquire)
    }

    pub fn log_record_count(&self) -> u64 {
        self.log_written.load(Ordering::Acquire) / OP_RECORD_BYTES as u64
    }

    // ---- reference counting -------------------------------------------

    pub fn increment(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn ref_count(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_unused(&self) -> bool {
        self.ref_count() <= 0
    }

    // ---- reservation (enqueue side, externally serialized) ------------

    /// Claims space for a value record, returning its body-relative offset.
    pub fn reserve_data(&self, record_len: u64) -> u64 {
        self.data_reserved.fetch_add(record_len, Ordering::AcqRel)
    }

    /// Claims the next log slot, returning its byte offset in the log.
    pub fn reserve_log(&self) -> u64 {
        self.log_reserved
            .fetch_add(OP_RECORD_BYTES as u64, Ordering::AcqRel)
    }

    // ---- appends (writer thread only) ----------------------------------

    pub fn append_data(&self, buf: &[u8]) -> Result<()> {
        let at = self.data_written.load(Ordering::Acquire);
        write_all_at(&self.data, buf, DATA_HEADER_BYTES + at)
            .wrap_err_with(|| format!("failed to append to '{}'", self.data_path.display()))?;
        self.data_written
            .store(at + buf.len() as u64, Ordering::Release);
        Ok(())
    }

    pub fn append_log(&self, buf: &[u8]) -> Result<()> {
        let at = self.log_written.load(Ordering::Acquire);
        write_all_at(&self.log, buf, at)
            .wrap_err_with(|| format!("failed to append to '{}'", self.log_path.display()))?;
        self.log_written
            .store(at + buf.len() as u64, Ordering::Release);
        Ok(())
    }

    pub fn sync_data(&self) -> Result<()> {
        self.data
            .sync_data()
            .wrap_err_with(|| format!("failed to sync '{}'", self.data_path.display()))
    }

    pub fn sync_log(&self) -> Result<()> {
        self.log
            .sync_data()
            .wrap_err_with(|| format!("failed to sync '{}'", self.log_path.display()))
    }

    pub fn force(&self) -> bool {
        self.force
    }

    // ---- reads (any thread) --------------------------------------------

    /// Reads the value record at a body-relative offset, parsing its length
    /// prefix.
    pub fn read_record(&self, offset: u64) -> Result<Vec<u8>> {
        let written = self.data_written.load(Ordering::Acquire);
        ensure!(
            offset + 4 <= written,
            "record offset {} past end of '{}' ({} bytes written)",
            offset,
            self.data_path.display(),
            written
        );

        let mut len_buf = [0u8; 4];
        read_exact_at(&self.data, &mut len_buf, DATA_HEADER_BYTES + offset)
            .wrap_err_with(|| format!("failed to read record length in '{}'", self.data_path.display()))?;
        let len = u32::from_be_bytes(len_buf) as u64;

        ensure!(
            offset + 4 + len <= written,
            "record at {} in '{}' claims {} bytes past the written end",
            offset,
            self.data_path.display(),
            len
        );

        let mut bytes = vec![0u8; len as usize];
        read_exact_at(&self.data, &mut bytes, DATA_HEADER_BYTES + offset + 4)
            .wrap_err_with(|| format!("failed to read record in '{}'", self.data_path.display()))?;
        Ok(bytes)
    }

    /// Reads the `index`-th operation record from the log.
    pub fn read_log_record(&self, index: u64) -> Result<OpRecord> {
        let mut buf = [0u8; OP_RECORD_BYTES];
        read_exact_at(&self.log, &mut buf, index * OP_RECORD_BYTES as u64)
            .wrap_err_with(|| {
                format!(
                    "failed to read log record {} in '{}'",
                    index,
                    self.log_path.display()
                )
            })?;
        OpRecord::from_bytes(&buf)
    }

    /// Modification time of the log file; recovery stamps recovered keys
    /// with it.
    pub fn log_modified_millis(&self) -> Result<u64> {
        let modified = self
            .log
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.log_path.display()))?
            .modified()
            .wrap_err_with(|| format!("no modification time for '{}'", self.log_path.display()))?;
        Ok(modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64)
    }

    /// Unlinks both files. Open handles stay readable until dropped.
    pub fn delete(&self) -> Result<()> {
        debug!(serial = self.serial, "deleting segment files");
        std::fs::remove_file(&self.data_path)
            .wrap_err_with(|| format!("failed to delete '{}'", self.data_path.display()))?;
        std::fs::remove_file(&self.log_path)
            .wrap_err_with(|| format!("failed to delete '{}'", self.log_path.display()))?;
        Ok(())
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn info(&self) -> String {
        format!(
            "segment {} (len {} / cap {}, refs {}, {} log records)",
            self.serial,
            self.data_len(),
            self.capacity,
            self.ref_count(),
            self.log_record_count()
        )
    }
}

/// Shared segment lifecycle state: the registry of open segments and the
/// single active one.
///
/// Both the coordinator and the writer hold this; it is the narrow
/// capability the writer uses to roll segments and retire drained ones,
/// instead of a back-reference to the whole store.
pub struct SegmentRegistry {
    root: PathBuf,
    name: String,
    file_size: u64,
    force: bool,
    max_file_count: AtomicU64,
    segments: RwLock<BTreeMap<u32, Arc<Segment>>>,
    active: RwLock<Option<Arc<Segment>>>,
    checkpoint: Arc<Checkpoint>,
}

impl SegmentRegistry {
    pub fn new(
        root: PathBuf,
        name: String,
        file_size: u64,
        force: bool,
        max_file_count: u64,
        checkpoint: Arc<Checkpoint>,
    ) -> Self {
        Self {
            root,
            name,
            file_size,
            force,
            max_file_count: AtomicU64::new(max_file_count),
            segments: RwLock::new(BTreeMap::new()),
            active: RwLock::new(None),
            checkpoint,
        }
    }

    pub fn open_segment(&self, serial: u32) -> Result<Arc<Segment>> {
        Ok(Arc::new(Segment::open(
            &self.root,
            &self.name,
            serial,
            self.file_size,
            self.force,
        )?))
    }

    pub fn register(&self, segment: Arc<Segment>) {
        self.segments.write().insert(segment.serial(), segment);
    }

    pub fn unregister(&self, serial: u32) -> Option<Arc<Segment>> {
        self.segments.write().remove(&serial)
    }

    pub fn get(&self, serial: u32) -> Option<Arc<Segment>> {
        self.segments.read().get(&serial).cloned()
    }

    pub fn active(&self) -> Result<Arc<Segment>> {
        self.active
            .read()
            .clone()
            .ok_or_else(|| eyre::eyre!("store has no active segment"))
    }

    pub fn set_active(&self, segment: Arc<Segment>) {
        *self.active.write() = Some(segment);
    }

    pub fn clear_active(&self) {
        *self.active.write() = None;
    }

    /// Seals the current active segment and opens the next one.
    pub fn roll(&self) -> Result<Arc<Segment>> {
        let next_serial = self
            .segments
            .read()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            + 1;

        let max = self.max_file_count.load(Ordering::Acquire);
        let count = self.segments.read().len() as u64;
        ensure!(
            count < max,
            "store already holds {} segments of the configured maximum {}",
            count,
            max
        );

        let segment = self.open_segment(next_serial)?;
        info!(serial = next_serial, "opened new segment");
        self.register(segment.clone());
        self.set_active(segment.clone());

        if let Err(e) = self.checkpoint.persist() {
            warn!(error = %e, "failed to persist checkpoint on rollover");
        }
        Ok(segment)
    }

    /// Deletes the segment when it is full, drained, and not active.
    /// Returns whether it was retired.
    pub fn maybe_retire(&self, segment: &Arc<Segment>) -> bool {
        if segment.data_len() < segment.capacity() || !segment.is_unused() {
            return false;
        }
        if let Ok(active) = self.active() {
            if active.serial() == segment.serial() {
                return false;
            }
        }

        self.unregister(segment.serial());
        info!(serial = segment.serial(), "retiring drained segment");
        if let Err(e) = segment.delete() {
            warn!(serial = segment.serial(), error = %e, "failed to delete retired segment");
        }
        true
    }

    pub fn snapshot(&self) -> Vec<Arc<Segment>> {
        self.segments.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    pub fn highest_serial(&self) -> Option<u32> {
        self.segments.read().keys().next_back().copied()
    }

    pub fn clear(&self) {
        self.segments.write().clear();
        self.clear_active();
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn max_file_count(&self) -> u64 {
        self.max_file_count.load(Ordering::Acquire)
    }

    pub fn set_max_file_count(&self, value: u64) {
        self.max_file_count.store(value, Ordering::Release);
    }
}
