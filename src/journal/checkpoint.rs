//! # Checkpoint
//!
//! Recovery replays segment logs to rebuild the in-memory index. The
//! checkpoint bounds that replay: it persists, for every live key, the
//! journal location of its most recent ADD. The minimum of those locations
//! is the earliest log position recovery still needs — every record before
//! it is either fully applied or belongs to a key that no longer exists.
//!
//! ## File format
//!
//! ```text
//! magic:[u8;8] | count:u32be | count × (key:[u8;16] | segment:u32be | offset:u64be)
//! ```
//!
//! The file is rewritten whole (write to a temporary, then rename) on clean
//! close, on segment rollover, and after each compaction pass. A missing,
//! truncated, or foreign file degrades to "replay everything" — the
//! checkpoint is an optimization, never a source of truth.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::warn;
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::key::{StoreKey, KEY_BYTES};

const CHECKPOINT_MAGIC: &[u8; 8] = b"jkvckpt\x00";

/// A position in the journal: a segment serial and a byte offset into its
/// log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct JournalLocation {
    pub segment: u32,
    pub offset: u64,
}

impl JournalLocation {
    pub fn new(segment: u32, offset: u64) -> Self {
        Self { segment, offset }
    }

    pub fn start() -> Self {
        Self::new(0, 0)
    }
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct CheckpointEntry {
    key: [u8; KEY_BYTES],
    segment: U32,
    offset: U64,
}

const _: () = assert!(std::mem::size_of::<CheckpointEntry>() == 28);

pub struct Checkpoint {
    path: PathBuf,
    resume: Mutex<HashMap<StoreKey, JournalLocation>>,
}

impl Checkpoint {
    /// Loads the checkpoint at `path`. Unreadable content is discarded with
    /// a warning; the store then replays from the beginning.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let resume = match Self::read_file(&path) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable checkpoint");
                HashMap::new()
            }
        };
        Self {
            path,
            resume: Mutex::new(resume),
        }
    }

    fn read_file(path: &Path) -> Result<HashMap<StoreKey, JournalLocation>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(e).wrap_err_with(|| format!("failed to read '{}'", path.display()))
            }
        };

        eyre::ensure!(
            bytes.len() >= CHECKPOINT_MAGIC.len() + 4 && bytes.starts_with(CHECKPOINT_MAGIC),
            "not a checkpoint file"
        );

        let mut cursor = CHECKPOINT_MAGIC.len();
        let count = u32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;

        let entry_len = std::mem::size_of::<CheckpointEntry>();
        eyre::ensure!(
            bytes.len() == cursor + count * entry_len,
            "checkpoint claims {} entries but holds {} bytes",
            count,
            bytes.len() - cursor
        );

        let mut map = HashMap::with_capacity(count);
        for _ in 0..count {
            let entry = CheckpointEntry::read_from_bytes(&bytes[cursor..cursor + entry_len])
                .map_err(|e| eyre::eyre!("invalid checkpoint entry: {:?}", e))?;
            map.insert(
                StoreKey::new(entry.key),
                JournalLocation::new(entry.segment.get(), entry.offset.get()),
            );
            cursor += entry_len;
        }
        Ok(map)
    }

    /// Records the latest ADD location of a live key.
    pub fn record(&self, key: StoreKey, location: JournalLocation) {
        self.resume.lock().insert(key, location);
    }

    /// Drops a key whose record was removed.
    pub fn forget(&self, key: &StoreKey) {
        self.resume.lock().remove(key);
    }

    pub fn clear(&self) {
        self.resume.lock().clear();
    }

    /// Earliest location replay must start from, or `None` when no live key
    /// is tracked (replay everything — or nothing, if the logs agree).
    pub fn replay_start(&self) -> Option<JournalLocation> {
        self.resume.lock().values().min().copied()
    }

    pub fn tracked_keys(&self) -> usize {
        self.resume.lock().len()
    }

    /// Persists the resume map atomically (temporary file + rename).
    pub fn persist(&self) -> Result<()> {
        let entries: Vec<CheckpointEntry> = {
            let resume = self.resume.lock();
            resume
                .iter()
                .map(|(key, loc)| CheckpointEntry {
                    key: *key.as_bytes(),
                    segment: U32::new(loc.segment),
                    offset: U64::new(loc.offset),
                })
                .collect()
        };

        let mut bytes =
            Vec::with_capacity(CHECKPOINT_MAGIC.len() + 4 + entries.len() * std::mem::size_of::<CheckpointEntry>());
        bytes.extend_from_slice(CHECKPOINT_MAGIC);
        bytes.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for entry in &entries {
            bytes.extend_from_slice(entry.as_bytes());
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)
            .wrap_err_with(|| format!("failed to write '{}'", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .wrap_err_with(|| format!("failed to replace '{}'", self.path.display()))?;
        Ok(())
    }
}
