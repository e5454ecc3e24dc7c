//! # Paged Record Container
//!
//! A simple append-oriented persistence mode for variable-length records,
//! independent of the journal store. Records live in an ordered list of
//! capacity-bounded chunk files; a record's address is its absolute
//! container position, stable for the life of the record.
//!
//! ## Layout
//!
//! ```text
//! container_dir/
//! ├── 0          # chunk beginning at position 0
//! ├── 8193       # chunk beginning at position 8193
//! └── 16390      # current appending chunk
//! ```
//!
//! Each chunk file is named by the decimal position where it begins and
//! holds `len:u32be | bytes` records end-to-end. Only the newest chunk
//! accepts appends; when a record does not fit in its remaining capacity
//! the container rolls forward and the next chunk begins at
//! `previous.end + 1`.
//!
//! ## Addressing
//!
//! `get` locates the owning chunk by binary search over the chunk ranges
//! (sorted by begin position) and reads at `position - chunk.begin`.
//!
//! `truncate(position)` drops every chunk strictly newer than the one
//! containing `position`, cuts that chunk so it ends just before
//! `position`, and opens a fresh appending chunk at the truncation point.
//!
//! Not thread-safe; callers wanting concurrent access wrap the container in
//! a lock.

mod chunk;

use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};

use chunk::Chunk;

/// Smallest allowed chunk capacity.
pub const MIN_CHUNK_CAPACITY: u64 = 4096;

pub struct Container {
    dir: PathBuf,
    chunk_capacity: u64,
    /// Newest first; only `chunks[0]` accepts appends.
    chunks: Vec<Chunk>,
}

impl Container {
    /// Opens a container in `dir`, discovering existing chunks by their
    /// numeric file names. The directory is created when absent.
    pub fn open<P: AsRef<Path>>(dir: P, chunk_capacity: u64) -> Result<Self> {
        let dir = dir.as_ref();

        ensure!(
            chunk_capacity >= MIN_CHUNK_CAPACITY,
            "chunk capacity {} is below the minimum {}",
            chunk_capacity,
            MIN_CHUNK_CAPACITY
        );

        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create container directory '{}'", dir.display()))?;

        let mut begins = Vec::new();
        for entry in std::fs::read_dir(dir)
            .wrap_err_with(|| format!("failed to read container directory '{}'", dir.display()))?
        {
            let entry = entry.wrap_err("failed to read container directory entry")?;
            if let Ok(begin) = entry.file_name().to_string_lossy().parse::<u64>() {
                begins.push(begin);
            }
        }
        begins.sort_unstable();

        let mut chunks = Vec::with_capacity(begins.len());
        for begin in begins {
            // Newest first, so the appending chunk sits at index 0.
            chunks.insert(0, Chunk::open(dir, begin, chunk_capacity)?);
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            chunk_capacity,
            chunks,
        })
    }

    /// Appends a record and returns its container position.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        ensure!(
            chunk::RECORD_LEN_BYTES + bytes.len() as u64 <= self.chunk_capacity,
            "record of {} bytes cannot fit any chunk of capacity {}",
            bytes.len(),
            self.chunk_capacity
        );

        if self.chunks.is_empty() {
            self.grow(0)?;
        }

        if let Some(position) = self.chunks[0].try_append(bytes)? {
            return Ok(position);
        }

        // Active chunk is out of room: roll forward and retry there.
        let next_begin = self.chunks[0].end() + 1;
        self.grow(next_begin)?;
        match self.chunks[0].try_append(bytes)? {
            Some(position) => Ok(position),
            None => unreachable!("fresh chunk rejected a record that fits its capacity"),
        }
    }

    /// Reads the record at `position`, or `None` when the position lies
    /// outside every chunk.
    pub fn get(&self, position: u64) -> Result<Option<Vec<u8>>> {
        match self.chunk_index(position) {
            Some(i) => self.chunks[i].get(position).map(Some),
            None => Ok(None),
        }
    }

    /// Removes everything at and after `position`: newer chunks are erased,
    /// the containing chunk is cut to end just before `position`, and a new
    /// appending chunk is opened at the truncation point.
    pub fn truncate(&mut self, position: u64) -> Result<()> {
        let index = match self.chunk_index(position) {
            Some(i) => i,
            None => return Ok(()),
        };

        // Chunks are newest-first: everything before `index` is newer.
        for chunk in self.chunks.drain(..index) {
            chunk.erase()?;
        }
        if position == self.chunks[0].begin() {
            // The cut would leave an empty chunk sharing the new chunk's
            // name; erase it and let grow() recreate the file from scratch.
            self.chunks.remove(0).erase()?;
        } else {
            self.chunks[0].truncate_to(position)?;
        }
        self.grow(position)?;
        Ok(())
    }

    /// Forces the appending chunk to disk.
    pub fn flush(&self) -> Result<()> {
        match self.chunks.first() {
            Some(chunk) => chunk.flush(),
            None => Ok(()),
        }
    }

    /// Iterates all records oldest-first, yielding `(position, bytes)`.
    pub fn iter(&self) -> ContainerIter<'_> {
        let first_begin = self.chunks.last().map(|c| c.begin()).unwrap_or(0);
        ContainerIter {
            container: self,
            position: first_begin,
        }
    }

    /// Flushes the appending chunk and releases every file handle.
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    fn grow(&mut self, begin: u64) -> Result<()> {
        let chunk = Chunk::open(&self.dir, begin, self.chunk_capacity)?;
        self.chunks.insert(0, chunk);
        Ok(())
    }

    /// Binary search over chunk ranges for the chunk containing `position`.
    fn chunk_index(&self, position: u64) -> Option<usize> {
        // Ranges are descending by begin position (newest first).
        let found = self
            .chunks
            .binary_search_by(|chunk| chunk.begin().cmp(&position).reverse());
        let index = match found {
            Ok(i) => i,
            Err(insertion) => {
                // Elements from `insertion` on have a smaller begin; the
                // first of them is the candidate owner.
                if insertion == self.chunks.len() {
                    return None; // before the oldest chunk
                }
                insertion
            }
        };
        let chunk = &self.chunks[index];
        if chunk.is_empty() || position > chunk.end() {
            return None;
        }
        Some(index)
    }
}

pub struct ContainerIter<'a> {
    container: &'a Container,
    position: u64,
}

impl Iterator for ContainerIter<'_> {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.container.chunk_index(self.position);
        let index = match index {
            Some(i) => i,
            None => {
                // Step over the gap a roll-forward leaves between chunks.
                let next = self
                    .container
                    .chunks
                    .iter()
                    .rev()
                    .map(|c| c.begin())
                    .find(|&b| b > self.position)?;
                self.position = next;
                self.container.chunk_index(self.position)?
            }
        };

        match self.container.chunks[index].get(self.position) {
            Ok(bytes) => {
                let position = self.position;
                self.position += chunk::RECORD_LEN_BYTES + bytes.len() as u64;
                Some(Ok((position, bytes)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
