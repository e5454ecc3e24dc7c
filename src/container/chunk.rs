//! One capacity-bounded chunk file of the paged record container.
//!
//! A chunk is named by the decimal container position where it begins, and
//! holds length-prefixed records laid end-to-end with no header:
//!
//! ```text
//! <dir>/0        len:u32be | bytes | len:u32be | bytes | …
//! <dir>/4097     …
//! ```
//!
//! Container positions are global: a record at position `p` lives in the
//! chunk whose range `[begin, end]` contains `p`, at file offset
//! `p - begin`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};

/// Length prefix of every record.
pub(crate) const RECORD_LEN_BYTES: u64 = 4;

pub(crate) struct Chunk {
    path: PathBuf,
    begin: u64,
    capacity: u64,
    file: File,
    len: u64,
}

impl Chunk {
    /// Opens the chunk beginning at container position `begin`, creating its
    /// file when absent. An existing file keeps its current content length.
    pub fn open(dir: &Path, begin: u64, capacity: u64) -> Result<Self> {
        let path = dir.join(begin.to_string());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open chunk file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat chunk file '{}'", path.display()))?
            .len();

        ensure!(
            len <= capacity,
            "chunk file '{}' is {} bytes, larger than its capacity {}",
            path.display(),
            len,
            capacity
        );

        Ok(Self {
            path,
            begin,
            capacity,
            file,
            len,
        })
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    /// Container position of the last written byte.
    pub fn end(&self) -> u64 {
        self.begin + self.len.saturating_sub(1)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends one record, returning its container position, or `None` when
    /// the record does not fit in the remaining capacity (the container
    /// rolls to a fresh chunk on `None`).
    pub fn try_append(&mut self, bytes: &[u8]) -> Result<Option<u64>> {
        let record_len = RECORD_LEN_BYTES + bytes.len() as u64;
        if self.len + record_len > self.capacity {
            return Ok(None);
        }

        self.file
            .seek(SeekFrom::Start(self.len))
            .wrap_err_with(|| format!("failed to seek chunk '{}'", self.path.display()))?;
        self.file
            .write_all(&(bytes.len() as u32).to_be_bytes())
            .wrap_err_with(|| format!("failed to write record length to '{}'", self.path.display()))?;
        self.file
            .write_all(bytes)
            .wrap_err_with(|| format!("failed to write record to '{}'", self.path.display()))?;

        let position = self.begin + self.len;
        self.len += record_len;
        Ok(Some(position))
    }

    /// Reads the record at container position `position`.
    pub fn get(&self, position: u64) -> Result<Vec<u8>> {
        ensure!(
            position >= self.begin && position < self.begin + self.len,
            "position {} outside chunk range [{}, {}]",
            position,
            self.begin,
            self.end()
        );

        let file_offset = position - self.begin;
        ensure!(
            file_offset + RECORD_LEN_BYTES <= self.len,
            "record length prefix at {} extends past chunk end",
            position
        );

        let mut file = &self.file;
        file.seek(SeekFrom::Start(file_offset))
            .wrap_err_with(|| format!("failed to seek chunk '{}'", self.path.display()))?;

        let mut len_buf = [0u8; RECORD_LEN_BYTES as usize];
        file.read_exact(&mut len_buf)
            .wrap_err_with(|| format!("failed to read record length in '{}'", self.path.display()))?;
        let record_len = u32::from_be_bytes(len_buf) as u64;

        ensure!(
            file_offset + RECORD_LEN_BYTES + record_len <= self.len,
            "record at {} claims {} bytes but chunk holds {}",
            position,
            record_len,
            self.len - file_offset - RECORD_LEN_BYTES
        );

        let mut bytes = vec![0u8; record_len as usize];
        file.read_exact(&mut bytes)
            .wrap_err_with(|| format!("failed to read record in '{}'", self.path.display()))?;
        Ok(bytes)
    }

    /// Cuts the chunk so its content ends just before container position
    /// `position`.
    pub fn truncate_to(&mut self, position: u64) -> Result<()> {
        ensure!(
            position >= self.begin && position <= self.begin + self.len,
            "truncate position {} outside chunk range [{}, {}]",
            position,
            self.begin,
            self.begin + self.len
        );

        let new_len = position - self.begin;
        self.file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to truncate chunk '{}'", self.path.display()))?;
        self.len = new_len;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync chunk '{}'", self.path.display()))
    }

    /// Deletes the chunk file. The chunk must not be used afterwards.
    pub fn erase(self) -> Result<()> {
        std::fs::remove_file(&self.path)
            .wrap_err_with(|| format!("failed to delete chunk '{}'", self.path.display()))
    }
}
