//! # Operation Records
//!
//! Every mutation of the store is journaled as a fixed-layout operation
//! record in the segment's log file. The record is 33 bytes:
//!
//! ```text
//! +----+------------------+-------------+------------+---------+
//! | op | key (16 bytes)   | segment u32 | offset u64 | len u32 |
//! +----+------------------+-------------+------------+---------+
//! ```
//!
//! - `op`: 1 = ADD, 2 = DEL. An update is journaled as an ADD of the new
//!   revision followed by a DEL of the old one.
//! - `segment`: serial number of the data file holding the value.
//! - `offset`: body-relative offset of the value record (its length prefix)
//!   inside that data file.
//! - `len`: length of the value bytes. A DEL copies the fields of the ADD it
//!   cancels; replay never interprets `len`, only (`op`, `key`, `segment`).
//!
//! All multi-byte integers on disk are big-endian, matching the journal
//! format's convention throughout the crate.

use eyre::{ensure, Result};
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::key::{StoreKey, KEY_BYTES};

/// On-disk size of one operation record.
pub const OP_RECORD_BYTES: usize = 33;

pub const OP_ADD: u8 = 1;
pub const OP_DEL: u8 = 2;

/// One journaled operation. The struct is its own on-disk codec.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct OpRecord {
    op: u8,
    key: [u8; KEY_BYTES],
    segment: U32,
    offset: U64,
    len: U32,
}

const _: () = assert!(std::mem::size_of::<OpRecord>() == OP_RECORD_BYTES);

impl OpRecord {
    pub fn add(key: StoreKey, segment: u32, offset: u64, len: u32) -> Self {
        Self {
            op: OP_ADD,
            key: *key.as_bytes(),
            segment: U32::new(segment),
            offset: U64::new(offset),
            len: U32::new(len),
        }
    }

    /// Builds the DEL record cancelling `add`; every positional field is
    /// copied so the log names the exact record being dropped.
    pub fn del_for(add: &OpRecord) -> Self {
        Self {
            op: OP_DEL,
            key: add.key,
            segment: add.segment,
            offset: add.offset,
            len: add.len,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= OP_RECORD_BYTES,
            "buffer too small for OpRecord: {} < {}",
            bytes.len(),
            OP_RECORD_BYTES
        );

        OpRecord::read_from_bytes(&bytes[..OP_RECORD_BYTES])
            .map_err(|e| eyre::eyre!("failed to parse OpRecord: {:?}", e))
    }

    pub fn op(&self) -> u8 {
        self.op
    }

    pub fn is_add(&self) -> bool {
        self.op == OP_ADD
    }

    pub fn is_del(&self) -> bool {
        self.op == OP_DEL
    }

    pub fn key(&self) -> StoreKey {
        StoreKey::new(self.key)
    }

    pub fn segment(&self) -> u32 {
        self.segment.get()
    }

    pub fn offset(&self) -> u64 {
        self.offset.get()
    }

    pub fn len(&self) -> u32 {
        self.len.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_record_is_33_bytes() {
        assert_eq!(std::mem::size_of::<OpRecord>(), OP_RECORD_BYTES);
    }

    #[test]
    fn round_trips_through_bytes() {
        let key = StoreKey::new([0x5a; 16]);
        let rec = OpRecord::add(key, 3, 0x1122334455, 77);

        let parsed = OpRecord::from_bytes(rec.as_bytes()).unwrap();

        assert!(parsed.is_add());
        assert_eq!(parsed.key(), key);
        assert_eq!(parsed.segment(), 3);
        assert_eq!(parsed.offset(), 0x1122334455);
        assert_eq!(parsed.len(), 77);
    }

    #[test]
    fn encodes_big_endian() {
        let rec = OpRecord::add(StoreKey::new([0; 16]), 1, 2, 3);
        let bytes = rec.as_bytes();

        assert_eq!(bytes[0], OP_ADD);
        assert_eq!(&bytes[17..21], &[0, 0, 0, 1]);
        assert_eq!(&bytes[21..29], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(&bytes[29..33], &[0, 0, 0, 3]);
    }

    #[test]
    fn del_copies_positional_fields() {
        let add = OpRecord::add(StoreKey::new([9; 16]), 4, 4096, 10);
        let del = OpRecord::del_for(&add);

        assert!(del.is_del());
        assert_eq!(del.key(), add.key());
        assert_eq!(del.segment(), add.segment());
        assert_eq!(del.offset(), add.offset());
        assert_eq!(del.len(), add.len());
    }

    #[test]
    fn from_bytes_rejects_short_buffer() {
        assert!(OpRecord::from_bytes(&[0u8; 32]).is_err());
    }
}
