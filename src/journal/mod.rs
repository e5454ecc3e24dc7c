//! # Journal Store
//!
//! The journal store keeps values in an append-only run of fixed-size
//! segments, each a `(data file, log file)` pair, coordinated by
//! [`JournalStore`]:
//!
//! - [`op_record`]: the 33-byte operation record journaled for every
//!   mutation.
//! - [`segment`]: the segment pair, its reference count, and the registry
//!   tracking the open set and the active segment.
//! - [`appender`]: the single writer thread batching appends and fsyncs.
//! - [`checkpoint`]: the persisted replay bound for recovery.
//! - [`store`]: the coordinator tying it together — public API, recovery,
//!   rollover, and background compaction.

pub mod appender;
pub mod checkpoint;
pub mod op_record;
pub mod segment;
pub mod store;

pub use appender::{Appender, InFlyWrites, MAX_BATCH_SIZE};
pub use checkpoint::{Checkpoint, JournalLocation};
pub use op_record::{OpRecord, OP_ADD, OP_DEL, OP_RECORD_BYTES};
pub use segment::{Segment, SegmentRegistry, DATA_HEADER_BYTES};
pub use store::{JournalStore, JournalStoreBuilder};

/// Default capacity of a segment data file.
pub const FILE_SIZE: u64 = 64 * 1024 * 1024;

pub const HALF_DAY_MILLIS: i64 = 12 * 60 * 60 * 1000;

/// Default age after which a record is migrated out of its segment.
pub const INTERVAL_FOR_COMPACT: i64 = HALF_DAY_MILLIS;

/// Default age after which a record is dropped outright.
pub const INTERVAL_FOR_REMOVE: i64 = HALF_DAY_MILLIS * 2 * 7;
