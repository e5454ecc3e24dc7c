//! # journalkv — Embedded Key/Value Journal Store
//!
//! journalkv is a persistent, embedded key/value store. Keys are opaque
//! 16-byte fingerprints (typically MD5 digests); values are arbitrary byte
//! strings. Values live in an append-only run of fixed-size data files,
//! each paired with an operation journal, and an in-memory index maps every
//! key to its live record.
//!
//! ## Quick Start
//!
//! ```ignore
//! use journalkv::JournalStore;
//!
//! let store = JournalStore::builder("./data", "messages")
//!     .force(false)
//!     .file_check(true)
//!     .open()?;
//!
//! store.add(&digest, b"payload")?;
//! assert_eq!(store.get(&digest)?.as_deref(), Some(b"payload".as_ref()));
//! store.sync()?;
//! store.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │           Public API (JournalStore)         │
//! ├─────────────────────────────────────────────┤
//! │ In-Memory Index │ Last-Modified │ Checkpoint│
//! ├─────────────────────────────────────────────┤
//! │        Writer Thread (batch + fsync)        │
//! ├─────────────────────────────────────────────┤
//! │    Segments (data file + log file pairs)    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Every mutation is journaled as a fixed 33-byte operation record in the
//! owning segment's log. Recovery replays the logs — bounded by a persisted
//! checkpoint — to rebuild the index and each segment's reference count of
//! live records. A segment whose data file is full and whose count has
//! drained to zero is deleted; a background compaction task migrates old
//! records forward so segments actually drain.
//!
//! ## File Layout
//!
//! ```text
//! store_dir/
//! ├── <name>.1            # data: 8-byte capacity header, then
//! │                       #   len:u32be | value-bytes records
//! ├── <name>.1.log        # journal: 33-byte operation records
//! ├── <name>.2            # active segment (highest serial)
//! ├── <name>.2.log
//! ├── <name>_indexCache   # LRU index spill file (optional)
//! └── checkpoint          # replay bound + live-key locations
//! ```
//!
//! All on-disk integers are big-endian.
//!
//! ## Concurrency Model
//!
//! Reads run concurrently from any thread. Writes enqueue to a single
//! dedicated writer thread, which batches them into one append and at most
//! one fsync per file per batch. `*_sync` calls block until their operation
//! is durable; a successful return covers every earlier enqueued operation
//! as well. Reads of not-yet-flushed values are served from the writer's
//! in-flight buffer.
//!
//! ## Module Overview
//!
//! - [`journal`]: segments, writer thread, checkpoint, store coordinator
//! - [`index`]: in-memory index variants and the file-backed hash table
//! - [`container`]: standalone paged record container
//! - [`key`]: the 16-byte key type

pub mod container;
pub mod index;
pub mod journal;
pub mod key;

pub use container::Container;
pub use index::{HashIndexFile, ItemIndex, LruIndex, MemIndex};
pub use journal::{JournalLocation, JournalStore, JournalStoreBuilder, OpRecord};
pub use key::StoreKey;

/// Current version of journalkv.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
