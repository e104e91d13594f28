//! Stratum - the storage-engine core of a disk-oriented relational database
//!
//! The crate implements page-granularity caching and a persistent ordered
//! index on top of it:
//!
//! - **Storage layer** (`storage`): disk I/O and on-page formats
//!   - `DiskManager`: flat byte-addressable page store over a single file
//!   - `DiskScheduler`: background worker funnelling page reads and writes
//!   - `HeaderPage`: index-name to root-page records
//! - **Buffer pool** (`buffer`): memory management for database pages
//!   - `BufferPoolManager`: pins pages in a fixed set of frames, writing
//!     dirty victims back on eviction
//!   - `LruKReplacer`: LRU-K victim selection
//!   - `ReadPageGuard`/`WritePageGuard`: RAII pins that unpin on drop
//! - **Containers** (`container`): `ExtendibleHashTable`, the pool's page
//!   table, growing by bucket splits and directory doubling
//! - **Index** (`index`): `BPlusTree` over fixed-width keys, with point
//!   lookup, ordered iteration over the leaf chain, insert with node
//!   splits, and remove with coalesce/redistribute
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stratum::buffer::BufferPoolManager;
//! use stratum::common::{PageId, RecordId, SlotId};
//! use stratum::index::{BPlusTree, BytewiseComparator, IndexKey};
//! use stratum::storage::disk::DiskManager;
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, 2, disk_manager));
//!
//! let mut tree = BPlusTree::create(
//!     "orders_pk",
//!     Arc::clone(&bpm),
//!     Arc::new(BytewiseComparator),
//!     32,
//!     32,
//! )
//! .unwrap();
//!
//! let record = RecordId::new(PageId::new(100), SlotId::new(0));
//! tree.insert(&IndexKey::from_u64(42), &record).unwrap();
//! assert_eq!(tree.get_value(&IndexKey::from_u64(42)).unwrap(), Some(record));
//! ```

pub mod buffer;
pub mod common;
pub mod container;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{PageId, RecordId, Result, SlotId, StratumError};
