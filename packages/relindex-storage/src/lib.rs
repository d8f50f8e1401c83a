//! relindex-storage - authoritative record store and bulk index queue
//!
//! ## Core Principles
//!
//! 1. **Store is the source of truth**: the search index is derived and may lag
//! 2. **Stable join key**: a record's internal `id` never changes, its `pid` is
//!    what relation stubs refer to
//! 3. **Revisions**: every committed mutation bumps `revision_id`; commits are
//!    optimistic on it
//! 4. **Idempotent queue**: pending `(record_id, op)` pairs are deduplicated
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relindex_storage::{BulkQueue, InMemoryBulkQueue, QueueEntry, Record, RecordStore};
//!
//! let store = InMemoryRecordStore::new("mock-records");
//! let record = store.insert(Record::new("mock-records", Record::mint_pid(), metadata)).await?;
//!
//! let queue = InMemoryBulkQueue::new();
//! queue.enqueue(&[QueueEntry::index(record.id)]).await?;
//! let batch = queue.claim(100).await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{BulkQueue, IndexOp, QueueEntry, Record, RecordStore, DEFAULT_LEASE_SECS};

pub use infrastructure::{InMemoryBulkQueue, InMemoryRecordStore};

#[cfg(feature = "sqlite")]
pub use infrastructure::{SqliteBulkQueue, SqliteRecordStore};
