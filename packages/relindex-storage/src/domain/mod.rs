//! Domain layer for the record store
//!
//! # Domain Models
//!
//! - `Record`: an authoritative record with a persistent identifier (pid),
//!   a stable internal id and a revision counter
//! - `QueueEntry`: a pending index operation (see [`queue`])
//!
//! # Port Traits
//!
//! - `RecordStore`: authoritative storage of records of one type
//! - `BulkQueue`: durable queue of pending index operations
//!
//! # Examples
//!
//! ```rust,ignore
//! use relindex_storage::{Record, RecordStore};
//!
//! async fn example(store: impl RecordStore) -> Result<()> {
//!     let record = Record::new("mock-records", Record::mint_pid(), json!({"title": "A"}));
//!     let record = store.insert(record).await?;
//!     assert_eq!(record.revision_id, 1);
//!
//!     let mut record = store.resolve(&record.pid).await?;
//!     record.metadata = json!({"title": "B"});
//!     let record = store.commit(record).await?;
//!     assert_eq!(record.revision_id, 2);
//!     Ok(())
//! }
//! ```

pub mod queue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

pub use queue::{BulkQueue, IndexOp, QueueEntry, DEFAULT_LEASE_SECS};

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// Authoritative record
///
/// # Identity
///
/// - `pid`: external persistent identifier, what clients and relation
///   stubs refer to
/// - `id`: internal id, stable for the lifetime of the record and used as
///   the join key inside the search index
///
/// `revision_id` is 0 until the record is inserted, then incremented by
/// every committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub pid: String,
    pub id: Uuid,
    pub record_type: String,
    pub revision_id: u64,
    /// Arbitrary JSON object; may contain relation stubs (`{"id": pid}`)
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Record {
    /// Create a new, not yet stored record
    pub fn new(
        record_type: impl Into<String>,
        pid: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            pid: pid.into(),
            id: Uuid::new_v4(),
            record_type: record_type.into(),
            revision_id: 0,
            metadata,
            created: now,
            updated: now,
        }
    }

    /// Mint a random persistent identifier of the form `abcde-12345`
    pub fn mint_pid() -> String {
        let raw = Uuid::new_v4().simple().to_string();
        format!("{}-{}", &raw[..5], &raw[5..10])
    }

    /// `<id>::<revision>` stamp identifying this exact state of the record
    pub fn version_stamp(&self) -> String {
        format!("{}::{}", self.id, self.revision_id)
    }

    /// Whether the record has been persisted at least once
    pub fn is_persisted(&self) -> bool {
        self.revision_id > 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: RecordStore
// ═══════════════════════════════════════════════════════════════════════════

/// Authoritative record storage for one record type
///
/// # Core Operations
///
/// - `insert`: persist a new record (revision becomes 1)
/// - `commit`: persist a mutation (revision + 1), optimistic on revision
/// - `delete`: remove a record (returned copy carries revision + 1)
/// - `resolve` / `get`: lookup by pid / internal id
/// - `list_ids`: every stored id, for full reindexing
///
/// # Implementations
///
/// - `InMemoryRecordStore`: tests and embedded use
/// - `SqliteRecordStore`: file-backed persistence
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Record type served by this store
    fn record_type(&self) -> &str;

    /// Insert a new record
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if the pid or id is taken
    /// - `Config` if the record type does not match the store
    async fn insert(&self, record: Record) -> Result<Record>;

    /// Get a record by internal id
    async fn get(&self, id: Uuid) -> Result<Option<Record>>;

    /// Resolve a record by persistent identifier
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no record carries the pid
    async fn resolve(&self, pid: &str) -> Result<Record>;

    /// Commit a mutated record
    ///
    /// The record's `revision_id` must equal the stored revision.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the record is not stored
    /// - `RevisionConflict` if another commit happened in between
    async fn commit(&self, record: Record) -> Result<Record>;

    /// Delete a record
    async fn delete(&self, record: &Record) -> Result<Record>;

    /// All stored ids, ordered by creation
    async fn list_ids(&self) -> Result<Vec<Uuid>>;

    /// Number of stored records
    async fn count(&self) -> Result<usize>;
}
