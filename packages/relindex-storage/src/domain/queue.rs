//! Bulk index queue model
//!
//! A queue entry asks for one record to be (re)indexed or removed from the
//! search index. Enqueueing is idempotent per `(record_id, op)`: while an
//! entry is pending, a second enqueue of the same pair is a no-op.
//!
//! Draining is two-phase. `claim` leases entries without removing them and
//! `ack` drops them once their outcome is settled. A lease that is never
//! acknowledged expires after the queue's lease period and the entry becomes
//! claimable again, so a worker that dies mid-drain loses no work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, StorageError};

/// Seconds a claimed entry stays leased before another drain may take it
pub const DEFAULT_LEASE_SECS: i64 = 300;

/// Index operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOp {
    Index,
    Delete,
}

impl IndexOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexOp::Index => "index",
            IndexOp::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "index" => Ok(IndexOp::Index),
            "delete" => Ok(IndexOp::Delete),
            _ => Err(StorageError::serialization(format!(
                "Invalid index op: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for IndexOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pending index operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub record_id: Uuid,
    pub op: IndexOp,
    pub enqueued_at: DateTime<Utc>,
    /// Failed processing attempts so far
    pub attempts: u32,
    /// Lease handle, set by `claim`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<i64>,
}

impl QueueEntry {
    pub fn new(record_id: Uuid, op: IndexOp) -> Self {
        Self {
            record_id,
            op,
            enqueued_at: Utc::now(),
            attempts: 0,
            ticket: None,
        }
    }

    pub fn index(record_id: Uuid) -> Self {
        Self::new(record_id, IndexOp::Index)
    }

    pub fn delete(record_id: Uuid) -> Self {
        Self::new(record_id, IndexOp::Delete)
    }

    /// Dedup key
    pub fn key(&self) -> (Uuid, IndexOp) {
        (self.record_id, self.op)
    }

    /// Copy of this entry after one more failed attempt
    pub fn failed_attempt(&self) -> Self {
        Self {
            attempts: self.attempts + 1,
            ..self.clone()
        }
    }
}

/// Durable, multi-writer queue of pending index operations
///
/// Appends must be safe under concurrent callers. Draining (`claim`) is
/// expected to be driven by one worker at a time per queue; processing is
/// idempotent, so a double drain costs work but not correctness.
#[async_trait]
pub trait BulkQueue: Send + Sync {
    /// Append entries, skipping pairs already pending
    ///
    /// Leased entries do not count as pending: a record changed while its
    /// previous entry is in flight gets queued again. Returns the number of
    /// entries actually added.
    async fn enqueue(&self, entries: &[QueueEntry]) -> Result<usize>;

    /// Lease up to `max` entries in FIFO order
    ///
    /// Returned entries carry a `ticket` and stay stored until acknowledged.
    async fn claim(&self, max: usize) -> Result<Vec<QueueEntry>>;

    /// Drop leased entries whose processing is settled
    ///
    /// Entries without a ticket are ignored. Returns the number removed.
    async fn ack(&self, entries: &[QueueEntry]) -> Result<usize>;

    /// Replace leased entries by pending copies, keeping their attempt counts
    ///
    /// A pair re-enqueued by someone else in the meantime wins; the retry
    /// is then a no-op for that pair.
    async fn retry(&self, entries: &[QueueEntry]) -> Result<usize> {
        let added = self.enqueue(entries).await?;
        self.ack(entries).await?;
        Ok(added)
    }

    /// Number of pending and leased entries
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
