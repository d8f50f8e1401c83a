//! In-memory adapters
//!
//! HashMap/VecDeque backed implementations for tests and embedded use.
//! Nothing survives the process.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{BulkQueue, IndexOp, QueueEntry, Record, RecordStore, DEFAULT_LEASE_SECS};
use crate::error::{ErrorKind, Result, StorageError};

#[derive(Default)]
struct RecordTable {
    by_id: HashMap<Uuid, Record>,
    pid_index: HashMap<String, Uuid>,
}

/// In-memory record store
#[derive(Clone)]
pub struct InMemoryRecordStore {
    record_type: String,
    table: Arc<RwLock<RecordTable>>,
}

impl InMemoryRecordStore {
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            table: Arc::new(RwLock::new(RecordTable::default())),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    fn record_type(&self) -> &str {
        &self.record_type
    }

    async fn insert(&self, mut record: Record) -> Result<Record> {
        if record.record_type != self.record_type {
            return Err(StorageError::new(
                ErrorKind::Config,
                format!(
                    "Record type {} does not belong in store {}",
                    record.record_type, self.record_type
                ),
            ));
        }

        let mut table = self.table.write();
        if table.pid_index.contains_key(&record.pid) {
            return Err(StorageError::already_exists(record.pid));
        }
        if table.by_id.contains_key(&record.id) {
            return Err(StorageError::already_exists(record.id.to_string()));
        }

        record.revision_id = 1;
        table.pid_index.insert(record.pid.clone(), record.id);
        table.by_id.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Record>> {
        Ok(self.table.read().by_id.get(&id).cloned())
    }

    async fn resolve(&self, pid: &str) -> Result<Record> {
        let table = self.table.read();
        table
            .pid_index
            .get(pid)
            .and_then(|id| table.by_id.get(id))
            .cloned()
            .ok_or_else(|| StorageError::not_found(pid))
    }

    async fn commit(&self, mut record: Record) -> Result<Record> {
        let mut table = self.table.write();
        let stored = table
            .by_id
            .get_mut(&record.id)
            .ok_or_else(|| StorageError::not_found(record.pid.clone()))?;

        if stored.revision_id != record.revision_id {
            return Err(StorageError::revision_conflict(
                &record.pid,
                record.revision_id,
                stored.revision_id,
            ));
        }

        record.revision_id += 1;
        record.updated = Utc::now();
        *stored = record.clone();
        Ok(record)
    }

    async fn delete(&self, record: &Record) -> Result<Record> {
        let mut table = self.table.write();
        let mut removed = table
            .by_id
            .remove(&record.id)
            .ok_or_else(|| StorageError::not_found(record.pid.clone()))?;
        table.pid_index.remove(&removed.pid);

        removed.revision_id += 1;
        removed.updated = Utc::now();
        Ok(removed)
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>> {
        let table = self.table.read();
        let mut records: Vec<&Record> = table.by_id.values().collect();
        records.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        Ok(records.into_iter().map(|r| r.id).collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.table.read().by_id.len())
    }
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    pending: HashSet<(Uuid, IndexOp)>,
    leased: BTreeMap<i64, (QueueEntry, DateTime<Utc>)>,
    next_ticket: i64,
}

/// In-memory bulk queue
#[derive(Clone)]
pub struct InMemoryBulkQueue {
    state: Arc<Mutex<QueueState>>,
    lease: Duration,
}

impl InMemoryBulkQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            lease: Duration::seconds(DEFAULT_LEASE_SECS),
        }
    }

    /// Set how long a claimed entry stays leased
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

impl Default for InMemoryBulkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BulkQueue for InMemoryBulkQueue {
    async fn enqueue(&self, entries: &[QueueEntry]) -> Result<usize> {
        let mut state = self.state.lock();
        let mut added = 0;
        for entry in entries {
            if state.pending.insert(entry.key()) {
                state.entries.push_back(QueueEntry {
                    ticket: None,
                    ..entry.clone()
                });
                added += 1;
            }
        }
        Ok(added)
    }

    async fn claim(&self, max: usize) -> Result<Vec<QueueEntry>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = Utc::now();
        let cutoff = now - self.lease;

        // Expired leases first
        let mut claimed: Vec<QueueEntry> = Vec::new();
        for (entry, leased_at) in state.leased.values_mut() {
            if claimed.len() == max {
                break;
            }
            if *leased_at <= cutoff {
                *leased_at = now;
                claimed.push(entry.clone());
            }
        }

        while claimed.len() < max {
            let Some(mut entry) = state.entries.pop_front() else {
                break;
            };
            state.pending.remove(&entry.key());
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            entry.ticket = Some(ticket);
            state.leased.insert(ticket, (entry.clone(), now));
            claimed.push(entry);
        }
        Ok(claimed)
    }

    async fn ack(&self, entries: &[QueueEntry]) -> Result<usize> {
        let mut state = self.state.lock();
        Ok(entries
            .iter()
            .filter_map(|entry| entry.ticket)
            .filter(|ticket| state.leased.remove(ticket).is_some())
            .count())
    }

    async fn len(&self) -> Result<usize> {
        let state = self.state.lock();
        Ok(state.entries.len() + state.leased.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pid: &str) -> Record {
        Record::new("mock-records", pid, json!({"title": pid}))
    }

    #[tokio::test]
    async fn test_insert_and_resolve() {
        let store = InMemoryRecordStore::new("mock-records");

        let inserted = store.insert(record("aaaaa-00001")).await.unwrap();
        assert_eq!(inserted.revision_id, 1);

        let resolved = store.resolve("aaaaa-00001").await.unwrap();
        assert_eq!(resolved.id, inserted.id);
        assert_eq!(store.get(inserted.id).await.unwrap(), Some(inserted));
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates_and_foreign_types() {
        let store = InMemoryRecordStore::new("mock-records");
        store.insert(record("aaaaa-00001")).await.unwrap();

        let err = store.insert(record("aaaaa-00001")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);

        let foreign = Record::new("other", "bbbbb-00002", json!({}));
        let err = store.insert(foreign).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_commit_increments_revision() {
        let store = InMemoryRecordStore::new("mock-records");
        let mut rec = store.insert(record("aaaaa-00001")).await.unwrap();

        rec.metadata = json!({"title": "new title"});
        let committed = store.commit(rec).await.unwrap();
        assert_eq!(committed.revision_id, 2);

        let stored = store.resolve("aaaaa-00001").await.unwrap();
        assert_eq!(stored.metadata["title"], "new title");
        assert_eq!(stored.revision_id, 2);
    }

    #[tokio::test]
    async fn test_commit_detects_stale_revision() {
        let store = InMemoryRecordStore::new("mock-records");
        let rec = store.insert(record("aaaaa-00001")).await.unwrap();

        store.commit(rec.clone()).await.unwrap();
        let err = store.commit(rec).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RevisionConflict);
    }

    #[tokio::test]
    async fn test_delete_removes_pid() {
        let store = InMemoryRecordStore::new("mock-records");
        let rec = store.insert(record("aaaaa-00001")).await.unwrap();

        let deleted = store.delete(&rec).await.unwrap();
        assert_eq!(deleted.revision_id, 2);
        assert!(store.resolve("aaaaa-00001").await.unwrap_err().is_not_found());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_dedup_and_fifo() {
        let queue = InMemoryBulkQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let added = queue
            .enqueue(&[QueueEntry::index(a), QueueEntry::index(b), QueueEntry::index(a)])
            .await
            .unwrap();
        assert_eq!(added, 2);

        // Same id, different op is a distinct entry
        assert_eq!(queue.enqueue(&[QueueEntry::delete(a)]).await.unwrap(), 1);
        assert_eq!(queue.len().await.unwrap(), 3);

        let claimed = queue.claim(2).await.unwrap();
        assert_eq!(claimed[0].key(), (a, IndexOp::Index));
        assert_eq!(claimed[1].key(), (b, IndexOp::Index));

        // Leased entries stay counted until acknowledged
        assert_eq!(queue.len().await.unwrap(), 3);
        assert_eq!(queue.ack(&claimed).await.unwrap(), 2);
        assert_eq!(queue.len().await.unwrap(), 1);

        // Claimed entries can be enqueued again
        assert_eq!(queue.enqueue(&[QueueEntry::index(a)]).await.unwrap(), 1);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unacked_lease_expires() {
        let queue = InMemoryBulkQueue::new();
        let a = Uuid::new_v4();
        queue.enqueue(&[QueueEntry::index(a)]).await.unwrap();

        let first = queue.claim(10).await.unwrap();
        assert_eq!(first.len(), 1);
        // Still leased under the default period
        assert!(queue.claim(10).await.unwrap().is_empty());

        let expired = queue.clone().with_lease(Duration::zero());
        let again = expired.claim(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].ticket, first[0].ticket);

        assert_eq!(expired.ack(&again).await.unwrap(), 1);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_while_leased_keeps_both() {
        let queue = InMemoryBulkQueue::new();
        let a = Uuid::new_v4();
        queue.enqueue(&[QueueEntry::index(a)]).await.unwrap();
        let leased = queue.claim(1).await.unwrap();

        assert_eq!(queue.enqueue(&[QueueEntry::index(a)]).await.unwrap(), 1);
        assert_eq!(queue.retry(&[leased[0].failed_attempt()]).await.unwrap(), 0);
        assert_eq!(queue.len().await.unwrap(), 1);

        let next = queue.claim(1).await.unwrap();
        assert_eq!(next[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_queue_concurrent_writers() {
        let queue = InMemoryBulkQueue::new();
        let ids: Vec<Uuid> = (0..50).map(|_| Uuid::new_v4()).collect();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let ids = ids.clone();
            handles.push(tokio::spawn(async move {
                let entries: Vec<QueueEntry> = ids.into_iter().map(QueueEntry::index).collect();
                queue.enqueue(&entries).await.unwrap()
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 50);
        assert_eq!(queue.len().await.unwrap(), 50);
    }
}
