//! Record indexer and bulk queue processing
//!
//! Store records become index documents here. Direct writes (`index`,
//! `delete`) go straight to the search index; everything else goes through
//! the durable bulk queue and is applied by `process_bulk_queue`, usually
//! from the [`BulkIndexWorker`](crate::worker::BulkIndexWorker).
//!
//! # Failed entries
//!
//! Every failed entry is counted in [`BulkOutcome::failed`]. After the
//! drain it is either put back with one more attempt, or dead-lettered
//! (logged at `error` and dropped) when the failure is permanent or the
//! attempt budget is spent. An `index` entry whose record is gone from the
//! store is turned into a delete.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use relindex_storage::{BulkQueue, IndexOp, QueueEntry, Record, RecordStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::IndexerConfig;
use crate::context::Identity;
use crate::error::{ErrorCategory, Result, SyncError};
use crate::index::{BulkAction, BulkItemResult, SearchIndex};
use crate::query::Query;
use crate::relations::RelationResolver;

/// Field holding the time a document was written
pub const INDEXED_AT_FIELD: &str = "indexed_at";

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Result of one queue drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// Failed entries put back on the queue
    pub retried: usize,
    /// Failed entries dropped for good
    pub dead_lettered: usize,
}

impl BulkOutcome {
    /// `(succeeded, failed)`
    pub fn as_tuple(&self) -> (usize, usize) {
        (self.succeeded, self.failed)
    }
}

/// Turns resolved record projections into index documents
pub struct DocumentBuilder;

impl DocumentBuilder {
    pub fn build(projection: &Record, indexed_at: DateTime<Utc>) -> Value {
        json!({
            "uuid": projection.id.to_string(),
            "pid": projection.pid,
            "record_type": projection.record_type,
            "revision_id": projection.revision_id,
            "created": format_timestamp(&projection.created),
            "updated": format_timestamp(&projection.updated),
            INDEXED_AT_FIELD: format_timestamp(&indexed_at),
            "metadata": projection.metadata,
        })
    }
}

/// Something that can refresh the documents matched by a query
#[async_trait]
pub trait Reindex: Send + Sync {
    /// Schedule matching documents for reindexing; returns how many matched
    async fn reindex(&self, identity: &Identity, query: &Query) -> Result<usize>;
}

/// Indexer for one record type
pub struct RecordIndexer {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn BulkQueue>,
    index: Arc<dyn SearchIndex>,
    resolver: Arc<RelationResolver>,
    config: IndexerConfig,
}

impl RecordIndexer {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn BulkQueue>,
        index: Arc<dyn SearchIndex>,
        resolver: Arc<RelationResolver>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            index,
            resolver,
            config,
        }
    }

    pub fn search_index(&self) -> &Arc<dyn SearchIndex> {
        &self.index
    }

    pub fn queue(&self) -> &Arc<dyn BulkQueue> {
        &self.queue
    }

    /// Index one record now
    pub async fn index(&self, record: &Record) -> Result<()> {
        let projection = self.resolver.resolve(record).await;
        let action = BulkAction::Index {
            id: record.id,
            document: DocumentBuilder::build(&projection, Utc::now()),
        };
        let results = self.index.bulk(vec![action]).await?;
        single_result(results, record.id)
    }

    /// Remove one record from the index now
    pub async fn delete(&self, record: &Record) -> Result<()> {
        let results = self
            .index
            .bulk(vec![BulkAction::Delete { id: record.id }])
            .await?;
        single_result(results, record.id)
    }

    /// Append entries to the bulk queue; returns the number newly queued
    pub async fn bulk_queue<I>(&self, ids: I, op: IndexOp) -> Result<usize>
    where
        I: IntoIterator<Item = Uuid>,
    {
        let entries: Vec<QueueEntry> = ids
            .into_iter()
            .map(|id| QueueEntry::new(id, op))
            .collect();
        if entries.is_empty() {
            return Ok(0);
        }

        let added = self.queue.enqueue(&entries).await?;
        debug!(
            record_type = self.store.record_type(),
            op = %op,
            requested = entries.len(),
            added,
            "Bulk queue updated"
        );
        Ok(added)
    }

    /// Queue every stored record for indexing
    pub async fn rebuild(&self) -> Result<usize> {
        let ids = self.store.list_ids().await?;
        let total = ids.len();
        self.bulk_queue(ids, IndexOp::Index).await?;
        info!(
            record_type = self.store.record_type(),
            total, "Full reindex queued"
        );
        Ok(total)
    }

    /// Drain the bulk queue into the index
    ///
    /// Entries are acknowledged only once written or settled, so a drain cut
    /// short leaves its leased entries to be picked up again after the lease
    /// expires. Entries queued while the drain runs wait for the next one.
    ///
    /// # Errors
    ///
    /// `DrainInterrupted` when claiming or settling fails part way; the
    /// error carries the counts of the work already done.
    pub async fn process_bulk_queue(&self) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        let mut failures: Vec<(QueueEntry, ErrorCategory)> = Vec::new();
        let mut interrupted: Option<SyncError> = None;

        let budget = self.queue.len().await?;
        let mut seen = 0;

        while seen < budget {
            let want = self.config.bulk_chunk_size.min(budget - seen);
            let batch = match self.queue.claim(want).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, claimed = seen, "Claiming bulk queue entries failed");
                    interrupted = Some(e.into());
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            seen += batch.len();

            let prepared = join_all(batch.iter().map(|entry| self.prepare(entry))).await;

            let mut actions = Vec::with_capacity(batch.len());
            let mut in_flight = Vec::with_capacity(batch.len());
            for (entry, action) in batch.into_iter().zip(prepared) {
                match action {
                    Ok(action) => {
                        actions.push(action);
                        in_flight.push(entry);
                    }
                    Err(e) => {
                        warn!(record_id = %entry.record_id, error = %e, "Could not build index action");
                        failures.push((entry, e.category()));
                    }
                }
            }
            if actions.is_empty() {
                continue;
            }

            let mut written = Vec::with_capacity(in_flight.len());
            match self.index.bulk(actions).await {
                Ok(results) => {
                    for (i, entry) in in_flight.into_iter().enumerate() {
                        match results.get(i).map(|r| r.error.clone()) {
                            Some(None) => written.push(entry),
                            Some(Some(err)) => {
                                warn!(
                                    record_id = %entry.record_id,
                                    op = %entry.op,
                                    reason = %err.reason,
                                    "Bulk item failed"
                                );
                                failures.push((entry, err.category));
                            }
                            None => {
                                warn!(record_id = %entry.record_id, "Bulk response missing item");
                                failures.push((entry, ErrorCategory::Transient));
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, entries = in_flight.len(), "Bulk request failed");
                    let category = e.category();
                    failures.extend(in_flight.into_iter().map(|entry| (entry, category)));
                }
            }

            outcome.succeeded += written.len();
            if !written.is_empty() {
                // Unacked entries are rewritten once their lease runs out
                if let Err(e) = self.queue.ack(&written).await {
                    warn!(error = %e, entries = written.len(), "Acknowledging written entries failed");
                }
            }
        }

        outcome.failed = failures.len();
        if let Err(e) = self.settle_failures(failures, &mut outcome).await {
            error!(error = %e, "Settling failed bulk queue entries failed");
            interrupted.get_or_insert(e);
        }

        if outcome.succeeded + outcome.failed > 0 {
            info!(
                record_type = self.store.record_type(),
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                retried = outcome.retried,
                dead_lettered = outcome.dead_lettered,
                "Bulk queue processed"
            );
        }

        match interrupted {
            Some(e) => Err(SyncError::DrainInterrupted {
                outcome,
                source: Box::new(e),
            }),
            None => Ok(outcome),
        }
    }

    async fn prepare(&self, entry: &QueueEntry) -> Result<BulkAction> {
        let id = entry.record_id;
        match entry.op {
            IndexOp::Delete => Ok(BulkAction::Delete { id }),
            IndexOp::Index => match self.store.get(id).await? {
                Some(record) => {
                    let projection = self.resolver.resolve(&record).await;
                    Ok(BulkAction::Index {
                        id,
                        document: DocumentBuilder::build(&projection, Utc::now()),
                    })
                }
                None => {
                    debug!(record_id = %id, "Record gone from store, deleting from index");
                    Ok(BulkAction::Delete { id })
                }
            },
        }
    }

    async fn settle_failures(
        &self,
        failures: Vec<(QueueEntry, ErrorCategory)>,
        outcome: &mut BulkOutcome,
    ) -> Result<()> {
        let mut retry = Vec::new();
        let mut dead = Vec::new();
        for (entry, category) in failures {
            let next = entry.failed_attempt();
            if !category.is_retryable() || next.attempts >= self.config.max_attempts {
                error!(
                    record_id = %entry.record_id,
                    op = %entry.op,
                    attempts = next.attempts,
                    category = %category,
                    "Dead-lettering bulk queue entry"
                );
                dead.push(entry);
            } else {
                retry.push(next);
            }
        }
        outcome.dead_lettered = dead.len();

        let acked = if dead.is_empty() {
            Ok(0)
        } else {
            self.queue.ack(&dead).await
        };
        let retried = if retry.is_empty() {
            Ok(0)
        } else {
            self.queue.retry(&retry).await
        };
        if retried.is_ok() {
            outcome.retried = retry.len();
        }
        acked.and(retried)?;
        Ok(())
    }
}

#[async_trait]
impl Reindex for RecordIndexer {
    async fn reindex(&self, identity: &Identity, query: &Query) -> Result<usize> {
        let ids = self.index.scan_ids(query).await?;
        let matched = ids.len();
        if matched > 0 {
            self.bulk_queue(ids, IndexOp::Index).await?;
        }
        debug!(
            identity = identity.subject(),
            record_type = self.store.record_type(),
            matched,
            "Reindex queued"
        );
        Ok(matched)
    }
}

fn single_result(results: Vec<BulkItemResult>, id: Uuid) -> Result<()> {
    match results.into_iter().next() {
        Some(BulkItemResult { error: None, .. }) => Ok(()),
        Some(BulkItemResult {
            error: Some(err), ..
        }) => Err(SyncError::index(format!("{}: {}", id, err.reason))),
        None => Err(SyncError::index(format!("{}: empty bulk response", id))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::relations::RelationCatalog;
    use relindex_storage::{InMemoryBulkQueue, InMemoryRecordStore};

    struct Fixture {
        store: Arc<InMemoryRecordStore>,
        queue: Arc<InMemoryBulkQueue>,
        index: Arc<MemoryIndex>,
        indexer: RecordIndexer,
    }

    fn fixture(config: IndexerConfig) -> Fixture {
        let store = Arc::new(InMemoryRecordStore::new("mock-records"));
        let queue = Arc::new(InMemoryBulkQueue::new());
        let index = Arc::new(MemoryIndex::new());
        let catalog = Arc::new(RelationCatalog::new());
        catalog.register_store(store.clone());
        let indexer = RecordIndexer::new(
            store.clone(),
            queue.clone(),
            index.clone(),
            Arc::new(RelationResolver::new(catalog, 2)),
            config,
        );
        Fixture {
            store,
            queue,
            index,
            indexer,
        }
    }

    async fn insert(store: &InMemoryRecordStore, title: &str) -> Record {
        store
            .insert(Record::new(
                "mock-records",
                Record::mint_pid(),
                json!({ "title": title }),
            ))
            .await
            .unwrap()
    }

    #[test]
    fn test_document_shape() {
        let mut record = Record::new("mock-records", "abcde-12345", json!({"title": "A"}));
        record.revision_id = 2;
        let doc = DocumentBuilder::build(&record, Utc::now());

        assert_eq!(doc["uuid"], record.id.to_string());
        assert_eq!(doc["pid"], "abcde-12345");
        assert_eq!(doc["revision_id"], 2);
        assert_eq!(doc["metadata"]["title"], "A");
        assert!(doc[INDEXED_AT_FIELD].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_index_and_delete_direct() {
        let f = fixture(IndexerConfig::default());
        let record = insert(&f.store, "A").await;

        f.indexer.index(&record).await.unwrap();
        assert_eq!(f.index.count().await.unwrap(), 1);

        f.indexer.delete(&record).await.unwrap();
        assert_eq!(f.index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_processed_once() {
        let f = fixture(IndexerConfig::default());
        let record = insert(&f.store, "A").await;

        f.indexer.bulk_queue([record.id], IndexOp::Index).await.unwrap();
        f.indexer.bulk_queue([record.id], IndexOp::Index).await.unwrap();

        let outcome = f.indexer.process_bulk_queue().await.unwrap();
        assert_eq!(outcome.as_tuple(), (1, 0));
        assert_eq!(f.index.count().await.unwrap(), 1);

        // Draining an empty queue is a no-op
        assert_eq!(f.indexer.process_bulk_queue().await.unwrap(), BulkOutcome::default());
    }

    #[tokio::test]
    async fn test_drain_spans_several_chunks() {
        let f = fixture(IndexerConfig {
            bulk_chunk_size: 2,
            ..Default::default()
        });
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(insert(&f.store, &format!("R{}", i)).await.id);
        }

        f.indexer.bulk_queue(ids, IndexOp::Index).await.unwrap();
        let outcome = f.indexer.process_bulk_queue().await.unwrap();
        assert_eq!(outcome.as_tuple(), (5, 0));
        assert_eq!(f.index.count().await.unwrap(), 5);
        assert!(f.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_record_becomes_delete() {
        let f = fixture(IndexerConfig::default());
        let record = insert(&f.store, "A").await;
        f.indexer.index(&record).await.unwrap();

        f.store.delete(&record).await.unwrap();
        f.indexer.bulk_queue([record.id], IndexOp::Index).await.unwrap();

        assert_eq!(f.indexer.process_bulk_queue().await.unwrap().as_tuple(), (1, 0));
        assert_eq!(f.index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rebuild_queues_everything() {
        let f = fixture(IndexerConfig::default());
        for title in ["A", "B", "C"] {
            insert(&f.store, title).await;
        }

        assert_eq!(f.indexer.rebuild().await.unwrap(), 3);
        assert_eq!(f.queue.len().await.unwrap(), 3);
        assert_eq!(f.indexer.process_bulk_queue().await.unwrap().as_tuple(), (3, 0));
    }

    #[tokio::test]
    async fn test_reindex_queues_matching_documents() {
        let f = fixture(IndexerConfig::default());
        let a = insert(&f.store, "alpha").await;
        let b = insert(&f.store, "beta").await;
        f.indexer.index(&a).await.unwrap();
        f.indexer.index(&b).await.unwrap();

        let matched = f
            .indexer
            .reindex(&Identity::system(), &Query::term("metadata.title", "beta"))
            .await
            .unwrap();
        assert_eq!(matched, 1);

        let claimed = f.queue.claim(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].record_id, b.id);
    }
}
