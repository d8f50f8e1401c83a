//! Record service
//!
//! CRUD and search over one record type. Every mutation follows the same
//! pipeline:
//!
//! 1. commit to the store (nothing else happens if this fails)
//! 2. index the record itself
//! 3. notify relation subscribers (update and delete only)
//!
//! Once the commit succeeded, steps 2 and 3 both run even if one of them
//! fails; the first error is returned afterwards.
//!
//! Documents of *other* records embedding the changed one are refreshed
//! later, when the bulk queue is drained.

use relindex_storage::{BulkQueue, IndexOp, Record, RecordStore};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{NotificationFailurePolicy, SyncConfig};
use crate::context::{Identity, ServiceContext};
use crate::error::{Result, SyncError};
use crate::files::{FileEntry, FileSubsystem};
use crate::handler::RelationUpdateHandler;
use crate::index::SearchIndex;
use crate::indexer::{format_timestamp, Reindex, RecordIndexer};
use crate::notification::{ChangeNotification, RecordChange};
use crate::pagination::SearchParams;
use crate::query::Query;
use crate::relations::{dereference_to_stubs, RelationDeclaration, RelationResolver};

/// A record as returned to callers, relations resolved
#[derive(Debug, Clone, PartialEq)]
pub struct RecordItem {
    record: Record,
}

impl RecordItem {
    pub fn pid(&self) -> &str {
        &self.record.pid
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn revision_id(&self) -> u64 {
        self.record.revision_id
    }

    pub fn metadata(&self) -> &Value {
        &self.record.metadata
    }

    pub fn into_record(self) -> Record {
        self.record
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.record.pid,
            "uuid": self.record.id.to_string(),
            "revision_id": self.record.revision_id,
            "created": format_timestamp(&self.record.created),
            "updated": format_timestamp(&self.record.updated),
            "metadata": self.record.metadata,
        })
    }
}

/// One page of search results
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub total: usize,
    pub page: usize,
    pub size: usize,
    pub hits: Vec<Value>,
}

pub struct RecordService {
    config: SyncConfig,
    ctx: ServiceContext,
    declaration: RelationDeclaration,
    store: Arc<dyn RecordStore>,
    resolver: Arc<RelationResolver>,
    indexer: Arc<RecordIndexer>,
    handler: Arc<RelationUpdateHandler>,
    files: Option<Arc<dyn FileSubsystem>>,
}

impl RecordService {
    /// Build a service and register its store and relations in the catalog
    ///
    /// Subscribing to relation topics is a separate step
    /// ([`register_relation_subscribers`](Self::register_relation_subscribers)).
    pub fn new(
        config: SyncConfig,
        ctx: ServiceContext,
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn BulkQueue>,
        index: Arc<dyn SearchIndex>,
    ) -> Result<Self> {
        config.validate()?;
        if store.record_type() != config.record_type {
            return Err(SyncError::validation(format!(
                "store serves {}, service {} expects {}",
                store.record_type(),
                config.service_id,
                config.record_type
            )));
        }

        let declaration = RelationDeclaration::new(config.relations.clone());
        ctx.catalog.register_store(store.clone());
        ctx.catalog
            .declare(config.record_type.clone(), declaration.clone());

        let resolver = Arc::new(RelationResolver::new(
            ctx.catalog.clone(),
            config.resolver.max_depth,
        ));
        let indexer = Arc::new(RecordIndexer::new(
            store.clone(),
            queue,
            index,
            resolver.clone(),
            config.indexer.clone(),
        ));
        let handler = Arc::new(RelationUpdateHandler::new(
            config.service_id.clone(),
            declaration.clone(),
            indexer.clone(),
        )
        .with_nested_relations(ctx.catalog.clone(), config.resolver.max_depth));

        info!(
            service = %config.service_id,
            record_type = %config.record_type,
            relations = config.relations.len(),
            "Record service ready"
        );

        Ok(Self {
            config,
            ctx,
            declaration,
            store,
            resolver,
            indexer,
            handler,
            files: None,
        })
    }

    pub fn with_files(mut self, files: Arc<dyn FileSubsystem>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn id(&self) -> &str {
        &self.config.service_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn indexer(&self) -> &Arc<RecordIndexer> {
        &self.indexer
    }

    pub fn relation_handler(&self) -> Arc<RelationUpdateHandler> {
        self.handler.clone()
    }

    /// Subscribe this service's handler to every relation type its
    /// documents embed, directly or inside other relations
    ///
    /// Nested types are read from the catalog, so call this once every
    /// service sharing the context has been built.
    pub fn register_relation_subscribers(&self) -> usize {
        let topics = self.handler.relation_types();
        for relation_type in &topics {
            self.ctx.bus.register(relation_type.clone(), self.handler.clone());
        }
        topics.len()
    }

    pub async fn create(&self, identity: &Identity, mut metadata: Value) -> Result<RecordItem> {
        dereference_to_stubs(&self.declaration, &mut metadata);
        let record = Record::new(self.config.record_type.clone(), Record::mint_pid(), metadata);
        let record = self.store.insert(record).await?;
        debug!(identity = identity.subject(), pid = %record.pid, "Record created");

        self.index_or_queue(&record).await?;
        // Nothing can reference a new record yet
        self.item(&record).await
    }

    pub async fn read(&self, _identity: &Identity, pid: &str) -> Result<RecordItem> {
        let record = self.store.resolve(pid).await?;
        self.item(&record).await
    }

    pub async fn update(
        &self,
        identity: &Identity,
        pid: &str,
        mut metadata: Value,
    ) -> Result<RecordItem> {
        let mut record = self.store.resolve(pid).await?;
        dereference_to_stubs(&self.declaration, &mut metadata);
        record.metadata = metadata;

        let record = self.store.commit(record).await?;
        debug!(
            identity = identity.subject(),
            pid = %record.pid,
            revision_id = record.revision_id,
            "Record updated"
        );

        let indexed = self.index_or_queue(&record).await;
        let notified = self.notify_change(identity, &record).await;
        indexed.and(notified)?;
        self.item(&record).await
    }

    pub async fn delete(&self, identity: &Identity, pid: &str) -> Result<()> {
        let record = self.store.resolve(pid).await?;
        let deleted = self.store.delete(&record).await?;
        debug!(identity = identity.subject(), pid = %deleted.pid, "Record deleted");

        let unindexed = self.unindex_or_queue(&deleted).await;
        let notified = self.notify_change(identity, &deleted).await;
        unindexed.and(notified)
    }

    /// Search the index (may lag behind the store)
    pub async fn search(&self, _identity: &Identity, params: &SearchParams) -> Result<SearchResult> {
        let pagination = params.resolve(&self.config.search)?;
        let hits = self
            .indexer
            .search_index()
            .search(&pagination.query, pagination.from, pagination.size)
            .await?;
        Ok(SearchResult {
            total: hits.total,
            page: pagination.page,
            size: pagination.size,
            hits: hits.hits,
        })
    }

    pub async fn reindex(&self, identity: &Identity, query: &Query) -> Result<usize> {
        self.indexer.reindex(identity, query).await
    }

    /// Queue every stored record for indexing
    pub async fn rebuild_index(&self, _identity: &Identity) -> Result<usize> {
        self.indexer.rebuild().await
    }

    async fn item(&self, record: &Record) -> Result<RecordItem> {
        Ok(RecordItem {
            record: self.resolver.resolve(record).await,
        })
    }

    /// Index now; on failure leave it to the bulk queue
    async fn index_or_queue(&self, record: &Record) -> Result<()> {
        if let Err(e) = self.indexer.index(record).await {
            warn!(pid = %record.pid, error = %e, "Direct indexing failed, queueing");
            self.queue_fallback(record, IndexOp::Index).await?;
        }
        Ok(())
    }

    async fn unindex_or_queue(&self, record: &Record) -> Result<()> {
        if let Err(e) = self.indexer.delete(record).await {
            warn!(pid = %record.pid, error = %e, "Index delete failed, queueing");
            self.queue_fallback(record, IndexOp::Delete).await?;
        }
        Ok(())
    }

    async fn queue_fallback(&self, record: &Record, op: IndexOp) -> Result<()> {
        if let Err(e) = self.indexer.bulk_queue([record.id], op).await {
            error!(
                pid = %record.pid,
                op = %op,
                error = %e,
                "Committed change neither indexed nor queued"
            );
            return Err(e);
        }
        Ok(())
    }

    async fn notify_change(&self, identity: &Identity, record: &Record) -> Result<()> {
        for topic in self.ctx.catalog.relation_types_for(record) {
            let notification = ChangeNotification::new(
                topic.clone(),
                identity.clone(),
                vec![RecordChange::from(record)],
                self.config.batch_limit,
            );
            debug!(
                topic = %topic,
                at = %format_timestamp(&notification.notified_at),
                "Notifying relation subscribers"
            );

            if let Err(e) = self.ctx.bus.notify(&notification).await {
                match self.config.notification_failure {
                    NotificationFailurePolicy::Isolate => {
                        warn!(
                            service = %self.config.service_id,
                            pid = %record.pid,
                            error = %e,
                            "Relation notification failed, change is committed"
                        );
                    }
                    NotificationFailurePolicy::Propagate => return Err(e),
                }
            }
        }
        Ok(())
    }

    // File capability

    fn files(&self) -> Result<&Arc<dyn FileSubsystem>> {
        self.files.as_ref().ok_or_else(|| {
            SyncError::validation(format!("service {} has no file support", self.config.service_id))
        })
    }

    pub async fn list_files(&self, _identity: &Identity, pid: &str) -> Result<Vec<FileEntry>> {
        let files = self.files()?;
        let record = self.store.resolve(pid).await?;
        files.list_files(record.id).await
    }

    pub async fn init_files(
        &self,
        _identity: &Identity,
        pid: &str,
        entries: Vec<(String, Value)>,
    ) -> Result<Vec<FileEntry>> {
        let files = self.files()?;
        let record = self.store.resolve(pid).await?;
        files.init_files(record.id, entries).await
    }

    pub async fn read_file_metadata(
        &self,
        _identity: &Identity,
        pid: &str,
        key: &str,
    ) -> Result<FileEntry> {
        let files = self.files()?;
        let record = self.store.resolve(pid).await?;
        files.read_file_metadata(record.id, key).await
    }

    pub async fn update_file_metadata(
        &self,
        _identity: &Identity,
        pid: &str,
        key: &str,
        metadata: Value,
    ) -> Result<FileEntry> {
        let files = self.files()?;
        let record = self.store.resolve(pid).await?;
        files.update_file_metadata(record.id, key, metadata).await
    }

    pub async fn set_file_content_length(
        &self,
        _identity: &Identity,
        pid: &str,
        key: &str,
        length: u64,
    ) -> Result<FileEntry> {
        let files = self.files()?;
        let record = self.store.resolve(pid).await?;
        files.set_content_length(record.id, key, length).await
    }

    pub async fn commit_file(&self, _identity: &Identity, pid: &str, key: &str) -> Result<FileEntry> {
        let files = self.files()?;
        let record = self.store.resolve(pid).await?;
        files.commit_file(record.id, key).await
    }

    pub async fn delete_file(&self, _identity: &Identity, pid: &str, key: &str) -> Result<FileEntry> {
        let files = self.files()?;
        let record = self.store.resolve(pid).await?;
        files.delete_file(record.id, key).await
    }

    pub async fn delete_all_files(&self, _identity: &Identity, pid: &str) -> Result<Vec<FileEntry>> {
        let files = self.files()?;
        let record = self.store.resolve(pid).await?;
        files.delete_all_files(record.id).await
    }
}
