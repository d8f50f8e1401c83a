/*
 * relindex-sync - relation propagation and asynchronous reindexing
 *
 * Keeps a search index consistent with the record store when records
 * embed relations to other records.
 *
 * Pipeline:
 * - Commit to the store (synchronous, durable)
 * - Index the record itself and notify relation subscribers (synchronous)
 * - Queue referencing documents for reindexing (bounded queries)
 * - Drain the bulk queue into the index (background worker)
 */

pub mod config;
pub mod context;
pub mod error;
pub mod files;
pub mod handler;
pub mod index;
pub mod indexer;
pub mod notification;
pub mod pagination;
pub mod query;
pub mod relations;
pub mod service;
pub mod telemetry;
pub mod worker;

// Re-exports
pub use config::{ConfigError, NotificationFailurePolicy, SyncConfig};
pub use context::{Identity, ServiceContext};
pub use error::{ErrorCategory, Result, SyncError};
pub use files::{FileEntry, FileStatus, FileSubsystem, InMemoryFileSubsystem};
pub use handler::{relation_clause, relation_queries, RelationUpdateHandler, RelationUpdateReport};
pub use index::{BulkAction, BulkItemError, BulkItemResult, MemoryIndex, SearchHits, SearchIndex};
pub use indexer::{BulkOutcome, DocumentBuilder, RecordIndexer, Reindex};
pub use notification::{ChangeNotification, ChangeSubscriber, NotificationBus, RecordChange};
pub use pagination::{Pagination, SearchParams};
pub use query::{BoolQuery, Query, RangeBounds};
pub use relations::{
    FieldValue, RelationCatalog, RelationDeclaration, RelationResolver, ResolvedRelation,
};
pub use service::{RecordItem, RecordService, SearchResult};
pub use worker::BulkIndexWorker;
