//! Relation update handler
//!
//! Subscribed on the bus under each relation type a service declares. When
//! records of that type change, it finds the documents of its own service
//! that embed an outdated copy of them and has those reindexed.
//!
//! Changes are cut into consecutive chunks of at most `batch_limit`
//! records, in input order. Each chunk becomes one query with one `should`
//! clause per changed record, and one `reindex` call. A failing chunk does
//! not stop the ones after it.
//!
//! # Matching
//!
//! For a change `(pid, id, revision)` and a declared path `p`, a document
//! matches when `metadata.p.@v` starts with `"<id>::"` but is not exactly
//! `"<id>::<revision>"`; documents already carrying the new revision are
//! left alone. The chunk query also filters on `indexed_at <= notified_at`,
//! so documents written after the notification are skipped.
//!
//! With a catalog attached, paths also cover relations embedded inside
//! resolved relations, e.g. `mid.metadata.inner` for records of the type
//! `inner` points to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::context::Identity;
use crate::error::{Result, SyncError};
use crate::indexer::{format_timestamp, Reindex, INDEXED_AT_FIELD};
use crate::notification::{ChangeNotification, ChangeSubscriber, RecordChange};
use crate::query::{BoolQuery, Query};
use crate::relations::{RelationCatalog, RelationDeclaration, VERSION_KEY};

/// Clause matching documents with a stale copy of `change` at any of `paths`
pub fn relation_clause(paths: &[String], change: &RecordChange) -> Query {
    let id_prefix = format!("{}::", change.id);
    let current = change.version_stamp();

    let mut per_path: Vec<Query> = paths
        .iter()
        .map(|path| {
            let field = format!("metadata.{}.{}", path, VERSION_KEY);
            Query::Bool(
                BoolQuery::default()
                    .must(Query::prefix(field.clone(), id_prefix.clone()))
                    .must_not(Query::term(field, current.clone())),
            )
        })
        .collect();

    if per_path.len() == 1 {
        return per_path.remove(0);
    }
    Query::Bool(
        per_path
            .into_iter()
            .fold(BoolQuery::default(), BoolQuery::should)
            .minimum_should_match(1),
    )
}

/// One query per chunk of at most `batch_limit` changes
///
/// # Errors
///
/// `Validation` if `batch_limit` is 0.
pub fn relation_queries(
    paths: &[String],
    changes: &[RecordChange],
    notified_at: DateTime<Utc>,
    batch_limit: usize,
) -> Result<Vec<Query>> {
    if batch_limit == 0 {
        return Err(SyncError::validation("batch_limit must be greater than 0"));
    }

    let cutoff = format_timestamp(&notified_at);
    Ok(changes
        .chunks(batch_limit)
        .map(|chunk| {
            Query::Bool(BoolQuery {
                should: chunk.iter().map(|c| relation_clause(paths, c)).collect(),
                filter: vec![Query::lte(INDEXED_AT_FIELD, cutoff.clone())],
                minimum_should_match: Some(1),
                ..Default::default()
            })
        })
        .collect())
}

/// What one `on_relation_update` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationUpdateReport {
    pub relation_type: String,
    /// Queries issued
    pub chunks: usize,
    pub failed_chunks: usize,
    /// Documents scheduled for reindexing over all successful chunks
    pub matched: usize,
}

impl RelationUpdateReport {
    pub fn is_success(&self) -> bool {
        self.failed_chunks == 0
    }
}

/// Reindexes a service's records when records they reference change
pub struct RelationUpdateHandler {
    name: String,
    declaration: RelationDeclaration,
    reindexer: Arc<dyn Reindex>,
    nested: Option<(Arc<RelationCatalog>, usize)>,
}

impl RelationUpdateHandler {
    pub fn new(
        service_id: impl Into<String>,
        declaration: RelationDeclaration,
        reindexer: Arc<dyn Reindex>,
    ) -> Self {
        Self {
            name: format!("{}.on_relation_update", service_id.into()),
            declaration,
            reindexer,
            nested: None,
        }
    }

    /// Also match copies embedded up to `max_depth` levels deep, following
    /// the declarations in `catalog`
    pub fn with_nested_relations(mut self, catalog: Arc<RelationCatalog>, max_depth: usize) -> Self {
        self.nested = Some((catalog, max_depth));
        self
    }

    pub fn declaration(&self) -> &RelationDeclaration {
        &self.declaration
    }

    /// Paths holding copies of `relation_type` records in this service's documents
    pub fn paths_for(&self, relation_type: &str) -> Vec<String> {
        match &self.nested {
            Some((catalog, max_depth)) => catalog
                .embedded_paths(&self.declaration, *max_depth)
                .remove(relation_type)
                .map(|paths| paths.into_iter().collect())
                .unwrap_or_default(),
            None => self.declaration.paths_for(relation_type).to_vec(),
        }
    }

    /// Topics this handler has to listen on
    pub fn relation_types(&self) -> Vec<String> {
        match &self.nested {
            Some((catalog, max_depth)) => catalog
                .embedded_paths(&self.declaration, *max_depth)
                .into_keys()
                .collect(),
            None => self.declaration.relation_types().map(str::to_string).collect(),
        }
    }

    pub async fn on_relation_update(
        &self,
        identity: &Identity,
        relation_type: &str,
        changes: &[RecordChange],
        notified_at: DateTime<Utc>,
        batch_limit: usize,
    ) -> Result<RelationUpdateReport> {
        let mut report = RelationUpdateReport {
            relation_type: relation_type.to_string(),
            ..Default::default()
        };

        let paths = self.paths_for(relation_type);
        if paths.is_empty() {
            warn!(handler = %self.name, relation_type, "Relation type not declared, ignoring");
            return Ok(report);
        }

        let queries = relation_queries(&paths, changes, notified_at, batch_limit)?;
        report.chunks = queries.len();

        for (i, query) in queries.iter().enumerate() {
            match self.reindexer.reindex(identity, query).await {
                Ok(matched) => {
                    debug!(
                        relation_type,
                        chunk = i,
                        clauses = query.should_len(),
                        matched,
                        "Relation chunk reindexed"
                    );
                    report.matched += matched;
                }
                Err(e) => {
                    error!(
                        relation_type,
                        chunk = i,
                        clauses = query.should_len(),
                        error = %e,
                        "Relation chunk reindex failed"
                    );
                    report.failed_chunks += 1;
                }
            }
        }

        if report.chunks > 0 {
            info!(
                handler = %self.name,
                relation_type,
                changes = changes.len(),
                chunks = report.chunks,
                failed_chunks = report.failed_chunks,
                matched = report.matched,
                "Relation update handled"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl ChangeSubscriber for RelationUpdateHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_notification(&self, notification: &ChangeNotification) -> Result<()> {
        let report = self
            .on_relation_update(
                &notification.identity,
                &notification.topic,
                &notification.changes,
                notification.notified_at,
                notification.batch_limit,
            )
            .await?;

        if report.is_success() {
            Ok(())
        } else {
            Err(SyncError::ReindexFailed {
                relation_type: report.relation_type,
                failed: report.failed_chunks,
                total: report.chunks,
            })
        }
    }
}
