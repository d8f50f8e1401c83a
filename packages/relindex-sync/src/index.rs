//! Search index port and in-memory engine

use async_trait::async_trait;
use parking_lot::RwLock;
use relindex_storage::IndexOp;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ErrorCategory, Result};
use crate::query::Query;

/// One operation of a bulk request
#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    /// Upsert the full document
    Index { id: Uuid, document: Value },
    Delete { id: Uuid },
}

impl BulkAction {
    pub fn id(&self) -> Uuid {
        match self {
            BulkAction::Index { id, .. } | BulkAction::Delete { id } => *id,
        }
    }

    pub fn op(&self) -> IndexOp {
        match self {
            BulkAction::Index { .. } => IndexOp::Index,
            BulkAction::Delete { .. } => IndexOp::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemError {
    pub reason: String,
    pub category: ErrorCategory,
}

/// Per-item result of a bulk request, in request order
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub id: Uuid,
    pub op: IndexOp,
    pub error: Option<BulkItemError>,
}

impl BulkItemResult {
    pub fn ok(id: Uuid, op: IndexOp) -> Self {
        Self { id, op, error: None }
    }

    pub fn failed(id: Uuid, op: IndexOp, reason: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            id,
            op,
            error: Some(BulkItemError {
                reason: reason.into(),
                category,
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    /// Matches before pagination
    pub total: usize,
    pub hits: Vec<Value>,
}

/// Secondary search index
///
/// The index is derived from the record store and may lag behind it.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Apply actions; one result per action, in order
    ///
    /// An `Err` means the whole request failed. Per-document failures are
    /// reported in the results.
    async fn bulk(&self, actions: Vec<BulkAction>) -> Result<Vec<BulkItemResult>>;

    async fn search(&self, query: &Query, from: usize, size: usize) -> Result<SearchHits>;

    /// Ids of every matching document
    async fn scan_ids(&self, query: &Query) -> Result<Vec<Uuid>>;

    async fn get(&self, id: Uuid) -> Result<Option<Value>>;

    async fn count(&self) -> Result<usize>;
}

/// In-memory search index
///
/// Evaluates queries with [`Query::matches`]. Hits are ordered by the
/// `created` field, then by id.
#[derive(Clone, Default)]
pub struct MemoryIndex {
    docs: Arc<RwLock<HashMap<Uuid, Value>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_matches(&self, query: &Query) -> Vec<(Uuid, Value)> {
        let docs = self.docs.read();
        let mut matched: Vec<(Uuid, Value)> = docs
            .iter()
            .filter(|(_, doc)| query.matches(doc))
            .map(|(id, doc)| (*id, doc.clone()))
            .collect();
        matched.sort_by(|(a_id, a), (b_id, b)| {
            let a_created = a.get("created").and_then(Value::as_str).unwrap_or("");
            let b_created = b.get("created").and_then(Value::as_str).unwrap_or("");
            a_created.cmp(b_created).then(a_id.cmp(b_id))
        });
        matched
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn bulk(&self, actions: Vec<BulkAction>) -> Result<Vec<BulkItemResult>> {
        let mut docs = self.docs.write();
        let results = actions
            .into_iter()
            .map(|action| match action {
                BulkAction::Index { id, document } => {
                    if !document.is_object() {
                        return BulkItemResult::failed(
                            id,
                            IndexOp::Index,
                            "document must be a JSON object",
                            ErrorCategory::Permanent,
                        );
                    }
                    docs.insert(id, document);
                    BulkItemResult::ok(id, IndexOp::Index)
                }
                BulkAction::Delete { id } => {
                    // Deleting an absent document is not an error
                    docs.remove(&id);
                    BulkItemResult::ok(id, IndexOp::Delete)
                }
            })
            .collect();
        Ok(results)
    }

    async fn search(&self, query: &Query, from: usize, size: usize) -> Result<SearchHits> {
        let matched = self.sorted_matches(query);
        let total = matched.len();
        let hits = matched
            .into_iter()
            .skip(from)
            .take(size)
            .map(|(_, doc)| doc)
            .collect();
        Ok(SearchHits { total, hits })
    }

    async fn scan_ids(&self, query: &Query) -> Result<Vec<Uuid>> {
        Ok(self
            .sorted_matches(query)
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Value>> {
        Ok(self.docs.read().get(&id).cloned())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.docs.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(created: &str, title: &str) -> Value {
        json!({"created": created, "metadata": {"title": title}})
    }

    #[tokio::test]
    async fn test_bulk_reports_per_item() {
        let index = MemoryIndex::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let results = index
            .bulk(vec![
                BulkAction::Index {
                    id: a,
                    document: doc("2026-01-01", "A"),
                },
                BulkAction::Index {
                    id: b,
                    document: json!("not an object"),
                },
                BulkAction::Delete { id: Uuid::new_v4() },
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert_eq!(
            results[1].error.as_ref().unwrap().category,
            ErrorCategory::Permanent
        );
        assert!(results[2].is_ok());
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_search_orders_and_paginates() {
        let index = MemoryIndex::new();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let actions = vec![
            BulkAction::Index {
                id: ids[0],
                document: doc("2026-01-03", "third"),
            },
            BulkAction::Index {
                id: ids[1],
                document: doc("2026-01-01", "first"),
            },
            BulkAction::Index {
                id: ids[2],
                document: doc("2026-01-02", "second"),
            },
        ];
        index.bulk(actions).await.unwrap();

        let page = index.search(&Query::MatchAll, 1, 1).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.hits[0]["metadata"]["title"], "second");

        let ids_in_order = index.scan_ids(&Query::MatchAll).await.unwrap();
        assert_eq!(ids_in_order, vec![ids[1], ids[2], ids[0]]);
    }

    #[tokio::test]
    async fn test_index_overwrites() {
        let index = MemoryIndex::new();
        let id = Uuid::new_v4();
        for title in ["old", "new"] {
            index
                .bulk(vec![BulkAction::Index {
                    id,
                    document: doc("2026-01-01", title),
                }])
                .await
                .unwrap();
        }
        assert_eq!(index.get(id).await.unwrap().unwrap()["metadata"]["title"], "new");
        assert_eq!(index.count().await.unwrap(), 1);
    }
}
