//! Relation declarations and read-time resolution
//!
//! A record embeds a relation as a stub `{"id": "<pid>"}` at a declared
//! metadata path. [`RelationResolver`] turns stubs into
//! [`ResolvedRelation`]s in a projection of the record; the stored record
//! is never touched.
//!
//! A resolved relation is rendered as
//!
//! ```json
//! {"id": "abcde-12345", "@v": "<uuid>::<revision>", "metadata": {...}}
//! ```
//!
//! The `@v` stamp is what relation reindex queries match on.

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use relindex_storage::{Record, RecordStore};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Key holding the version stamp inside a resolved relation
pub const VERSION_KEY: &str = "@v";

/// Relations declared by one record type
///
/// Referenced record type -> dotted metadata paths holding stubs of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationDeclaration {
    relations: BTreeMap<String, Vec<String>>,
}

impl RelationDeclaration {
    pub fn new(relations: BTreeMap<String, Vec<String>>) -> Self {
        Self { relations }
    }

    pub fn with_relation<I, S>(mut self, relation_type: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relations
            .entry(relation_type.into())
            .or_default()
            .extend(paths.into_iter().map(Into::into));
        self
    }

    /// Paths holding stubs of `relation_type` (empty if undeclared)
    pub fn paths_for(&self, relation_type: &str) -> &[String] {
        self.relations
            .get(relation_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn relation_types(&self) -> impl Iterator<Item = &str> {
        self.relations.keys().map(String::as_str)
    }

    pub fn declares(&self, relation_type: &str) -> bool {
        self.relations.contains_key(relation_type)
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.relations
            .iter()
            .map(|(t, p)| (t.as_str(), p.as_slice()))
    }
}

/// Who stores what, and who references what
///
/// Every record service registers its store and its declaration here at
/// startup; resolvers look referenced stores up by type.
#[derive(Default)]
pub struct RelationCatalog {
    stores: DashMap<String, Arc<dyn RecordStore>>,
    declarations: DashMap<String, RelationDeclaration>,
}

impl RelationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_store(&self, store: Arc<dyn RecordStore>) {
        self.stores.insert(store.record_type().to_string(), store);
    }

    pub fn declare(&self, owner_type: impl Into<String>, declaration: RelationDeclaration) {
        self.declarations.insert(owner_type.into(), declaration);
    }

    pub fn store(&self, record_type: &str) -> Option<Arc<dyn RecordStore>> {
        self.stores.get(record_type).map(|s| s.value().clone())
    }

    pub fn declaration(&self, owner_type: &str) -> Option<RelationDeclaration> {
        self.declarations.get(owner_type).map(|d| d.value().clone())
    }

    /// Where relations of `declaration` sit in a projection resolved
    /// `max_depth` levels deep
    ///
    /// A referenced record's own relations are embedded under the
    /// referencing path's `metadata`: if B declares `inner -> A` and C
    /// declares `mid -> B`, C's projection holds A at `mid.metadata.inner`.
    /// Only declarations registered so far are followed.
    pub fn embedded_paths(
        &self,
        declaration: &RelationDeclaration,
        max_depth: usize,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut embedded: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut frontier: Vec<(String, String)> = declaration
            .iter()
            .flat_map(|(t, paths)| paths.iter().map(move |p| (t.to_string(), p.clone())))
            .collect();

        for level in 1..=max_depth {
            let mut next = Vec::new();
            for (relation_type, path) in frontier {
                if level < max_depth {
                    if let Some(nested) = self.declaration(&relation_type) {
                        for (t, paths) in nested.iter() {
                            next.extend(
                                paths
                                    .iter()
                                    .map(|p| (t.to_string(), format!("{}.metadata.{}", path, p))),
                            );
                        }
                    }
                }
                embedded.entry(relation_type).or_default().insert(path);
            }
            frontier = next;
        }
        embedded
    }

    /// Topics to notify when `record` changes
    ///
    /// The topic is the record's own type, returned only if some declared
    /// relation targets that type.
    pub fn relation_types_for(&self, record: &Record) -> BTreeSet<String> {
        let targeted = self
            .declarations
            .iter()
            .any(|d| d.value().declares(&record.record_type));

        let mut topics = BTreeSet::new();
        if targeted {
            topics.insert(record.record_type.clone());
        }
        topics
    }
}

/// A relation dereferenced to the referenced record's current state
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRelation {
    pub pid: String,
    pub id: Uuid,
    pub revision_id: u64,
    pub metadata: Value,
}

impl ResolvedRelation {
    pub fn version_stamp(&self) -> String {
        format!("{}::{}", self.id, self.revision_id)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.pid,
            VERSION_KEY: self.version_stamp(),
            "metadata": self.metadata,
        })
    }
}

/// A relation field as found in metadata
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Anything that is not a relation stub
    Scalar(Value),
    /// `{"id": pid}` and nothing else
    Stub(String),
    Resolved(ResolvedRelation),
}

impl FieldValue {
    pub fn classify(value: &Value) -> Self {
        match value {
            Value::Object(map) if map.len() == 1 => match map.get("id") {
                Some(Value::String(pid)) => FieldValue::Stub(pid.clone()),
                _ => FieldValue::Scalar(value.clone()),
            },
            _ => FieldValue::Scalar(value.clone()),
        }
    }

    pub fn is_stub(&self) -> bool {
        matches!(self, FieldValue::Stub(_))
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Scalar(v) => v.clone(),
            FieldValue::Stub(pid) => json!({ "id": pid }),
            FieldValue::Resolved(r) => r.to_json(),
        }
    }
}

/// JSON pointer for a dotted metadata path
fn pointer(path: &str) -> String {
    path.split('.')
        .map(|seg| seg.replace('~', "~0").replace('/', "~1"))
        .fold(String::new(), |mut acc, seg| {
            acc.push('/');
            acc.push_str(&seg);
            acc
        })
}

/// Read-time relation dereferencing
pub struct RelationResolver {
    catalog: Arc<RelationCatalog>,
    max_depth: usize,
}

impl RelationResolver {
    /// `max_depth` counts relation levels: 1 resolves direct relations only,
    /// 2 also resolves the relations of each referenced record.
    pub fn new(catalog: Arc<RelationCatalog>, max_depth: usize) -> Self {
        Self { catalog, max_depth }
    }

    pub fn catalog(&self) -> &Arc<RelationCatalog> {
        &self.catalog
    }

    /// Projection of `record` with its relation stubs dereferenced
    ///
    /// Stubs that cannot be resolved (missing record, unknown store, store
    /// failure) are left as they are.
    pub async fn resolve(&self, record: &Record) -> Record {
        let mut projection = record.clone();
        projection.metadata = self
            .resolve_metadata(&record.record_type, record.metadata.clone(), self.max_depth)
            .await;
        projection
    }

    fn resolve_metadata<'a>(
        &'a self,
        record_type: &'a str,
        mut metadata: Value,
        depth: usize,
    ) -> BoxFuture<'a, Value> {
        async move {
            if depth == 0 {
                return metadata;
            }
            let Some(declaration) = self.catalog.declaration(record_type) else {
                return metadata;
            };

            for (relation_type, paths) in declaration.iter() {
                let Some(store) = self.catalog.store(relation_type) else {
                    debug!(relation_type, "No store registered, relations left unresolved");
                    continue;
                };

                for path in paths {
                    let ptr = pointer(path);
                    let Some(current) = metadata.pointer(&ptr).cloned() else {
                        continue;
                    };

                    let replaced = match current {
                        Value::Array(items) => {
                            let mut out = Vec::with_capacity(items.len());
                            for item in items {
                                out.push(self.resolve_field(&store, relation_type, item, depth).await);
                            }
                            Value::Array(out)
                        }
                        other => self.resolve_field(&store, relation_type, other, depth).await,
                    };

                    if let Some(slot) = metadata.pointer_mut(&ptr) {
                        *slot = replaced;
                    }
                }
            }
            metadata
        }
        .boxed()
    }

    async fn resolve_field(
        &self,
        store: &Arc<dyn RecordStore>,
        relation_type: &str,
        value: Value,
        depth: usize,
    ) -> Value {
        let FieldValue::Stub(pid) = FieldValue::classify(&value) else {
            return value;
        };

        match store.resolve(&pid).await {
            Ok(referenced) => {
                let metadata = self
                    .resolve_metadata(relation_type, referenced.metadata, depth - 1)
                    .await;
                FieldValue::Resolved(ResolvedRelation {
                    pid: referenced.pid,
                    id: referenced.id,
                    revision_id: referenced.revision_id,
                    metadata,
                })
                .to_json()
            }
            Err(e) => {
                warn!(
                    relation_type,
                    pid = %pid,
                    error = %e,
                    "Relation could not be resolved, keeping stub"
                );
                value
            }
        }
    }
}

/// Strip resolved relations back to stubs
///
/// Used when a client sends back a previously read projection.
pub fn dereference_to_stubs(declaration: &RelationDeclaration, metadata: &mut Value) {
    for (_, paths) in declaration.iter() {
        for path in paths {
            let Some(slot) = metadata.pointer_mut(&pointer(path)) else {
                continue;
            };
            match slot {
                Value::Array(items) => items.iter_mut().for_each(to_stub),
                other => to_stub(other),
            }
        }
    }
}

fn to_stub(value: &mut Value) {
    if let Value::Object(map) = value {
        if map.contains_key(VERSION_KEY) {
            if let Some(id) = map.get("id").cloned() {
                let mut stub = Map::new();
                stub.insert("id".to_string(), id);
                *value = Value::Object(stub);
            }
        }
    }
}
