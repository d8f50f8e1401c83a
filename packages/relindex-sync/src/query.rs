//! Structured search queries
//!
//! A small boolean query model with an Elasticsearch-shaped JSON rendering
//! (`to_json`) and a reference evaluator (`matches`) used by the in-memory
//! index.
//!
//! Field paths are dotted (`metadata.inner_record.@v`). When a path walks
//! through an array, the query matches if any element matches.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    MatchAll,
    Term {
        field: String,
        value: Value,
    },
    Prefix {
        field: String,
        prefix: String,
    },
    Range {
        field: String,
        bounds: RangeBounds,
    },
    Ids(Vec<Uuid>),
    /// Whitespace-separated terms, each of which must occur
    /// (case-insensitively) in some string value of the document
    QueryString(String),
    Bool(BoolQuery),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeBounds {
    pub gt: Option<Value>,
    pub gte: Option<Value>,
    pub lt: Option<Value>,
    pub lte: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoolQuery {
    pub must: Vec<Query>,
    pub should: Vec<Query>,
    pub must_not: Vec<Query>,
    pub filter: Vec<Query>,
    /// Defaults to 1 when there is no `must`/`filter` clause, else 0
    pub minimum_should_match: Option<usize>,
}

impl BoolQuery {
    pub fn must(mut self, q: Query) -> Self {
        self.must.push(q);
        self
    }

    pub fn should(mut self, q: Query) -> Self {
        self.should.push(q);
        self
    }

    pub fn must_not(mut self, q: Query) -> Self {
        self.must_not.push(q);
        self
    }

    pub fn filter(mut self, q: Query) -> Self {
        self.filter.push(q);
        self
    }

    pub fn minimum_should_match(mut self, n: usize) -> Self {
        self.minimum_should_match = Some(n);
        self
    }

    fn effective_minimum_should_match(&self) -> usize {
        self.minimum_should_match.unwrap_or({
            if self.must.is_empty() && self.filter.is_empty() && !self.should.is_empty() {
                1
            } else {
                0
            }
        })
    }
}

impl From<BoolQuery> for Query {
    fn from(b: BoolQuery) -> Self {
        Query::Bool(b)
    }
}

impl Query {
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn prefix(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Query::Prefix {
            field: field.into(),
            prefix: prefix.into(),
        }
    }

    pub fn range(field: impl Into<String>, bounds: RangeBounds) -> Self {
        Query::Range {
            field: field.into(),
            bounds,
        }
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::range(
            field,
            RangeBounds {
                lte: Some(value.into()),
                ..Default::default()
            },
        )
    }

    pub fn query_string(q: impl Into<String>) -> Self {
        Query::QueryString(q.into())
    }

    /// Clauses of a top-level `should`, or 0 for any other query
    pub fn should_len(&self) -> usize {
        match self {
            Query::Bool(b) => b.should.len(),
            _ => 0,
        }
    }

    /// Elasticsearch-style rendering
    pub fn to_json(&self) -> Value {
        match self {
            Query::MatchAll => json!({"match_all": {}}),
            Query::Term { field, value } => json!({"term": {field.as_str(): value}}),
            Query::Prefix { field, prefix } => json!({"prefix": {field.as_str(): prefix}}),
            Query::Range { field, bounds } => {
                let mut b = Map::new();
                for (key, bound) in [
                    ("gt", &bounds.gt),
                    ("gte", &bounds.gte),
                    ("lt", &bounds.lt),
                    ("lte", &bounds.lte),
                ] {
                    if let Some(v) = bound {
                        b.insert(key.to_string(), v.clone());
                    }
                }
                json!({"range": {field.as_str(): b}})
            }
            Query::Ids(ids) => {
                let values: Vec<String> = ids.iter().map(Uuid::to_string).collect();
                json!({"ids": {"values": values}})
            }
            Query::QueryString(q) => json!({"query_string": {"query": q}}),
            Query::Bool(b) => {
                let mut body = Map::new();
                for (key, clauses) in [
                    ("must", &b.must),
                    ("should", &b.should),
                    ("must_not", &b.must_not),
                    ("filter", &b.filter),
                ] {
                    if !clauses.is_empty() {
                        body.insert(
                            key.to_string(),
                            Value::Array(clauses.iter().map(Query::to_json).collect()),
                        );
                    }
                }
                if let Some(n) = b.minimum_should_match {
                    body.insert("minimum_should_match".to_string(), json!(n));
                }
                json!({ "bool": body })
            }
        }
    }

    /// Evaluate against one document
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Query::MatchAll => true,
            Query::Term { field, value } => lookup(doc, field).into_iter().any(|v| v == value),
            Query::Prefix { field, prefix } => lookup(doc, field)
                .into_iter()
                .any(|v| v.as_str().is_some_and(|s| s.starts_with(prefix.as_str()))),
            Query::Range { field, bounds } => {
                lookup(doc, field).into_iter().any(|v| bounds.contains(v))
            }
            Query::Ids(ids) => doc
                .get("uuid")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .is_some_and(|id| ids.contains(&id)),
            Query::QueryString(q) => {
                let mut haystack = Vec::new();
                collect_strings(doc, &mut haystack);
                q.split_whitespace().all(|term| {
                    let term = term.to_lowercase();
                    haystack.iter().any(|s| s.contains(&term))
                })
            }
            Query::Bool(b) => {
                b.must.iter().all(|q| q.matches(doc))
                    && b.filter.iter().all(|q| q.matches(doc))
                    && !b.must_not.iter().any(|q| q.matches(doc))
                    && b.should.iter().filter(|q| q.matches(doc)).count()
                        >= b.effective_minimum_should_match()
            }
        }
    }
}

impl RangeBounds {
    fn contains(&self, v: &Value) -> bool {
        let check = |bound: &Option<Value>, ok: fn(Ordering) -> bool| match bound {
            None => true,
            Some(b) => compare(v, b).is_some_and(ok),
        };
        check(&self.gt, |o| o == Ordering::Greater)
            && check(&self.gte, |o| o != Ordering::Less)
            && check(&self.lt, |o| o == Ordering::Less)
            && check(&self.lte, |o| o != Ordering::Greater)
    }
}

/// Numbers compare numerically, strings lexicographically (RFC 3339
/// timestamps with a fixed precision sort correctly that way)
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// All leaf values reached by a dotted path
pub(crate) fn lookup<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => {
                    if let Some(v) = map.get(segment) {
                        next.push(v);
                    }
                }
                Value::Array(items) => {
                    for item in items {
                        if let Some(v) = item.get(segment) {
                            next.push(v);
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }

    current
        .into_iter()
        .flat_map(|v| match v {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        })
        .collect()
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.to_lowercase()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}
