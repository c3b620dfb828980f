//! Real-time document store abstraction.
//!
//! Collections of JSON documents with equality queries, ordered/limited
//! result sets, field-level update operations and live change-feeds. The
//! shape follows hosted document databases so the chat services above it can
//! run against the in-process [`MemoryStore`] or a remote backend.

mod memory;
mod value;

pub use memory::MemoryStore;
pub use value::{compare_values, FieldPath};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use parley_shared::{ChatError, Result};

use crate::subscription::Subscription;

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    /// Bumped on every write; used for optimistic preconditions.
    pub version: u64,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub data: Map<String, Value>,
}

impl Document {
    pub fn get(&self, path: impl Into<FieldPath>) -> Option<&Value> {
        value::get_path(&self.data, &path.into())
    }

    /// Decode the document body into a typed shape.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|e| {
            ChatError::Protocol(format!("document {} could not be decoded: {e}", self.id))
        })
    }
}

/// Serialize a typed shape into a document body.
pub fn to_data<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(ChatError::Protocol(format!(
            "document body must be an object, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches the document with this id.
    Id(String),
    Eq(FieldPath, Value),
    /// Field is an array containing the value.
    ArrayContains(FieldPath, Value),
}

impl Filter {
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Id(id) => &doc.id == id,
            Filter::Eq(path, expected) => doc.get(path.clone()) == Some(expected),
            Filter::ArrayContains(path, expected) => match doc.get(path.clone()) {
                Some(Value::Array(items)) => items.contains(expected),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

/// A query over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn where_id(mut self, id: impl Into<String>) -> Self {
        self.filters.push(Filter::Id(id.into()));
        self
    }

    pub fn where_eq(mut self, field: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.into(), value.into()));
        self
    }

    pub fn where_array_contains(
        mut self,
        field: impl Into<FieldPath>,
        value: impl Into<Value>,
    ) -> Self {
        self.filters
            .push(Filter::ArrayContains(field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<FieldPath>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document belongs to the result set, ignoring the limit.
    ///
    /// Ordered queries only return documents that carry the order field.
    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(order) = &self.order_by {
            if doc.get(order.field.clone()).is_none() {
                return false;
            }
        }
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Filter, order and limit a set of documents.
    pub fn apply<'a>(&self, docs: impl Iterator<Item = &'a Document>) -> Vec<Document> {
        let mut result: Vec<Document> = docs.filter(|d| self.matches(d)).cloned().collect();

        if let Some(order) = &self.order_by {
            result.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(order.field.clone()).unwrap_or(&Value::Null),
                    b.get(order.field.clone()).unwrap_or(&Value::Null),
                )
                .then_with(|| a.id.cmp(&b.id));
                match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            result.truncate(limit);
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// A field-level write applied by [`DocumentStore::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Set(Value),
    Delete,
    /// Append the values not already present.
    ArrayUnion(Vec<Value>),
    /// Remove every occurrence of the values.
    ArrayRemove(Vec<Value>),
    Increment(i64),
}

impl FieldOp {
    pub fn set(value: impl Into<Value>) -> Self {
        FieldOp::Set(value.into())
    }

    pub fn union(value: impl Into<Value>) -> Self {
        FieldOp::ArrayUnion(vec![value.into()])
    }

    pub fn remove(value: impl Into<Value>) -> Self {
        FieldOp::ArrayRemove(vec![value.into()])
    }
}

pub type Update = Vec<(FieldPath, FieldOp)>;

/// Condition that must hold for an update to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precondition {
    #[default]
    Exists,
    /// The document must still be at this version.
    Version(u64),
}

// ---------------------------------------------------------------------------
// Change feeds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

/// Full result of a live query plus what changed since the previous snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    pub documents: Vec<Document>,
    pub changes: Vec<DocumentChange>,
}

impl QuerySnapshot {
    pub fn added(&self) -> impl Iterator<Item = &Document> {
        self.changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Added)
            .map(|c| &c.document)
    }
}

pub type SnapshotListener = Box<dyn FnMut(Result<QuerySnapshot>) + Send + 'static>;
pub type DocumentListener = Box<dyn FnMut(Result<Option<Document>>) + Send + 'static>;

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Create or overwrite a document.
    async fn set(&self, collection: &str, id: &str, data: Map<String, Value>) -> Result<Document>;

    /// Create a document; fails with [`ChatError::Conflict`] if it exists.
    async fn create(&self, collection: &str, id: &str, data: Map<String, Value>)
        -> Result<Document>;

    /// Create a document under a generated id.
    async fn add(&self, collection: &str, data: Map<String, Value>) -> Result<Document>;

    /// Apply field operations to an existing document.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        update: Update,
        precondition: Precondition,
    ) -> Result<Document>;

    /// Delete a document. Deleting a missing document is not an error.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>>;

    /// Open a live query. The listener receives the current result first,
    /// then one snapshot per write that changes the result.
    fn listen(&self, query: Query, listener: SnapshotListener) -> Subscription;

    /// Watch a single document; `None` while it does not exist.
    fn listen_document(
        &self,
        collection: &str,
        id: &str,
        mut listener: DocumentListener,
    ) -> Subscription {
        self.listen(
            Query::collection(collection).where_id(id),
            Box::new(move |result| {
                listener(result.map(|snapshot| snapshot.documents.into_iter().next()))
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, data: Value) -> Document {
        let Value::Object(data) = data else {
            panic!("object expected")
        };
        Document {
            id: id.into(),
            version: 1,
            create_time: Utc::now(),
            update_time: Utc::now(),
            data,
        }
    }

    #[test]
    fn test_query_filters_orders_and_limits() {
        let docs = vec![
            doc("a", json!({"n": 1, "kind": "x"})),
            doc("b", json!({"n": 3, "kind": "x"})),
            doc("c", json!({"n": 2, "kind": "y"})),
            doc("d", json!({"kind": "x"})),
            doc("e", json!({"n": 5, "kind": "x"})),
        ];
        let q = Query::collection("c")
            .where_eq("kind", "x")
            .order_by("n", Direction::Descending)
            .limit(2);
        let ids: Vec<_> = q.apply(docs.iter()).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["e", "b"]);
    }

    #[test]
    fn test_array_contains() {
        let d = doc("a", json!({"participantIds": ["u1", "u2"]}));
        assert!(Filter::ArrayContains("participantIds".into(), json!("u2")).matches(&d));
        assert!(!Filter::ArrayContains("participantIds".into(), json!("u3")).matches(&d));
    }

    #[test]
    fn test_to_data_rejects_non_objects() {
        assert!(to_data(&json!({"a": 1})).is_ok());
        assert!(matches!(to_data(&json!([1, 2])), Err(ChatError::Protocol(_))));
    }
}
