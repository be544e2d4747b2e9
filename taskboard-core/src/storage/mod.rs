pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// Field map of a remote document.
pub type Fields = Map<String, Value>;

/// A remote document: store-assigned id plus its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Slash-separated collection path, e.g. `tasks` or `tasks/{id}/editors`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn categories() -> Self {
        Self::new("categories")
    }

    pub fn tasks() -> Self {
        Self::new("tasks")
    }

    pub fn task_editors(task_id: &str) -> Self {
        Self(format!("tasks/{}/editors", task_id))
    }

    pub fn category_presence(category_id: &str) -> Self {
        Self(format!("categories/{}/presence", category_id))
    }

    pub fn category_activities(category_id: &str) -> Self {
        Self(format!("categories/{}/activities", category_id))
    }

    pub fn user_presence() -> Self {
        Self::new("presence")
    }

    pub fn doc(&self, id: impl Into<String>) -> DocumentPath {
        DocumentPath {
            collection: self.clone(),
            id: id.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    pub collection: CollectionPath,
    pub id: String,
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Predicate of a live or one-shot query.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq { field: String, value: Value },
    ArrayContains { field: String, value: Value },
}

impl Filter {
    pub fn matches(&self, fields: &Fields) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { field, value } => fields.get(field) == Some(value),
            Filter::ArrayContains { field, value } => fields
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: CollectionPath,
    pub filter: Filter,
}

impl Query {
    pub fn all(collection: CollectionPath) -> Self {
        Self {
            collection,
            filter: Filter::All,
        }
    }

    pub fn where_eq(collection: CollectionPath, field: &str, value: impl Into<Value>) -> Self {
        Self {
            collection,
            filter: Filter::Eq {
                field: field.to_string(),
                value: value.into(),
            },
        }
    }

    pub fn where_array_contains(
        collection: CollectionPath,
        field: &str,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            collection,
            filter: Filter::ArrayContains {
                field: field.to_string(),
                value: value.into(),
            },
        }
    }

    pub fn matches(&self, collection: &CollectionPath, fields: &Fields) -> bool {
        &self.collection == collection && self.filter.matches(fields)
    }
}

/// One per-field operation of an update.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Set(Value),
    Delete,
    /// Append each value not already present.
    ArrayUnion(Vec<Value>),
    /// Remove every occurrence of each value.
    ArrayRemove(Vec<Value>),
}

/// Sparse set of field operations applied atomically to one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSet {
    ops: BTreeMap<String, FieldOp>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.ops.insert(field.to_string(), FieldOp::Set(value.into()));
        self
    }

    pub fn delete(mut self, field: &str) -> Self {
        self.ops.insert(field.to_string(), FieldOp::Delete);
        self
    }

    pub fn array_union(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.ops
            .insert(field.to_string(), FieldOp::ArrayUnion(vec![value.into()]));
        self
    }

    pub fn array_remove(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.ops
            .insert(field.to_string(), FieldOp::ArrayRemove(vec![value.into()]));
        self
    }

    /// Later operations on the same field replace earlier ones.
    pub fn extend(&mut self, other: FieldSet) {
        self.ops.extend(other.ops);
    }

    pub fn get(&self, field: &str) -> Option<&FieldOp> {
        self.ops.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldOp)> {
        self.ops.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn apply_to(&self, fields: &mut Fields) {
        for (field, op) in &self.ops {
            match op {
                FieldOp::Set(value) => {
                    fields.insert(field.clone(), value.clone());
                }
                FieldOp::Delete => {
                    fields.remove(field);
                }
                FieldOp::ArrayUnion(values) => {
                    let entry = fields
                        .entry(field.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if !entry.is_array() {
                        *entry = Value::Array(Vec::new());
                    }
                    if let Value::Array(items) = entry {
                        for value in values {
                            if !items.contains(value) {
                                items.push(value.clone());
                            }
                        }
                    }
                }
                FieldOp::ArrayRemove(values) => {
                    if let Some(Value::Array(items)) = fields.get_mut(field) {
                        items.retain(|item| !values.contains(item));
                    }
                }
            }
        }
    }
}

/// Upserts and removals delivered together by one subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub upserts: Vec<Document>,
    pub removals: Vec<String>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Changes(ChangeBatch),
    Error(StoreError),
}

/// Live query handle. Events arrive in the order the store emitted them;
/// cancelling (or dropping) the handle ends the stream.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.cancel.is_none())
            .finish()
    }
}

impl Subscription {
    pub fn new(
        events: mpsc::UnboundedReceiver<SubscriptionEvent>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next event, or `None` once the subscription is cancelled or the
    /// store side has gone away.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Remote store closed")]
    Closed,
}

/// Capability of the remote document store.
/// Implementations: MemoryStore (in-process); a networked backend lives
/// outside this crate.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Open a live, predicate-filtered query. The first batch carries every
    /// current match.
    fn subscribe(&self, query: Query) -> Result<Subscription, StoreError>;

    /// Id for a document about to be created in `collection`.
    fn allocate_id(&self, collection: &CollectionPath) -> String;

    async fn read_once(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Create or replace a document.
    async fn set(&self, path: &DocumentPath, fields: Fields) -> Result<(), StoreError>;

    /// Apply field operations to an existing document.
    async fn update(&self, path: &DocumentPath, changes: FieldSet) -> Result<(), StoreError>;

    async fn delete(&self, path: &DocumentPath) -> Result<(), StoreError>;
}
