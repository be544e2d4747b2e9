/// In-process remote store.
///
/// Behaves like the hosted document store the client talks to:
/// - per-document atomic writes, ids allocated by the store
/// - live queries with ordered per-subscriber delivery (initial batch first)
/// - failure injection per document, per collection and for reads
/// - optional write latency, so writes can be observed "in flight"
/// - a journal of every write attempt for assertions
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    ChangeBatch, CollectionPath, Document, DocumentPath, FieldSet, Fields, Query, RemoteStore,
    StoreError, Subscription, SubscriptionEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Set,
    Update,
    Delete,
}

/// One attempted write, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub kind: WriteKind,
    pub path: DocumentPath,
    pub set_fields: Option<Fields>,
    pub changes: Option<FieldSet>,
    pub succeeded: bool,
}

struct Subscriber {
    query: Query,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
    /// ids currently matching, so a field change that drops out of the
    /// predicate is reported as a removal
    visible: BTreeSet<String>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<CollectionPath, BTreeMap<String, Fields>>,
    subscribers: BTreeMap<u64, Subscriber>,
    next_subscriber: u64,
    failing_docs: HashSet<DocumentPath>,
    failing_collections: HashSet<CollectionPath>,
    fail_reads: bool,
    fail_subscribe: bool,
    journal: Vec<JournalEntry>,
}

impl Inner {
    fn write_fails(&self, path: &DocumentPath) -> bool {
        self.failing_docs.contains(path) || self.failing_collections.contains(&path.collection)
    }

    /// Replace (or remove, for `None`) a document and notify subscribers
    /// whose view of it changed.
    fn commit(&mut self, path: &DocumentPath, next: Option<Fields>) {
        let collection = self.collections.entry(path.collection.clone()).or_default();
        let previous = match &next {
            Some(fields) => collection.insert(path.id.clone(), fields.clone()),
            None => collection.remove(&path.id),
        };
        if previous == next {
            return;
        }

        let mut closed = Vec::new();
        for (sub_id, sub) in self.subscribers.iter_mut() {
            if sub.query.collection != path.collection {
                continue;
            }
            let matches = next
                .as_ref()
                .is_some_and(|fields| sub.query.filter.matches(fields));
            let batch = if matches {
                sub.visible.insert(path.id.clone());
                ChangeBatch {
                    upserts: vec![Document::new(path.id.clone(), next.clone().unwrap_or_default())],
                    removals: Vec::new(),
                }
            } else if sub.visible.remove(&path.id) {
                ChangeBatch {
                    upserts: Vec::new(),
                    removals: vec![path.id.clone()],
                }
            } else {
                continue;
            };
            if sub.tx.send(SubscriptionEvent::Changes(batch)).is_err() {
                closed.push(*sub_id);
            }
        }
        for sub_id in closed {
            self.subscribers.remove(&sub_id);
        }
    }
}

/// In-memory implementation of [`RemoteStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    latency: Arc<Mutex<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delay applied before every write lands.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    fn latency(&self) -> Duration {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write a document directly, bypassing latency and failure rules.
    pub fn seed(&self, path: &DocumentPath, fields: Fields) {
        self.lock().commit(path, Some(fields));
    }

    pub fn document(&self, path: &DocumentPath) -> Option<Fields> {
        self.lock()
            .collections
            .get(&path.collection)
            .and_then(|docs| docs.get(&path.id))
            .cloned()
    }

    pub fn documents(&self, collection: &CollectionPath) -> Vec<Document> {
        self.lock()
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Make every write to `path` fail with `Unavailable`.
    pub fn fail_writes_to(&self, path: &DocumentPath) {
        self.lock().failing_docs.insert(path.clone());
    }

    /// Make every write into `collection` fail with `Unavailable`.
    pub fn fail_collection_writes(&self, collection: &CollectionPath) {
        self.lock().failing_collections.insert(collection.clone());
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failing_docs.clear();
        inner.failing_collections.clear();
        inner.fail_reads = false;
        inner.fail_subscribe = false;
    }

    /// Deliver an error event to every live query over `collection`.
    pub fn inject_subscription_error(&self, collection: &CollectionPath, error: StoreError) {
        let inner = self.lock();
        for sub in inner.subscribers.values() {
            if &sub.query.collection == collection {
                let _ = sub.tx.send(SubscriptionEvent::Error(error.clone()));
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    /// Journal entries targeting one document.
    pub fn writes_to(&self, path: &DocumentPath) -> Vec<JournalEntry> {
        self.lock()
            .journal
            .iter()
            .filter(|entry| &entry.path == path)
            .cloned()
            .collect()
    }

    async fn simulate_latency(&self) {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

fn remove_subscriber(inner: &Weak<Mutex<Inner>>, sub_id: u64) {
    if let Some(inner) = inner.upgrade() {
        inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .remove(&sub_id);
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        let mut inner = self.lock();
        if inner.fail_subscribe {
            return Err(StoreError::Unavailable(format!(
                "subscribe to {}",
                query.collection
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let initial: Vec<Document> = inner
            .collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, fields)| query.filter.matches(fields))
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let visible = initial.iter().map(|doc| doc.id.clone()).collect();
        let _ = tx.send(SubscriptionEvent::Changes(ChangeBatch {
            upserts: initial,
            removals: Vec::new(),
        }));

        let sub_id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(
            sub_id,
            Subscriber {
                query,
                tx,
                visible,
            },
        );

        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || remove_subscriber(&weak, sub_id)))
    }

    fn allocate_id(&self, _collection: &CollectionPath) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    async fn read_once(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let inner = self.lock();
        if inner.fail_reads {
            return Err(StoreError::Unavailable(format!("read {}", query.collection)));
        }
        Ok(inner
            .collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, fields)| query.filter.matches(fields))
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set(&self, path: &DocumentPath, fields: Fields) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        let fails = inner.write_fails(path);
        inner.journal.push(JournalEntry {
            kind: WriteKind::Set,
            path: path.clone(),
            set_fields: Some(fields.clone()),
            changes: None,
            succeeded: !fails,
        });
        if fails {
            return Err(StoreError::Unavailable(format!("set {}", path)));
        }
        inner.commit(path, Some(fields));
        Ok(())
    }

    async fn update(&self, path: &DocumentPath, changes: FieldSet) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        let existing = inner
            .collections
            .get(&path.collection)
            .and_then(|docs| docs.get(&path.id))
            .cloned();
        let fails = inner.write_fails(path);
        inner.journal.push(JournalEntry {
            kind: WriteKind::Update,
            path: path.clone(),
            set_fields: None,
            changes: Some(changes.clone()),
            succeeded: !fails && existing.is_some(),
        });
        if fails {
            return Err(StoreError::Unavailable(format!("update {}", path)));
        }
        let mut fields = existing.ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        changes.apply_to(&mut fields);
        inner.commit(path, Some(fields));
        Ok(())
    }

    async fn delete(&self, path: &DocumentPath) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        let fails = inner.write_fails(path);
        inner.journal.push(JournalEntry {
            kind: WriteKind::Delete,
            path: path.clone(),
            set_fields: None,
            changes: None,
            succeeded: !fails,
        });
        if fails {
            return Err(StoreError::Unavailable(format!("delete {}", path)));
        }
        inner.commit(path, None);
        Ok(())
    }
}
