/// Live feeds that pump store subscriptions into merge caches.
///
/// Each subscription gets its own pump task so its events are applied in the
/// order the store emitted them. Subscription errors keep the last good
/// snapshot and are reported on a broadcast channel.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::cache::{SharedCache, SourceBatch};
use crate::session::UserSession;
use crate::storage::{
    ChangeBatch, CollectionPath, Query, RemoteStore, StoreError, Subscription, SubscriptionEvent,
};
use crate::types::{Category, Entity, FromDocument, Task};

/// Source key of the category cache. Owned sorts first, so it wins when both
/// maps hold a diverged copy of the same category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DualSource {
    Owned,
    Shared,
}

impl DualSource {
    pub fn label(self) -> &'static str {
        match self {
            DualSource::Owned => "categories/owned",
            DualSource::Shared => "categories/shared",
        }
    }
}

/// A live query failed; the affected cache keeps its last snapshot.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Subscription {origin} failed: {error}")]
pub struct FeedError {
    pub origin: String,
    pub error: StoreError,
}

/// Decode a store batch, skipping documents that fail to decode.
pub(crate) fn decode_batch<T: FromDocument>(batch: ChangeBatch, origin: &str) -> SourceBatch<T> {
    let upserts = batch
        .upserts
        .iter()
        .filter_map(|doc| match T::from_document(doc) {
            Ok(entity) => Some(entity),
            Err(e) => {
                log::warn!(target: "taskboard.merge", "[{}] Skipping document: {}", origin, e);
                None
            }
        })
        .collect();
    SourceBatch {
        upserts,
        removals: batch.removals,
    }
}

/// Apply one subscription's events to `source` until the stream ends.
/// Batches are dropped once `live` is cleared, so a retired source cannot be
/// resurrected by a late delivery.
async fn pump<K, T>(
    source: K,
    mut subscription: Subscription,
    cache: SharedCache<K, T>,
    errors: broadcast::Sender<FeedError>,
    origin: String,
    live: Arc<AtomicBool>,
) where
    K: Ord + Clone + Send + Sync + 'static,
    T: Entity + FromDocument,
{
    log::debug!(target: "taskboard.merge", "[{}] Feed started", origin);
    while let Some(event) = subscription.next().await {
        match event {
            SubscriptionEvent::Changes(batch) => {
                let batch = decode_batch::<T>(batch, &origin);
                let changed = cache.mutate(|c| {
                    live.load(Ordering::SeqCst) && c.apply_batch(source.clone(), batch)
                });
                if changed {
                    log::debug!(target: "taskboard.merge", "[{}] Snapshot updated", origin);
                }
            }
            SubscriptionEvent::Error(error) => {
                log::warn!(
                    target: "taskboard.merge",
                    "[{}] Subscription error, keeping last snapshot: {}",
                    origin,
                    error
                );
                let _ = errors.send(FeedError {
                    origin: origin.clone(),
                    error,
                });
            }
        }
    }
    log::debug!(target: "taskboard.merge", "[{}] Feed ended", origin);
}

fn owned_query(session: &UserSession) -> Query {
    Query::where_eq(CollectionPath::categories(), "createdBy", session.user_id())
}

fn shared_query(session: &UserSession) -> Option<Query> {
    session
        .email()
        .map(|email| Query::where_array_contains(CollectionPath::categories(), "sharedWith", email))
}

fn tasks_query(category_id: &str) -> Query {
    Query::where_eq(CollectionPath::tasks(), "categoryId", category_id)
}

/// Categories visible to the signed-in user: the ones they created plus the
/// ones shared with their email.
pub struct CategoryFeed {
    session: UserSession,
    store: Arc<dyn RemoteStore>,
    cache: SharedCache<DualSource, Category>,
    pumps: Vec<JoinHandle<()>>,
}

impl CategoryFeed {
    pub fn start(
        session: UserSession,
        store: Arc<dyn RemoteStore>,
        cache: SharedCache<DualSource, Category>,
        errors: broadcast::Sender<FeedError>,
    ) -> Result<Self, StoreError> {
        let mut queries = vec![(DualSource::Owned, owned_query(&session))];
        match shared_query(&session) {
            Some(query) => queries.push((DualSource::Shared, query)),
            None => log::info!(
                target: "taskboard.merge",
                "No email on session for {}, shared categories disabled",
                session.user_id()
            ),
        }

        let mut pumps = Vec::with_capacity(queries.len());
        for (source, query) in queries {
            let subscription = match store.subscribe(query) {
                Ok(subscription) => subscription,
                Err(e) => {
                    pumps.iter().for_each(JoinHandle::abort);
                    return Err(e);
                }
            };
            pumps.push(tokio::spawn(pump(
                source,
                subscription,
                cache.clone(),
                errors.clone(),
                source.label().to_string(),
                Arc::new(AtomicBool::new(true)),
            )));
        }

        log::info!(
            target: "taskboard.merge",
            "Category feed started for {} ({} sources)",
            session.user_id(),
            pumps.len()
        );
        Ok(Self {
            session,
            store,
            cache,
            pumps,
        })
    }

    pub fn cache(&self) -> &SharedCache<DualSource, Category> {
        &self.cache
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Category>>> {
        self.cache.subscribe()
    }

    /// Re-read both predicates once and replace the source maps. Used to
    /// reconcile after subscription or write failures.
    pub async fn resync(&self) -> Result<(), StoreError> {
        let owned = self.store.read_once(&owned_query(&self.session)).await?;
        let shared = match shared_query(&self.session) {
            Some(query) => Some(self.store.read_once(&query).await?),
            None => None,
        };

        let owned = decode_batch::<Category>(ChangeBatch { upserts: owned, removals: vec![] }, "resync");
        let shared = shared.map(|docs| {
            decode_batch::<Category>(ChangeBatch { upserts: docs, removals: vec![] }, "resync")
        });
        self.cache.mutate(|c| {
            c.replace_source(DualSource::Owned, owned.upserts);
            if let Some(shared) = shared {
                c.replace_source(DualSource::Shared, shared.upserts);
            }
        });
        log::info!(target: "taskboard.merge", "Categories resynced for {}", self.session.user_id());
        Ok(())
    }

    pub fn stop(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

impl Drop for CategoryFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Per-category task subscriptions, aborted together when dropped.
#[derive(Default)]
struct Forwarders {
    by_category: HashMap<String, (Arc<AtomicBool>, JoinHandle<()>)>,
}

impl Forwarders {
    fn retire(&mut self, category_id: &str) -> bool {
        match self.by_category.remove(category_id) {
            Some((live, handle)) => {
                live.store(false, Ordering::SeqCst);
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Forwarders {
    fn drop(&mut self) {
        for (live, handle) in self.by_category.values() {
            live.store(false, Ordering::SeqCst);
            handle.abort();
        }
    }
}

/// Tasks of every visible category: one cache source per category, following
/// the category snapshot as categories appear and disappear.
pub struct TaskFeed {
    cache: SharedCache<String, Task>,
    driver: JoinHandle<()>,
}

impl TaskFeed {
    pub fn start(
        store: Arc<dyn RemoteStore>,
        categories: watch::Receiver<Arc<Vec<Category>>>,
        cache: SharedCache<String, Task>,
        errors: broadcast::Sender<FeedError>,
    ) -> Self {
        let driver = tokio::spawn(Self::follow(store, categories, cache.clone(), errors));
        Self { cache, driver }
    }

    pub fn cache(&self) -> &SharedCache<String, Task> {
        &self.cache
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Task>>> {
        self.cache.subscribe()
    }

    async fn follow(
        store: Arc<dyn RemoteStore>,
        mut categories: watch::Receiver<Arc<Vec<Category>>>,
        cache: SharedCache<String, Task>,
        errors: broadcast::Sender<FeedError>,
    ) {
        let mut forwarders = Forwarders::default();
        loop {
            let visible = categories.borrow_and_update().clone();
            Self::reconcile(&store, &visible, &cache, &errors, &mut forwarders);
            if categories.changed().await.is_err() {
                break;
            }
        }
        log::debug!(target: "taskboard.merge", "Task feed stopped");
    }

    fn reconcile(
        store: &Arc<dyn RemoteStore>,
        visible: &[Category],
        cache: &SharedCache<String, Task>,
        errors: &broadcast::Sender<FeedError>,
        forwarders: &mut Forwarders,
    ) {
        let stale: Vec<String> = forwarders
            .by_category
            .keys()
            .filter(|id| !visible.iter().any(|c| c.id() == id.as_str()))
            .cloned()
            .collect();
        for category_id in stale {
            forwarders.retire(&category_id);
            cache.mutate(|c| c.drop_source(&category_id));
            log::debug!(target: "taskboard.merge", "Stopped tasks feed for category {}", category_id);
        }

        for category in visible {
            if forwarders.by_category.contains_key(&category.id) {
                continue;
            }
            let origin = format!("tasks/{}", category.id);
            match store.subscribe(tasks_query(&category.id)) {
                Ok(subscription) => {
                    let live = Arc::new(AtomicBool::new(true));
                    let handle = tokio::spawn(pump(
                        category.id.clone(),
                        subscription,
                        cache.clone(),
                        errors.clone(),
                        origin,
                        live.clone(),
                    ));
                    forwarders
                        .by_category
                        .insert(category.id.clone(), (live, handle));
                }
                Err(error) => {
                    // Retried on the next category snapshot.
                    log::warn!(target: "taskboard.merge", "[{}] Subscribe failed: {}", origin, error);
                    let _ = errors.send(FeedError { origin, error });
                }
            }
        }
    }
}

impl Drop for TaskFeed {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SyncConfig, UserIdentity};
    use crate::storage::memory::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn session(id: &str, email: &str) -> UserSession {
        UserSession::new(
            UserIdentity::new(id, id.to_uppercase(), Some(email.to_string())),
            SyncConfig::default(),
        )
    }

    fn seed_category(store: &MemoryStore, id: &str, owner: &str, shared: &[&str]) {
        store.seed(
            &CollectionPath::categories().doc(id),
            json!({ "name": id, "createdBy": owner, "sharedWith": shared })
                .as_object()
                .cloned()
                .unwrap(),
        );
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn ids<T: Entity>(items: &[T]) -> Vec<String> {
        items.iter().map(|i| i.id().to_string()).collect()
    }

    #[tokio::test]
    async fn owned_and_shared_categories_merge_once() {
        let store = MemoryStore::new();
        seed_category(&store, "c1", "u", &[]);
        seed_category(&store, "c2", "v", &["u@x"]);
        seed_category(&store, "c3", "u", &["u@x"]);
        seed_category(&store, "c4", "v", &[]);

        let (errors, _) = broadcast::channel(8);
        let feed = CategoryFeed::start(
            session("u", "u@x"),
            Arc::new(store.clone()),
            SharedCache::new(),
            errors,
        )
        .unwrap();
        settle().await;

        assert_eq!(ids(&feed.cache().snapshot()), ["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn unsharing_removes_only_when_absent_from_both() {
        let store = MemoryStore::new();
        seed_category(&store, "c3", "u", &["u@x"]);
        let (errors, _) = broadcast::channel(8);
        let feed = CategoryFeed::start(
            session("u", "u@x"),
            Arc::new(store.clone()),
            SharedCache::new(),
            errors,
        )
        .unwrap();
        settle().await;

        seed_category(&store, "c3", "u", &[]);
        settle().await;
        assert_eq!(ids(&feed.cache().snapshot()), ["c3"]);

        seed_category(&store, "c3", "w", &[]);
        settle().await;
        assert!(feed.cache().snapshot().is_empty());
    }

    #[tokio::test]
    async fn subscription_error_keeps_snapshot_and_other_source() {
        let store = MemoryStore::new();
        seed_category(&store, "c1", "u", &[]);
        seed_category(&store, "c2", "v", &["u@x"]);
        let (errors, mut error_rx) = broadcast::channel(8);
        let feed = CategoryFeed::start(
            session("u", "u@x"),
            Arc::new(store.clone()),
            SharedCache::new(),
            errors,
        )
        .unwrap();
        settle().await;

        store.inject_subscription_error(
            &CollectionPath::categories(),
            StoreError::PermissionDenied("rules".into()),
        );
        settle().await;
        assert_eq!(ids(&feed.cache().snapshot()), ["c1", "c2"]);
        assert!(error_rx.try_recv().is_ok());

        seed_category(&store, "c5", "u", &[]);
        settle().await;
        assert_eq!(ids(&feed.cache().snapshot()), ["c1", "c2", "c5"]);
    }

    #[tokio::test]
    async fn missing_email_skips_shared_source() {
        let store = MemoryStore::new();
        seed_category(&store, "c1", "u", &[]);
        let session = UserSession::new(UserIdentity::new("u", "U", None), SyncConfig::default());
        let (errors, _) = broadcast::channel(8);
        let feed =
            CategoryFeed::start(session, Arc::new(store.clone()), SharedCache::new(), errors)
                .unwrap();
        settle().await;
        assert_eq!(store.subscriber_count(), 1);
        assert_eq!(ids(&feed.cache().snapshot()), ["c1"]);
    }

    #[tokio::test]
    async fn resync_replaces_source_maps() {
        let store = MemoryStore::new();
        let (errors, _) = broadcast::channel(8);
        let cache = SharedCache::new();
        cache.mutate(|c| c.upsert(DualSource::Owned, stale_category()));
        store.fail_subscribe(true);
        assert!(CategoryFeed::start(
            session("u", "u@x"),
            Arc::new(store.clone()),
            cache.clone(),
            errors.clone()
        )
        .is_err());
        store.fail_subscribe(false);

        seed_category(&store, "c1", "u", &[]);
        let feed =
            CategoryFeed::start(session("u", "u@x"), Arc::new(store.clone()), cache, errors)
                .unwrap();
        feed.resync().await.unwrap();
        assert_eq!(ids(&feed.cache().snapshot()), ["c1"]);
    }

    fn stale_category() -> Category {
        Category {
            id: "gone".into(),
            name: "gone".into(),
            created_by: "u".into(),
            created_by_email: None,
            shared_with: vec![],
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn dropping_feed_cancels_subscriptions() {
        let store = MemoryStore::new();
        let (errors, _) = broadcast::channel(8);
        let feed = CategoryFeed::start(
            session("u", "u@x"),
            Arc::new(store.clone()),
            SharedCache::new(),
            errors,
        )
        .unwrap();
        settle().await;
        assert_eq!(store.subscriber_count(), 2);
        drop(feed);
        settle().await;
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn task_feed_follows_visible_categories() {
        let store = MemoryStore::new();
        seed_category(&store, "c1", "u", &[]);
        for (id, category) in [("t1", "c1"), ("t2", "c2"), ("t3", "c1")] {
            store.seed(
                &CollectionPath::tasks().doc(id),
                json!({ "categoryId": category, "title": id })
                    .as_object()
                    .cloned()
                    .unwrap(),
            );
        }

        let (errors, _) = broadcast::channel(8);
        let categories = CategoryFeed::start(
            session("u", "u@x"),
            Arc::new(store.clone()),
            SharedCache::new(),
            errors.clone(),
        )
        .unwrap();
        let tasks = TaskFeed::start(
            Arc::new(store.clone()),
            categories.subscribe(),
            SharedCache::new(),
            errors,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ids(&tasks.cache().snapshot()), ["t1", "t3"]);

        seed_category(&store, "c2", "v", &["u@x"]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ids(&tasks.cache().snapshot()), ["t1", "t2", "t3"]);

        seed_category(&store, "c1", "w", &[]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ids(&tasks.cache().snapshot()), ["t2"]);
        assert!(!tasks.cache().read(|c| c.has_source(&"c1".to_string())));
    }
}
