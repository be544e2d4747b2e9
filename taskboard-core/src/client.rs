/// Per-sign-in wiring of the sync core.
///
/// Starts the category and task feeds, the mutation pipeline and the
/// user-level presence tracker, and hands out the views built on them.
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::activity::ActivityEntry;
use crate::board::{self, Board, Column};
use crate::merge::{CategoryFeed, FeedError, SharedCache, Snapshot, TaskFeed};
use crate::mutation::{MutationPipeline, Notice, TaskEditSession};
use crate::notify::{DeadlineWatcher, Notifier};
use crate::presence::{ActiveEditors, PresenceScope, PresenceTracker};
use crate::search::{LiveSearch, SearchIndex};
use crate::session::UserSession;
use crate::storage::{RemoteStore, StoreError};
use crate::types::{Category, Task};

const CHANNEL_CAPACITY: usize = 64;

pub struct BoardClient {
    session: UserSession,
    categories: CategoryFeed,
    tasks: TaskFeed,
    pipeline: MutationPipeline,
    online: Option<PresenceTracker>,
    deadlines: Option<JoinHandle<()>>,
    errors: broadcast::Sender<FeedError>,
}

impl BoardClient {
    /// Must be called inside a tokio runtime.
    pub fn start(session: UserSession, store: Arc<dyn RemoteStore>) -> Result<Self, StoreError> {
        let (errors, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (notices, _) = broadcast::channel(CHANNEL_CAPACITY);
        let category_cache = SharedCache::new();
        let task_cache = SharedCache::new();

        let categories = CategoryFeed::start(
            session.clone(),
            store.clone(),
            category_cache.clone(),
            errors.clone(),
        )?;
        let tasks = TaskFeed::start(
            store.clone(),
            category_cache.subscribe(),
            task_cache.clone(),
            errors.clone(),
        );
        let pipeline = MutationPipeline::new(
            session.clone(),
            store.clone(),
            category_cache,
            task_cache,
            notices,
        );
        let online = PresenceTracker::open(PresenceScope::User, session.clone(), store);

        log::info!(target: "taskboard.client", "Client started for {}", session.user_id());
        Ok(Self {
            session,
            categories,
            tasks,
            pipeline,
            online: Some(online),
            deadlines: None,
            errors,
        })
    }

    pub fn session(&self) -> &UserSession {
        &self.session
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.categories.cache().snapshot(),
            self.tasks.cache().snapshot(),
        )
    }

    pub fn categories(&self) -> watch::Receiver<Arc<Vec<Category>>> {
        self.categories.subscribe()
    }

    pub fn tasks(&self) -> watch::Receiver<Arc<Vec<Task>>> {
        self.tasks.subscribe()
    }

    pub fn pipeline(&self) -> &MutationPipeline {
        &self.pipeline
    }

    pub fn board(&self) -> Board {
        Board::new(self.pipeline.clone())
    }

    pub fn columns(&self, category_id: &str) -> Vec<Column> {
        board::columns(&self.snapshot(), category_id)
    }

    pub fn search_index(&self) -> SearchIndex {
        SearchIndex::new(self.snapshot())
    }

    pub fn live_search(&self) -> LiveSearch {
        LiveSearch::new(self.snapshot())
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.pipeline.notices()
    }

    pub fn subscription_errors(&self) -> broadcast::Receiver<FeedError> {
        self.errors.subscribe()
    }

    pub fn open_task_editor(&self, task_id: &str) -> TaskEditSession {
        TaskEditSession::open(&self.pipeline, task_id)
    }

    /// Presence on a category board; closing or dropping it leaves.
    pub fn join_category(&self, category_id: &str) -> PresenceTracker {
        PresenceTracker::open(
            PresenceScope::Category(category_id.to_string()),
            self.session.clone(),
            self.pipeline.store().clone(),
        )
    }

    /// Other signed-in users currently online.
    pub fn online_users(&self) -> ActiveEditors {
        self.online
            .as_ref()
            .map(PresenceTracker::active)
            .unwrap_or_default()
    }

    /// Start deadline alerts; replaces a previously started watcher.
    pub fn watch_deadlines(&mut self, notifier: Arc<dyn Notifier>) {
        if let Some(previous) = self.deadlines.take() {
            previous.abort();
        }
        let config = self.session.config();
        self.deadlines = Some(DeadlineWatcher::new(config).spawn(
            self.tasks.subscribe(),
            notifier,
            self.session.clock(),
            config.deadline_check_interval(),
        ));
    }

    pub async fn recent_activity(&self, category_id: &str, limit: usize) -> Result<Vec<ActivityEntry>, StoreError> {
        self.pipeline.activity().recent(category_id, limit).await
    }

    /// Re-read the category predicates, e.g. after a subscription error or
    /// a partial cascade delete.
    pub async fn resync(&self) -> Result<(), StoreError> {
        self.categories.resync().await
    }

    /// Stop feeds and timers and leave user-level presence.
    pub async fn shutdown(mut self) {
        if let Some(deadlines) = self.deadlines.take() {
            deadlines.abort();
        }
        self.categories.stop();
        if let Some(online) = self.online.take() {
            online.close().await;
        }
        log::info!(target: "taskboard.client", "Client stopped for {}", self.session.user_id());
    }
}

impl Drop for BoardClient {
    fn drop(&mut self) {
        if let Some(deadlines) = self.deadlines.take() {
            deadlines.abort();
        }
    }
}
