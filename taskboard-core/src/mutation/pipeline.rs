/// Mutation pipeline: local apply, then queued remote write.
///
/// Remote writes run one at a time on a single writer task, in the order the
/// mutations were issued, so two writes to the same document never land out
/// of order. A category delete is one queued job that fans out its child
/// deletes concurrently.
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::throttle::ThrottleState;
use super::{MutationError, Notice, PendingWrite};
use crate::activity::{ActivityAction, ActivityLog};
use crate::merge::{DualSource, SharedCache};
use crate::session::UserSession;
use crate::storage::{CollectionPath, FieldSet, Query, RemoteStore};
use crate::types::{Category, Task, TaskDraft, TaskPatch};

type WriteJob = BoxFuture<'static, ()>;
type Throttles = Arc<Mutex<HashMap<String, Vec<Weak<Mutex<ThrottleState>>>>>>;

#[derive(Clone)]
pub struct MutationPipeline {
    session: UserSession,
    store: Arc<dyn RemoteStore>,
    categories: SharedCache<DualSource, Category>,
    tasks: SharedCache<String, Task>,
    notices: broadcast::Sender<Notice>,
    activity: ActivityLog,
    queue: mpsc::UnboundedSender<WriteJob>,
    throttles: Throttles,
}

impl MutationPipeline {
    /// Must be called inside a tokio runtime; spawns the writer task, which
    /// exits once every clone of the pipeline is gone and the queue drained.
    pub fn new(
        session: UserSession,
        store: Arc<dyn RemoteStore>,
        categories: SharedCache<DualSource, Category>,
        tasks: SharedCache<String, Task>,
        notices: broadcast::Sender<Notice>,
    ) -> Self {
        let (queue, mut jobs) = mpsc::unbounded_channel::<WriteJob>();
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                job.await;
            }
            log::debug!(target: "taskboard.mutation", "Write queue drained");
        });
        let activity = ActivityLog::new(session.clone(), store.clone());
        Self {
            session,
            store,
            categories,
            tasks,
            notices,
            activity,
            queue,
            throttles: Throttles::default(),
        }
    }

    pub fn session(&self) -> &UserSession {
        &self.session
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id)
    }

    pub fn category(&self, category_id: &str) -> Option<Category> {
        self.categories.get(category_id)
    }

    // ── Tasks ────────────────────────────────────────────────────────────

    pub fn create_task(&self, draft: TaskDraft) -> (Task, PendingWrite) {
        let id = self.store.allocate_id(&CollectionPath::tasks());
        let task = draft.into_task(id, self.session.user_id(), self.session.email(), self.session.now());
        self.tasks
            .mutate(|c| c.upsert(task.category_id.clone(), task.clone()));

        let store = self.store.clone();
        let path = CollectionPath::tasks().doc(task.id.clone());
        let fields = task.to_fields();
        let pending = self.dispatch("create task", Some(task.id.clone()), async move {
            store.set(&path, fields).await?;
            Ok(())
        });
        self.record_activity(&task.category_id, ActivityAction::Created, &task.id);
        log::debug!(target: "taskboard.mutation", "Created task {} in {}", task.id, task.category_id);
        (task, pending)
    }

    /// Apply `patch` locally (completion stamp kept consistent with status)
    /// and queue the remote update.
    pub fn update_task(&self, task_id: &str, patch: TaskPatch) -> Result<PendingWrite, MutationError> {
        let current = self
            .tasks
            .get(task_id)
            .ok_or_else(|| MutationError::UnknownEntity(task_id.to_string()))?;
        self.flush_throttles(task_id);
        let patch = patch.with_completion(&current, self.session.now());
        let action = if is_move(&patch) {
            ActivityAction::Moved
        } else {
            ActivityAction::Updated
        };
        self.apply_task_locally(task_id, &patch);
        let pending = self.send_task_patch(task_id, patch);
        self.record_activity(&current.category_id, action, task_id);
        Ok(pending)
    }

    /// Local half of an update. Returns false if the task is not cached.
    pub fn apply_task_locally(&self, task_id: &str, patch: &TaskPatch) -> bool {
        let user_id = self.session.user_id().to_string();
        let email = self.session.email().map(str::to_string);
        let now = self.session.now();
        self.tasks.mutate(|c| {
            c.update_in_place(task_id, |task| {
                patch.apply_to(task);
                task.last_modified_by = Some(user_id.clone());
                task.last_modified_by_email = email.clone();
                task.last_modified_at = Some(now);
            })
        })
    }

    /// Remote half of an update: one write carrying every field in `patch`.
    pub fn send_task_patch(&self, task_id: &str, patch: TaskPatch) -> PendingWrite {
        let mut changes = patch.to_field_set();
        changes.extend(self.modified_stamp());
        let store = self.store.clone();
        let path = CollectionPath::tasks().doc(task_id);
        self.dispatch("update task", Some(task_id.to_string()), async move {
            store.update(&path, changes).await?;
            Ok(())
        })
    }

    pub fn delete_task(&self, task_id: &str) -> Result<PendingWrite, MutationError> {
        let current = self
            .tasks
            .get(task_id)
            .ok_or_else(|| MutationError::UnknownEntity(task_id.to_string()))?;
        self.flush_throttles(task_id);
        self.tasks.mutate(|c| c.remove_everywhere(task_id));

        let store = self.store.clone();
        let path = CollectionPath::tasks().doc(task_id);
        let pending = self.dispatch("delete task", Some(task_id.to_string()), async move {
            store.delete(&path).await?;
            Ok(())
        });
        self.record_activity(&current.category_id, ActivityAction::Deleted, task_id);
        Ok(pending)
    }

    pub(super) fn register_throttle(&self, task_id: &str, state: &Arc<Mutex<ThrottleState>>) {
        let mut throttles = self.throttles.lock().unwrap_or_else(|e| e.into_inner());
        throttles.retain(|_, states| {
            states.retain(|s| s.strong_count() > 0);
            !states.is_empty()
        });
        throttles
            .entry(task_id.to_string())
            .or_default()
            .push(Arc::downgrade(state));
    }

    /// Queue the pending edits of every open throttle on `task_id` ahead of a
    /// direct write, so they cannot land after it.
    fn flush_throttles(&self, task_id: &str) {
        let states: Vec<_> = {
            let throttles = self.throttles.lock().unwrap_or_else(|e| e.into_inner());
            throttles
                .get(task_id)
                .map(|states| states.iter().filter_map(Weak::upgrade).collect())
                .unwrap_or_default()
        };
        let mut merged: Option<TaskPatch> = None;
        for state in states {
            let pending = state.lock().unwrap_or_else(|e| e.into_inner()).take_pending();
            if let Some(patch) = pending {
                merged = Some(match merged.take() {
                    Some(mut acc) => {
                        acc.merge(patch);
                        acc
                    }
                    None => patch,
                });
            }
        }
        if let Some(patch) = merged {
            log::debug!(
                target: "taskboard.mutation",
                "Flushing throttled edits to task {} ahead of a direct write",
                task_id
            );
            let _ = self.send_task_patch(task_id, patch);
        }
    }

    // ── Categories ───────────────────────────────────────────────────────

    pub fn create_category(&self, name: &str) -> (Category, PendingWrite) {
        let now = self.session.now();
        let category = Category {
            id: self.store.allocate_id(&CollectionPath::categories()),
            name: name.trim().to_string(),
            created_by: self.session.user_id().to_string(),
            created_by_email: self.session.email().map(str::to_string),
            shared_with: Vec::new(),
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.categories
            .mutate(|c| c.upsert(DualSource::Owned, category.clone()));

        let store = self.store.clone();
        let path = CollectionPath::categories().doc(category.id.clone());
        let fields = category.to_fields();
        let pending = self.dispatch("create category", Some(category.id.clone()), async move {
            store.set(&path, fields).await?;
            Ok(())
        });
        (category, pending)
    }

    pub fn rename_category(&self, category_id: &str, name: &str) -> Result<PendingWrite, MutationError> {
        let name = name.trim().to_string();
        let changes = FieldSet::new().set("name", name.clone());
        self.update_category(category_id, "rename category", changes, |category| {
            category.name = name.clone();
        })
    }

    pub fn share_category(&self, category_id: &str, email: &str) -> Result<PendingWrite, MutationError> {
        let email = email.trim().to_string();
        let changes = FieldSet::new().array_union("sharedWith", email.clone());
        self.update_category(category_id, "share category", changes, |category| {
            if !category.shared_with.contains(&email) {
                category.shared_with.push(email.clone());
            }
        })
    }

    pub fn unshare_category(&self, category_id: &str, email: &str) -> Result<PendingWrite, MutationError> {
        let email = email.trim().to_string();
        let changes = FieldSet::new().array_remove("sharedWith", email.clone());
        self.update_category(category_id, "unshare category", changes, |category| {
            category.shared_with.retain(|e| e != &email);
        })
    }

    fn update_category(
        &self,
        category_id: &str,
        action: &'static str,
        changes: FieldSet,
        mut edit: impl FnMut(&mut Category),
    ) -> Result<PendingWrite, MutationError> {
        let now = self.session.now();
        let found = self.categories.mutate(|c| {
            c.update_in_place(category_id, |category| {
                edit(category);
                category.updated_at = Some(now);
            })
        });
        if !found {
            return Err(MutationError::UnknownEntity(category_id.to_string()));
        }

        let changes = changes.set("updatedAt", json_time(now));
        let store = self.store.clone();
        let path = CollectionPath::categories().doc(category_id);
        Ok(self.dispatch(action, Some(category_id.to_string()), async move {
            store.update(&path, changes).await?;
            Ok(())
        }))
    }

    /// Remove the category and its tasks locally, then delete every task
    /// remotely and the category document last. If any task delete fails the
    /// category document stays and the result is `CascadeIncomplete`.
    pub fn delete_category(&self, category_id: &str) -> Result<PendingWrite, MutationError> {
        if self.categories.get(category_id).is_none() {
            return Err(MutationError::UnknownEntity(category_id.to_string()));
        }
        self.categories.mutate(|c| c.remove_everywhere(category_id));
        self.tasks.mutate(|c| c.remove_where(|t| t.category_id == category_id));

        let store = self.store.clone();
        let category_id = category_id.to_string();
        Ok(self.dispatch("delete category", Some(category_id.clone()), async move {
            cascade_delete(store.as_ref(), &category_id).await
        }))
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    /// Queue a remote write. Failures are logged and published as notices.
    pub fn dispatch<F>(&self, action: &str, entity_id: Option<String>, write: F) -> PendingWrite
    where
        F: Future<Output = Result<(), MutationError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let notices = self.notices.clone();
        let action = action.to_string();
        let job = async move {
            let result = write.await;
            if let Err(e) = &result {
                log::warn!(
                    target: "taskboard.mutation",
                    "Failed to {} {}: {}",
                    action,
                    entity_id.as_deref().unwrap_or(""),
                    e
                );
                let _ = notices.send(Notice::write_failed(&action, entity_id, e));
            }
            let _ = tx.send(result);
        }
        .boxed();
        if self.queue.send(job).is_err() {
            log::warn!(target: "taskboard.mutation", "Write queue closed, write dropped");
        }
        PendingWrite::new(rx)
    }

    fn record_activity(&self, category_id: &str, action: ActivityAction, task_id: &str) {
        let activity = self.activity.clone();
        let category_id = category_id.to_string();
        let task_id = task_id.to_string();
        let job = async move {
            activity.record(&category_id, action, &task_id).await;
        }
        .boxed();
        let _ = self.queue.send(job);
    }

    fn modified_stamp(&self) -> FieldSet {
        let email = self
            .session
            .email()
            .map(|e| Value::String(e.to_string()))
            .unwrap_or(Value::Null);
        FieldSet::new()
            .set("lastModifiedBy", self.session.user_id())
            .set("lastModifiedByEmail", email)
            .set("lastModifiedAt", json_time(self.session.now()))
    }
}

fn json_time(at: chrono::DateTime<chrono::Utc>) -> Value {
    serde_json::to_value(at).unwrap_or(Value::Null)
}

/// A status change alone (with its completion stamp) counts as a board move.
fn is_move(patch: &TaskPatch) -> bool {
    patch.status.is_some()
        && TaskPatch {
            status: None,
            completed_at: None,
            ..patch.clone()
        }
        .is_empty()
}

async fn cascade_delete(store: &dyn RemoteStore, category_id: &str) -> Result<(), MutationError> {
    let children = store
        .read_once(&Query::where_eq(CollectionPath::tasks(), "categoryId", category_id))
        .await?;
    let results = join_all(children.iter().map(|doc| async move {
        let outcome = store.delete(&CollectionPath::tasks().doc(doc.id.clone())).await;
        (doc.id.clone(), outcome)
    }))
    .await;

    let mut deleted = Vec::new();
    let mut failed = Vec::new();
    for (task_id, outcome) in results {
        match outcome {
            Ok(()) => deleted.push(task_id),
            Err(e) => {
                log::warn!(
                    target: "taskboard.mutation",
                    "Cascade: task {} of category {} not deleted: {}",
                    task_id,
                    category_id,
                    e
                );
                failed.push(task_id);
            }
        }
    }
    if !failed.is_empty() {
        return Err(MutationError::CascadeIncomplete {
            category_id: category_id.to_string(),
            failed,
            deleted,
        });
    }

    store
        .delete(&CollectionPath::categories().doc(category_id))
        .await?;
    log::info!(
        target: "taskboard.mutation",
        "Deleted category {} with {} tasks",
        category_id,
        deleted.len()
    );
    Ok(())
}
