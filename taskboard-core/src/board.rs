/// Board columns and drag-and-drop transitions.
///
/// Entry point is a resolved gesture `(task_id, target status)`; the result
/// is either nothing (same column, unknown task) or a patch handed to the
/// mutation pipeline.
use chrono::{DateTime, Utc};

use crate::merge::Snapshot;
use crate::mutation::{MutationError, MutationPipeline, PendingWrite};
use crate::types::{Task, TaskPatch, TaskStatus};

/// Patch for moving `task` to `target`, or `None` when it is already there.
pub fn plan_transition(task: &Task, target: TaskStatus, now: DateTime<Utc>) -> Option<TaskPatch> {
    if task.status == target {
        return None;
    }
    let completed_at = match target {
        TaskStatus::Done => Some(now),
        _ => None,
    };
    Some(TaskPatch {
        status: Some(target),
        completed_at: Some(completed_at),
        ..TaskPatch::default()
    })
}

#[derive(Debug)]
pub enum DropOutcome {
    Moved(PendingWrite),
    Unchanged,
    UnknownTask,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub status: TaskStatus,
    pub tasks: Vec<Task>,
}

impl Column {
    pub fn id(&self) -> &'static str {
        self.status.as_str()
    }

    pub fn title(&self) -> &'static str {
        self.status.title()
    }
}

#[derive(Clone)]
pub struct Board {
    pipeline: MutationPipeline,
}

impl Board {
    pub fn new(pipeline: MutationPipeline) -> Self {
        Self { pipeline }
    }

    /// Apply a resolved drop gesture. No write is issued for a drop onto the
    /// task's current column.
    pub fn drop_task(&self, task_id: &str, target: TaskStatus) -> DropOutcome {
        let Some(task) = self.pipeline.task(task_id) else {
            log::debug!(target: "taskboard.board", "Drop of unknown task {}", task_id);
            return DropOutcome::UnknownTask;
        };
        let Some(patch) = plan_transition(&task, target, self.pipeline.session().now()) else {
            return DropOutcome::Unchanged;
        };
        match self.pipeline.update_task(task_id, patch) {
            Ok(pending) => {
                log::debug!(
                    target: "taskboard.board",
                    "Moved task {} {} -> {}",
                    task_id,
                    task.status.as_str(),
                    target.as_str()
                );
                DropOutcome::Moved(pending)
            }
            // The task vanished between the lookup and the update.
            Err(MutationError::UnknownEntity(_)) => DropOutcome::UnknownTask,
            Err(e) => {
                log::warn!(target: "taskboard.board", "Drop of task {} failed: {}", task_id, e);
                DropOutcome::UnknownTask
            }
        }
    }

    /// Drop by column id as the view reports it (`todo`, `inProgress`,
    /// `done`); unknown column ids are ignored.
    pub fn drop_on_column(&self, task_id: &str, column_id: &str) -> DropOutcome {
        match TaskStatus::from_column_id(column_id) {
            Some(target) => self.drop_task(task_id, target),
            None => DropOutcome::Unchanged,
        }
    }
}

/// A category's tasks grouped into the three columns, in snapshot order.
pub fn columns(snapshot: &Snapshot, category_id: &str) -> Vec<Column> {
    TaskStatus::ALL
        .into_iter()
        .map(|status| Column {
            status,
            tasks: snapshot
                .tasks_in(category_id)
                .filter(|t| t.status == status)
                .cloned()
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RuntimeClock;
    use crate::config::{SyncConfig, UserIdentity};
    use crate::merge::SharedCache;
    use crate::session::UserSession;
    use crate::storage::memory::MemoryStore;
    use crate::storage::{CollectionPath, Document};
    use crate::types::FromDocument;
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::broadcast;

    fn task(id: &str, status: &str) -> Task {
        Task::from_document(&Document::new(
            id,
            json!({ "categoryId": "c1", "title": id, "status": status })
                .as_object()
                .cloned()
                .unwrap(),
        ))
        .unwrap()
    }

    #[test]
    fn same_column_is_a_no_op() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(plan_transition(&task("t", "done"), TaskStatus::Done, now), None);
    }

    #[test]
    fn entering_done_stamps_and_leaving_clears() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let to_done = plan_transition(&task("t", "todo"), TaskStatus::Done, now).unwrap();
        assert_eq!(to_done.completed_at, Some(Some(now)));

        let back = plan_transition(&task("t", "done"), TaskStatus::InProgress, now).unwrap();
        assert_eq!(back.status, Some(TaskStatus::InProgress));
        assert_eq!(back.completed_at, Some(None));
    }

    fn board_with(store: &MemoryStore, tasks: &[Task]) -> (Board, SharedCache<String, Task>) {
        let session = UserSession::new(
            UserIdentity::new("u1", "Uma", Some("u1@x".into())),
            SyncConfig::default(),
        )
        .with_clock(Arc::new(RuntimeClock::new()));
        let cache = SharedCache::new();
        for t in tasks {
            store.seed(&CollectionPath::tasks().doc(t.id.clone()), t.to_fields());
            cache.mutate(|c| c.upsert(t.category_id.clone(), t.clone()));
        }
        let (notices, _) = broadcast::channel(8);
        let pipeline = MutationPipeline::new(
            session,
            Arc::new(store.clone()),
            SharedCache::new(),
            cache.clone(),
            notices,
        );
        (Board::new(pipeline), cache)
    }

    #[tokio::test]
    async fn drop_on_done_writes_once() {
        let store = MemoryStore::new();
        let (board, cache) = board_with(&store, &[task("t1", "todo")]);

        let DropOutcome::Moved(pending) = board.drop_on_column("t1", "done") else {
            panic!("expected a move");
        };
        let local = cache.get("t1").unwrap();
        assert_eq!(local.status, TaskStatus::Done);
        assert!(local.completed_at.is_some());
        pending.wait().await.unwrap();

        let stored = store.document(&CollectionPath::tasks().doc("t1")).unwrap();
        assert_eq!(stored["status"], "done");
        assert_ne!(stored["completedAt"], Value::Null);

        assert!(matches!(board.drop_task("t1", TaskStatus::Done), DropOutcome::Unchanged));
        let updates = store
            .writes_to(&CollectionPath::tasks().doc("t1"))
            .into_iter()
            .filter(|w| w.changes.is_some())
            .count();
        assert_eq!(updates, 1);
    }

    #[tokio::test]
    async fn unknown_task_and_column_are_ignored() {
        let store = MemoryStore::new();
        let (board, _) = board_with(&store, &[task("t1", "todo")]);
        assert!(matches!(board.drop_task("zz", TaskStatus::Done), DropOutcome::UnknownTask));
        assert!(matches!(board.drop_on_column("t1", "archived"), DropOutcome::Unchanged));
    }

    #[test]
    fn columns_group_by_status_in_order() {
        let snapshot = Snapshot::new(
            Arc::new(vec![]),
            Arc::new(vec![task("a", "done"), task("b", "todo"), task("c", "todo")]),
        );
        let cols = columns(&snapshot, "c1");
        assert_eq!(cols.iter().map(Column::id).collect::<Vec<_>>(), ["todo", "inProgress", "done"]);
        assert_eq!(cols[0].tasks.len(), 2);
        assert!(cols[1].tasks.is_empty());
        assert_eq!(cols[2].tasks[0].id, "a");
    }
}
