/// An open task editor: throttled edits plus "who else is editing" presence.
use super::{EditThrottle, MutationError, MutationPipeline, PendingWrite};
use crate::presence::{ActiveEditors, PresenceRecord, PresenceScope, PresenceTracker};
use crate::types::TaskPatch;

#[derive(Debug)]
pub struct TaskEditSession {
    throttle: EditThrottle,
    presence: PresenceTracker,
}

impl TaskEditSession {
    pub fn open(pipeline: &MutationPipeline, task_id: &str) -> Self {
        let presence = PresenceTracker::open(
            PresenceScope::Task(task_id.to_string()),
            pipeline.session().clone(),
            pipeline.store().clone(),
        );
        Self {
            throttle: EditThrottle::new(pipeline.clone(), task_id),
            presence,
        }
    }

    pub fn task_id(&self) -> &str {
        self.throttle.task_id()
    }

    pub fn edit(&self, patch: TaskPatch) -> Result<(), MutationError> {
        self.throttle.edit(patch)
    }

    pub fn other_editors(&self) -> ActiveEditors {
        self.presence.active()
    }

    pub fn other_editors_now(&self) -> Vec<PresenceRecord> {
        self.presence.active_now()
    }

    pub fn has_pending_edits(&self) -> bool {
        self.throttle.has_pending()
    }

    /// Flush pending edits, then leave the task's editor list.
    pub async fn close(self) -> Option<PendingWrite> {
        let Self { throttle, presence } = self;
        let write = throttle.flush();
        presence.close().await;
        write
    }

    /// Close without writing pending edits.
    pub async fn abandon(self) {
        let Self { throttle, presence } = self;
        throttle.discard();
        presence.close().await;
    }
}
