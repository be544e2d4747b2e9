/// Trailing-edge write throttle for one task.
///
/// Every edit is applied locally at once and folded into one pending patch.
/// The remote write fires `window` after the *last* edit, carrying the merged
/// patch. Each edit restarts the timer; a timer that wakes after being
/// superseded sees a newer generation and does nothing.
///
/// The pending patch is never dropped silently: `flush()` sends it now,
/// `discard()` drops it explicitly, and dropping the throttle flushes.
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{MutationError, MutationPipeline, PendingWrite};
use crate::types::TaskPatch;

#[derive(Default)]
pub(super) struct ThrottleState {
    pending: Option<TaskPatch>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl ThrottleState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Stop the timer and hand over the pending patch; a timer that is
    /// already past its sleep sees the bumped generation and does nothing.
    pub(super) fn take_pending(&mut self) -> Option<TaskPatch> {
        self.cancel_timer();
        self.generation += 1;
        self.pending.take()
    }
}

pub struct EditThrottle {
    pipeline: MutationPipeline,
    task_id: String,
    window: Duration,
    state: Arc<Mutex<ThrottleState>>,
}

impl std::fmt::Debug for EditThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditThrottle")
            .field("task_id", &self.task_id)
            .field("window", &self.window)
            .field("pending", &self.has_pending())
            .finish()
    }
}

impl EditThrottle {
    /// Throttle with the session's configured window.
    pub fn new(pipeline: MutationPipeline, task_id: impl Into<String>) -> Self {
        let window = pipeline.session().config().edit_throttle();
        Self::with_window(pipeline, task_id, window)
    }

    pub fn with_window(pipeline: MutationPipeline, task_id: impl Into<String>, window: Duration) -> Self {
        let task_id = task_id.into();
        let state: Arc<Mutex<ThrottleState>> = Arc::default();
        pipeline.register_throttle(&task_id, &state);
        Self {
            pipeline,
            task_id,
            window,
            state,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Apply `patch` locally and (re)arm the trailing timer.
    pub fn edit(&self, patch: TaskPatch) -> Result<(), MutationError> {
        if patch.is_empty() {
            return Ok(());
        }
        let current = self
            .pipeline
            .task(&self.task_id)
            .ok_or_else(|| MutationError::UnknownEntity(self.task_id.clone()))?;
        let patch = patch.with_completion(&current, self.pipeline.session().now());
        self.pipeline.apply_task_locally(&self.task_id, &patch);

        let mut state = self.lock();
        let merged = match state.pending.take() {
            Some(mut pending) => {
                pending.merge(patch);
                pending
            }
            None => patch,
        };
        state.pending = Some(merged);
        state.generation += 1;
        state.cancel_timer();
        state.timer = Some(tokio::spawn(fire_after(
            self.window,
            state.generation,
            self.state.clone(),
            self.pipeline.clone(),
            self.task_id.clone(),
        )));
        Ok(())
    }

    /// Send the pending patch now, if any.
    pub fn flush(&self) -> Option<PendingWrite> {
        let patch = self.lock().take_pending()?;
        log::debug!(target: "taskboard.mutation.throttle", "Flushing edits to task {}", self.task_id);
        Some(self.pipeline.send_task_patch(&self.task_id, patch))
    }

    /// Drop the pending patch without writing it. Local state keeps the
    /// edits; the next snapshot of the task reconciles.
    pub fn discard(&self) -> Option<TaskPatch> {
        let discarded = self.lock().take_pending();
        if discarded.is_some() {
            log::info!(
                target: "taskboard.mutation.throttle",
                "Discarded pending edits to task {}",
                self.task_id
            );
        }
        discarded
    }
}

impl Drop for EditThrottle {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

async fn fire_after(
    window: Duration,
    generation: u64,
    state: Arc<Mutex<ThrottleState>>,
    pipeline: MutationPipeline,
    task_id: String,
) {
    tokio::time::sleep(window).await;
    let patch = {
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        if state.generation != generation {
            return;
        }
        state.timer = None;
        state.pending.take()
    };
    if let Some(patch) = patch {
        let _ = pipeline.send_task_patch(&task_id, patch);
    }
}
