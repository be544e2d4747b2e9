/// Deadline alerts: decides when a task is "due soon" or "overdue" and hands
/// a notification to the host's notifier. Delivery itself is the host's job.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::types::Task;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Same tag, same alert: a host may collapse repeats.
    pub dedupe_tag: String,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log; used when the host has no notifier.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        log::info!(
            target: "taskboard.notify",
            "{}: {} [{}]",
            notification.title,
            notification.body,
            notification.dedupe_tag
        );
    }
}

/// Tags already delivered for one task, valid for one deadline value.
struct Delivered {
    deadline: DateTime<Utc>,
    tags: HashSet<String>,
}

pub struct DeadlineWatcher {
    due_soon_window: chrono::Duration,
    overdue_grace: chrono::Duration,
    delivered: HashMap<String, Delivered>,
}

impl DeadlineWatcher {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            due_soon_window: chrono::Duration::hours(i64::from(config.due_soon_window_hours)),
            overdue_grace: chrono::Duration::hours(i64::from(config.overdue_grace_hours)),
            delivered: HashMap::new(),
        }
    }

    /// Alerts newly due for `tasks` at `now`. Each tag is returned at most
    /// once per deadline: moving a task's deadline or removing the task
    /// forgets what was delivered for it.
    pub fn evaluate(&mut self, tasks: &[Task], now: DateTime<Utc>) -> Vec<Notification> {
        let deadlines: HashMap<&str, DateTime<Utc>> = tasks
            .iter()
            .filter_map(|t| Some((t.id.as_str(), t.deadline?)))
            .collect();
        self.delivered
            .retain(|id, seen| deadlines.get(id.as_str()) == Some(&seen.deadline));

        let mut fresh = Vec::new();
        for task in tasks.iter().filter(|t| !t.is_done()) {
            let Some(deadline) = task.deadline else {
                continue;
            };
            let remaining = deadline - now;
            let notification = if remaining > chrono::Duration::zero()
                && remaining <= self.due_soon_window
            {
                let hours = (remaining.num_seconds() as f64 / 3600.0).round() as i64;
                Notification {
                    title: format!("Task Due Soon: {}", task.title),
                    body: format!("Due in {} hours", hours),
                    dedupe_tag: format!("task-{}", task.id),
                }
            } else if remaining < chrono::Duration::zero() && -remaining <= self.overdue_grace {
                Notification {
                    title: format!("Task Overdue: {}", task.title),
                    body: "This task is now overdue!".to_string(),
                    dedupe_tag: format!("task-{}-overdue", task.id),
                }
            } else {
                continue;
            };
            let seen = self
                .delivered
                .entry(task.id.clone())
                .or_insert_with(|| Delivered {
                    deadline,
                    tags: HashSet::new(),
                });
            if seen.tags.insert(notification.dedupe_tag.clone()) {
                fresh.push(notification);
            }
        }
        fresh
    }

    /// Re-check on every task snapshot change and every `interval`, until
    /// the snapshot channel closes or the handle is aborted.
    pub fn spawn(
        mut self,
        mut tasks: watch::Receiver<Arc<Vec<Task>>>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = tasks.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {}
                }
                let current = tasks.borrow_and_update().clone();
                for notification in self.evaluate(&current, clock.now()) {
                    log::debug!(target: "taskboard.notify", "Deadline alert {}", notification.dedupe_tag);
                    notifier.notify(notification);
                }
            }
            log::debug!(target: "taskboard.notify", "Deadline watcher stopped");
        })
    }
}
