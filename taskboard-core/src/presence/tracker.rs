/// Heartbeat publisher + active-set watcher for one presence scope.
///
/// Two tasks per tracker:
/// - heartbeat: writes the local record immediately, then every
///   `heartbeat_interval`
/// - watcher: mirrors the scope's records and re-derives the active set on
///   every change and on every `liveness_tick`, so stale editors age out
///   even when nothing new arrives
///
/// Teardown deletes the local record. Failures anywhere in here are logged at
/// debug and otherwise ignored; the liveness window is the fallback.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{active_editors, ActiveEditors, PresenceRecord, PresenceScope, PresenceStatus};
use crate::session::UserSession;
use crate::storage::{DocumentPath, RemoteStore, SubscriptionEvent};
use crate::types::FromDocument;

type Records = Arc<Mutex<BTreeMap<String, PresenceRecord>>>;

pub struct PresenceTracker {
    scope: PresenceScope,
    session: UserSession,
    store: Arc<dyn RemoteStore>,
    records: Records,
    status: Arc<Mutex<PresenceStatus>>,
    active: watch::Receiver<ActiveEditors>,
    heartbeat: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    closed: bool,
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("scope", &self.scope)
            .field("user", &self.session.user_id())
            .field("closed", &self.closed)
            .finish()
    }
}

impl PresenceTracker {
    /// Start heartbeating and watching `scope`. Never fails: a scope that
    /// cannot be watched simply reports no other editors.
    pub fn open(scope: PresenceScope, session: UserSession, store: Arc<dyn RemoteStore>) -> Self {
        let records: Records = Arc::default();
        let status = Arc::new(Mutex::new(PresenceStatus::Online));
        let (tx, active) = watch::channel(ActiveEditors::default());

        let heartbeat = tokio::spawn(heartbeat_loop(
            scope.clone(),
            session.clone(),
            store.clone(),
            status.clone(),
        ));
        let watcher = match store.subscribe(crate::storage::Query::all(scope.collection())) {
            Ok(subscription) => Some(tokio::spawn(watch_loop(
                scope.clone(),
                session.clone(),
                subscription,
                records.clone(),
                tx,
            ))),
            Err(e) => {
                log::debug!(
                    target: "taskboard.presence",
                    "[{}] Cannot watch presence: {}",
                    scope,
                    e
                );
                None
            }
        };

        log::debug!(
            target: "taskboard.presence",
            "[{}] Presence opened for {}",
            scope,
            session.user_id()
        );
        Self {
            scope,
            session,
            store,
            records,
            status,
            active,
            heartbeat: Some(heartbeat),
            watcher,
            closed: false,
        }
    }

    pub fn scope(&self) -> &PresenceScope {
        &self.scope
    }

    /// Active set as of the last change or liveness tick.
    pub fn active(&self) -> ActiveEditors {
        self.active.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ActiveEditors> {
        self.active.clone()
    }

    /// Active set re-derived against the clock right now.
    pub fn active_now(&self) -> Vec<PresenceRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        active_editors(
            records.values(),
            self.session.user_id(),
            self.session.now(),
            self.session.config().liveness_window(),
        )
    }

    /// Change the advertised status; written right away and carried by later
    /// heartbeats.
    pub async fn set_status(&self, status: PresenceStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
        write_heartbeat(&self.scope, &self.session, self.store.as_ref(), status).await;
    }

    /// Stop timers and the subscription, then delete the local record.
    pub async fn close(mut self) {
        self.stop_tasks();
        self.closed = true;
        remove_record(self.store.as_ref(), &self.record_path(), &self.scope).await;
        log::debug!(
            target: "taskboard.presence",
            "[{}] Presence closed for {}",
            self.scope,
            self.session.user_id()
        );
    }

    fn record_path(&self) -> DocumentPath {
        self.scope.collection().doc(self.session.user_id())
    }

    fn stop_tasks(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        if let Some(task) = self.watcher.take() {
            task.abort();
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.stop_tasks();
        let store = self.store.clone();
        let path = self.record_path();
        let scope = self.scope.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    remove_record(store.as_ref(), &path, &scope).await;
                });
            }
            Err(_) => log::debug!(
                target: "taskboard.presence",
                "[{}] No runtime at drop, record left to expire",
                self.scope
            ),
        }
    }
}

async fn write_heartbeat(
    scope: &PresenceScope,
    session: &UserSession,
    store: &dyn RemoteStore,
    status: PresenceStatus,
) {
    let record = PresenceRecord {
        user_id: session.user_id().to_string(),
        email: session.email().map(str::to_string),
        display_name: session.display_name().to_string(),
        last_seen: session.now(),
        status,
    };
    let path = scope.collection().doc(session.user_id());
    if let Err(e) = store.set(&path, record.to_fields()).await {
        log::debug!(target: "taskboard.presence.heartbeat", "[{}] Heartbeat failed: {}", scope, e);
    }
}

async fn remove_record(store: &dyn RemoteStore, path: &DocumentPath, scope: &PresenceScope) {
    if let Err(e) = store.delete(path).await {
        log::debug!(
            target: "taskboard.presence",
            "[{}] Could not delete presence record, it will expire: {}",
            scope,
            e
        );
    }
}

async fn heartbeat_loop(
    scope: PresenceScope,
    session: UserSession,
    store: Arc<dyn RemoteStore>,
    status: Arc<Mutex<PresenceStatus>>,
) {
    let mut ticker = tokio::time::interval(session.config().heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let current = *status.lock().unwrap_or_else(|e| e.into_inner());
        write_heartbeat(&scope, &session, store.as_ref(), current).await;
    }
}

async fn watch_loop(
    scope: PresenceScope,
    session: UserSession,
    mut subscription: crate::storage::Subscription,
    records: Records,
    tx: watch::Sender<ActiveEditors>,
) {
    let mut tick = tokio::time::interval(session.config().liveness_tick());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut subscribed = true;

    loop {
        tokio::select! {
            event = subscription.next(), if subscribed => match event {
                Some(SubscriptionEvent::Changes(batch)) => {
                    let now = session.now();
                    let mut map = records.lock().unwrap_or_else(|e| e.into_inner());
                    for id in &batch.removals {
                        map.remove(id);
                    }
                    for doc in &batch.upserts {
                        match PresenceRecord::from_document(doc) {
                            Ok(record) => {
                                map.insert(doc.id.clone(), record.clamp_to(now));
                            }
                            Err(e) => log::debug!(
                                target: "taskboard.presence",
                                "[{}] Ignoring record: {}",
                                scope,
                                e
                            ),
                        }
                    }
                }
                Some(SubscriptionEvent::Error(e)) => {
                    log::debug!(target: "taskboard.presence", "[{}] Presence feed error: {}", scope, e);
                }
                None => subscribed = false,
            },
            _ = tick.tick() => {}
        }

        let next = {
            let map = records.lock().unwrap_or_else(|e| e.into_inner());
            active_editors(
                map.values(),
                session.user_id(),
                session.now(),
                session.config().liveness_window(),
            )
        };
        tx.send_if_modified(|current| {
            if **current == next {
                return false;
            }
            *current = Arc::new(next);
            true
        });
    }
}
