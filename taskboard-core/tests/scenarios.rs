//! End-to-end scenarios against the in-memory store with a paused clock.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskboard_core::board::DropOutcome;
use taskboard_core::clock::RuntimeClock;
use taskboard_core::config::{SyncConfig, UserIdentity};
use taskboard_core::mutation::MutationError;
use taskboard_core::storage::memory::{MemoryStore, WriteKind};
use taskboard_core::storage::{CollectionPath, Fields, StoreError};
use taskboard_core::types::{TaskPatch, TaskStatus};
use taskboard_core::{BoardClient, UserSession};

fn session(id: &str) -> UserSession {
    UserSession::new(
        UserIdentity::new(id, id.to_uppercase(), Some(format!("{}@example.com", id))),
        SyncConfig::default(),
    )
    .with_clock(Arc::new(RuntimeClock::new()))
}

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap()
}

fn seed_category(store: &MemoryStore, id: &str, owner: &str, shared_with: &[&str]) {
    store.seed(
        &CollectionPath::categories().doc(id),
        fields(json!({ "name": id, "createdBy": owner, "sharedWith": shared_with })),
    );
}

fn seed_task(store: &MemoryStore, id: &str, category: &str, status: &str) {
    store.seed(
        &CollectionPath::tasks().doc(id),
        fields(json!({ "categoryId": category, "title": id, "status": status })),
    );
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test(start_paused = true)]
async fn owned_and_shared_categories_each_appear_once() {
    let store = MemoryStore::new();
    seed_category(&store, "C1", "u", &[]);
    seed_category(&store, "C2", "v", &["u@example.com"]);
    // Owned and shared at once.
    seed_category(&store, "C3", "u", &["u@example.com"]);

    let client = BoardClient::start(session("u"), Arc::new(store.clone())).unwrap();
    settle().await;

    let ids: Vec<String> = client
        .snapshot()
        .categories
        .iter()
        .map(|c| c.id.clone())
        .collect();
    assert_eq!(ids, ["C1", "C2", "C3"]);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn drop_on_done_completes_once() {
    let store = MemoryStore::new();
    seed_category(&store, "C1", "u", &[]);
    seed_task(&store, "T", "C1", "todo");
    let client = BoardClient::start(session("u"), Arc::new(store.clone())).unwrap();
    settle().await;

    let board = client.board();
    let DropOutcome::Moved(pending) = board.drop_task("T", TaskStatus::Done) else {
        panic!("first drop should move the task");
    };
    pending.wait().await.unwrap();

    let stored = store.document(&CollectionPath::tasks().doc("T")).unwrap();
    assert_eq!(stored["status"], "done");
    assert!(!stored["completedAt"].is_null());

    assert!(matches!(board.drop_task("T", TaskStatus::Done), DropOutcome::Unchanged));
    settle().await;
    let updates = store
        .writes_to(&CollectionPath::tasks().doc("T"))
        .iter()
        .filter(|w| w.kind == WriteKind::Update)
        .count();
    assert_eq!(updates, 1);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn partial_cascade_keeps_category_and_surviving_task() {
    let store = MemoryStore::new();
    seed_category(&store, "C", "u", &[]);
    for id in ["T1", "T2", "T3"] {
        seed_task(&store, id, "C", "todo");
    }
    let client = BoardClient::start(session("u"), Arc::new(store.clone())).unwrap();
    let mut notices = client.notices();
    settle().await;

    store.fail_writes_to(&CollectionPath::tasks().doc("T2"));
    let result = client.pipeline().delete_category("C").unwrap().wait().await;
    assert!(matches!(result, Err(MutationError::CascadeIncomplete { .. })));

    assert!(store.document(&CollectionPath::categories().doc("C")).is_some());
    assert!(store.document(&CollectionPath::tasks().doc("T1")).is_none());
    assert!(store.document(&CollectionPath::tasks().doc("T2")).is_some());
    assert!(notices.try_recv().is_ok());

    // Explicit reconciliation brings the surviving category back locally.
    client.resync().await.unwrap();
    settle().await;
    assert!(client.snapshot().category("C").is_some());
    assert_eq!(client.snapshot().task("T2").map(|t| t.id.as_str()), Some("T2"));
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn closed_editor_disappears_within_ttl_plus_heartbeat() {
    let store = MemoryStore::new();
    seed_category(&store, "C", "u", &["v@example.com"]);
    seed_task(&store, "T", "C", "todo");
    let u = BoardClient::start(session("u"), Arc::new(store.clone())).unwrap();
    let v = BoardClient::start(session("v"), Arc::new(store.clone())).unwrap();
    settle().await;

    let u_editor = u.open_task_editor("T");
    let v_editor = v.open_task_editor("T");
    settle().await;
    assert_eq!(v_editor.other_editors()[0].user_id, "u");

    // Worst case: the delete on close is lost, so only the TTL removes u.
    store.fail_writes_to(&CollectionPath::task_editors("T").doc("u"));
    u_editor.close().await;

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert!(v_editor.other_editors().is_empty());

    v_editor.close().await;
    u.shutdown().await;
    v.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rapid_edits_in_one_window_make_one_write() {
    let store = MemoryStore::new();
    seed_category(&store, "C", "u", &[]);
    seed_task(&store, "T", "C", "todo");
    let client = BoardClient::start(session("u"), Arc::new(store.clone())).unwrap();
    settle().await;

    let editor = client.open_task_editor("T");
    for text in ["H", "He", "Hel", "Hell", "Hello"] {
        editor.edit(TaskPatch::title(text)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(client.snapshot().task("T").unwrap().title, "Hello");
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let updates: Vec<_> = store
        .writes_to(&CollectionPath::tasks().doc("T"))
        .into_iter()
        .filter(|w| w.kind == WriteKind::Update)
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(store.document(&CollectionPath::tasks().doc("T")).unwrap()["title"], "Hello");
    editor.close().await;
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn drag_after_editor_status_edit_wins_remotely() {
    let store = MemoryStore::new();
    seed_category(&store, "C", "u", &[]);
    seed_task(&store, "T", "C", "todo");
    let client = BoardClient::start(session("u"), Arc::new(store.clone())).unwrap();
    settle().await;

    let editor = client.open_task_editor("T");
    editor
        .edit(TaskPatch {
            status: Some(TaskStatus::InProgress),
            ..TaskPatch::default()
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let DropOutcome::Moved(pending) = client.board().drop_task("T", TaskStatus::Done) else {
        panic!("drop should move the task");
    };
    pending.wait().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let stored = store.document(&CollectionPath::tasks().doc("T")).unwrap();
    assert_eq!(stored["status"], "done");
    assert!(!stored["completedAt"].is_null());
    assert_eq!(client.snapshot().task("T").unwrap().status, TaskStatus::Done);
    editor.close().await;
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn subscription_error_keeps_serving_last_snapshot() {
    let store = MemoryStore::new();
    seed_category(&store, "C1", "u", &[]);
    seed_category(&store, "C2", "v", &["u@example.com"]);
    let client = BoardClient::start(session("u"), Arc::new(store.clone())).unwrap();
    let mut errors = client.subscription_errors();
    settle().await;

    store.inject_subscription_error(
        &CollectionPath::categories(),
        StoreError::Unavailable("network".into()),
    );
    settle().await;
    assert!(errors.try_recv().is_ok());
    assert_eq!(client.snapshot().categories.len(), 2);

    seed_category(&store, "C3", "u", &[]);
    settle().await;
    assert_eq!(client.snapshot().categories.len(), 3);
    client.shutdown().await;
}
