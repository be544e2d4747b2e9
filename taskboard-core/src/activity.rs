/// Per-category activity trail (`categories/{id}/activities`).
///
/// Entries are best-effort: a failed append is logged and dropped.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::UserSession;
use crate::storage::{CollectionPath, Document, DocumentPath, Fields, Query, RemoteStore, StoreError};
use crate::types::{decode_document, to_fields, DecodeError, FromDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityAction {
    Created,
    Updated,
    Moved,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    #[serde(default, skip_serializing)]
    pub id: String,
    pub task_id: String,
    pub action: ActivityAction,
    pub user_id: String,
    #[serde(default)]
    pub user_email: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FromDocument for ActivityEntry {
    fn from_document(doc: &Document) -> Result<Self, DecodeError> {
        decode_document(doc, "id")
    }
}

#[derive(Clone)]
pub struct ActivityLog {
    session: UserSession,
    store: Arc<dyn RemoteStore>,
}

impl ActivityLog {
    pub fn new(session: UserSession, store: Arc<dyn RemoteStore>) -> Self {
        Self { session, store }
    }

    /// Build the entry document for an action by the session user.
    pub fn entry(
        &self,
        category_id: &str,
        action: ActivityAction,
        task_id: &str,
    ) -> (DocumentPath, Fields) {
        let collection = CollectionPath::category_activities(category_id);
        let id = self.store.allocate_id(&collection);
        let entry = ActivityEntry {
            id: id.clone(),
            task_id: task_id.to_string(),
            action,
            user_id: self.session.user_id().to_string(),
            user_email: self.session.email().map(str::to_string),
            timestamp: self.session.now(),
        };
        (collection.doc(id), to_fields(&entry))
    }

    pub async fn record(&self, category_id: &str, action: ActivityAction, task_id: &str) {
        let (path, fields) = self.entry(category_id, action, task_id);
        if let Err(e) = self.store.set(&path, fields).await {
            log::warn!(
                target: "taskboard.activity",
                "Failed to record {:?} of task {} in {}: {}",
                action,
                task_id,
                category_id,
                e
            );
        }
    }

    /// Most recent entries first.
    pub async fn recent(&self, category_id: &str, limit: usize) -> Result<Vec<ActivityEntry>, StoreError> {
        let docs = self
            .store
            .read_once(&Query::all(CollectionPath::category_activities(category_id)))
            .await?;
        let mut entries: Vec<ActivityEntry> = docs
            .iter()
            .filter_map(|doc| ActivityEntry::from_document(doc).ok())
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        entries.truncate(limit);
        Ok(entries)
    }
}
