/// Soft-state presence.
///
/// A presence record is only a claim: a user counts as active while their
/// last heartbeat is younger than the liveness window. Liveness is always
/// derived from time + last heartbeat, never from the record merely existing.
pub mod tracker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{CollectionPath, Document, Fields};
use crate::types::{decode_document, to_fields, DecodeError, FromDocument};

pub use tracker::PresenceTracker;

/// What a presence session is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PresenceScope {
    /// Editors of one task.
    Task(String),
    /// Viewers of one category board.
    Category(String),
    /// Process-level "who is online".
    User,
}

impl PresenceScope {
    pub fn collection(&self) -> CollectionPath {
        match self {
            PresenceScope::Task(id) => CollectionPath::task_editors(id),
            PresenceScope::Category(id) => CollectionPath::category_presence(id),
            PresenceScope::User => CollectionPath::user_presence(),
        }
    }
}

impl std::fmt::Display for PresenceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceScope::Task(id) => write!(f, "task:{}", id),
            PresenceScope::Category(id) => write!(f, "category:{}", id),
            PresenceScope::User => f.write_str("user"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
}

/// One heartbeat document; the document id is the user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    #[serde(default, rename = "userEmail")]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: String,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub status: PresenceStatus,
}

impl PresenceRecord {
    pub fn to_fields(&self) -> Fields {
        to_fields(self)
    }

    /// Pull a heartbeat stamped ahead of the local clock back to `now`, so a
    /// peer with a fast clock still expires one window after it goes quiet.
    pub fn clamp_to(mut self, now: DateTime<Utc>) -> Self {
        if self.last_seen > now {
            self.last_seen = now;
        }
        self
    }
}

impl FromDocument for PresenceRecord {
    fn from_document(doc: &Document) -> Result<Self, DecodeError> {
        decode_document(doc, "userId")
    }
}

/// Active set published by a tracker.
pub type ActiveEditors = Arc<Vec<PresenceRecord>>;

/// Whether a heartbeat at `last_seen` is still within `window` of `now`.
/// A heartbeat stamped in the future counts as live only while the skew is
/// smaller than `window`.
pub fn is_live(last_seen: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match (now - last_seen).to_std() {
        Ok(age) => age < window,
        Err(_) => (last_seen - now).to_std().is_ok_and(|skew| skew < window),
    }
}

/// Online records younger than the window, excluding `local_user`, sorted by
/// user id.
pub fn active_editors<'a>(
    records: impl IntoIterator<Item = &'a PresenceRecord>,
    local_user: &str,
    now: DateTime<Utc>,
    window: Duration,
) -> Vec<PresenceRecord> {
    let mut active: Vec<PresenceRecord> = records
        .into_iter()
        .filter(|r| r.user_id != local_user)
        .filter(|r| r.status == PresenceStatus::Online)
        .filter(|r| is_live(r.last_seen, now, window))
        .cloned()
        .collect();
    active.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    active
}
