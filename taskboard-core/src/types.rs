use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::storage::{Document, FieldSet, Fields};

/// Anything kept in a merge cache: cloneable, comparable, identified by an
/// opaque store id.
pub trait Entity: Clone + PartialEq + Send + Sync + 'static {
    fn id(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to decode document {id}: {source}")]
pub struct DecodeError {
    pub id: String,
    #[source]
    pub source: serde_json::Error,
}

/// Typed view of a remote document.
pub trait FromDocument: Sized {
    fn from_document(doc: &Document) -> Result<Self, DecodeError>;
}

/// Decode a document, injecting the document id under `id_field`.
pub(crate) fn decode_document<T: DeserializeOwned>(
    doc: &Document,
    id_field: &str,
) -> Result<T, DecodeError> {
    let mut fields = doc.fields.clone();
    fields.insert(id_field.to_string(), Value::String(doc.id.clone()));
    serde_json::from_value(Value::Object(fields)).map_err(|source| DecodeError {
        id: doc.id.clone(),
        source,
    })
}

/// Serialize an entity into document fields, dropping the id key.
pub(crate) fn to_fields<T: Serialize>(entity: &T) -> Fields {
    match serde_json::to_value(entity) {
        Ok(Value::Object(mut fields)) => {
            fields.remove("id");
            fields
        }
        _ => Fields::new(),
    }
}

// ── Enums ────────────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn label(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

/// Workflow state of a task; doubles as the board column key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    /// Board column order.
    pub const ALL: [TaskStatus; 3] = [TaskStatus::Todo, TaskStatus::InProgress, TaskStatus::Done];

    /// Column id as stored remotely.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "inProgress",
            TaskStatus::Done => "done",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            TaskStatus::Todo => "To Do",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Done => "Done",
        }
    }

    pub fn from_column_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagColor {
    Red,
    Orange,
    Green,
    #[default]
    Blue,
    Purple,
    Gray,
}

impl TagColor {
    pub fn hex(self) -> &'static str {
        match self {
            TagColor::Red => "#ff4444",
            TagColor::Orange => "#ffbb33",
            TagColor::Green => "#00C851",
            TagColor::Blue => "#33b5e5",
            TagColor::Purple => "#aa66cc",
            TagColor::Gray => "#666666",
        }
    }
}

// ── Task parts ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TagRepr")]
pub struct Tag {
    pub text: String,
    pub color: TagColor,
}

impl Tag {
    pub fn new(text: impl Into<String>, color: TagColor) -> Self {
        Self {
            text: text.into(),
            color,
        }
    }
}

/// Older documents store tags as bare strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum TagRepr {
    Full {
        text: String,
        #[serde(default)]
        color: TagColor,
    },
    Bare(String),
}

impl From<TagRepr> for Tag {
    fn from(repr: TagRepr) -> Self {
        match repr {
            TagRepr::Full { text, color } => Tag { text, color },
            TagRepr::Bare(text) => Tag {
                text,
                color: TagColor::default(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// Comments share the note shape.
pub type Comment = Note;

/// Accepts RFC 3339 or the `YYYY-MM-DDTHH:MM[:SS]` form older clients wrote
/// (read as UTC); anything else becomes `None`.
fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&raw, format) {
            return Ok(Some(naive.and_utc()));
        }
    }
    Ok(None)
}

// ── Entities ─────────────────────────────────────────────────────────────────

/// A board grouping tasks; owned by its creator, optionally shared by email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    pub created_by: String,
    #[serde(default)]
    pub created_by_email: Option<String>,
    #[serde(default)]
    pub shared_with: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Category {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.created_by == user_id
    }

    pub fn is_shared_with(&self, email: &str) -> bool {
        self.shared_with.iter().any(|e| e == email)
    }

    pub fn to_fields(&self) -> Fields {
        to_fields(self)
    }
}

impl Entity for Category {
    fn id(&self) -> &str {
        &self.id
    }
}

impl FromDocument for Category {
    fn from_document(doc: &Document) -> Result<Self, DecodeError> {
        decode_document(doc, "id")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub category_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    /// 0–100
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_by_email: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified_by: Option<String>,
    #[serde(default)]
    pub last_modified_by_email: Option<String>,
    #[serde(default)]
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    pub fn to_fields(&self) -> Fields {
        to_fields(self)
    }
}

impl Entity for Task {
    fn id(&self) -> &str {
        &self.id
    }
}

impl FromDocument for Task {
    fn from_document(doc: &Document) -> Result<Self, DecodeError> {
        decode_document(doc, "id")
    }
}

// ── Mutation inputs ──────────────────────────────────────────────────────────

/// Input for creating a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskDraft {
    pub category_id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub deadline: Option<DateTime<Utc>>,
    pub assignee: Option<String>,
    pub tags: Vec<Tag>,
    pub progress: u8,
}

impl TaskDraft {
    pub fn new(category_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            category_id: category_id.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn into_task(
        self,
        id: String,
        user_id: &str,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> Task {
        let completed_at = (self.status == TaskStatus::Done).then_some(now);
        Task {
            id,
            category_id: self.category_id,
            title: self.title.trim().to_string(),
            description: self.description,
            priority: self.priority,
            status: self.status,
            deadline: self.deadline,
            assignee: self.assignee.filter(|a| !a.is_empty()),
            tags: self.tags,
            notes: Vec::new(),
            comments: Vec::new(),
            progress: self.progress.min(100),
            completed_at,
            created_by: Some(user_id.to_string()),
            created_by_email: email.map(str::to_string),
            created_at: Some(now),
            last_modified_by: Some(user_id.to_string()),
            last_modified_by_email: email.map(str::to_string),
            last_modified_at: Some(now),
        }
    }
}

/// Sparse task field set. Nullable fields use `Some(None)` for "clear".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub status: Option<TaskStatus>,
    pub deadline: Option<Option<DateTime<Utc>>>,
    pub assignee: Option<Option<String>>,
    pub tags: Option<Vec<Tag>>,
    pub notes: Option<Vec<Note>>,
    pub comments: Option<Vec<Comment>>,
    pub progress: Option<u8>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn description(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fold a later patch into this one; later values win per field.
    pub fn merge(&mut self, later: TaskPatch) {
        fn take<T>(slot: &mut Option<T>, later: Option<T>) {
            if later.is_some() {
                *slot = later;
            }
        }
        take(&mut self.title, later.title);
        take(&mut self.description, later.description);
        take(&mut self.priority, later.priority);
        take(&mut self.status, later.status);
        take(&mut self.deadline, later.deadline);
        take(&mut self.assignee, later.assignee);
        take(&mut self.tags, later.tags);
        take(&mut self.notes, later.notes);
        take(&mut self.comments, later.comments);
        take(&mut self.progress, later.progress);
        take(&mut self.completed_at, later.completed_at);
    }

    /// Keep `completed_at` consistent with a status change: stamped when the
    /// task enters Done, cleared when it leaves.
    pub fn with_completion(mut self, current: &Task, now: DateTime<Utc>) -> Self {
        if let Some(status) = self.status {
            if self.completed_at.is_none() {
                if status == TaskStatus::Done && !current.is_done() {
                    self.completed_at = Some(Some(now));
                } else if status != TaskStatus::Done && current.is_done() {
                    self.completed_at = Some(None);
                }
            }
        }
        self
    }

    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(deadline) = self.deadline {
            task.deadline = deadline;
        }
        if let Some(assignee) = &self.assignee {
            task.assignee = assignee.clone();
        }
        if let Some(tags) = &self.tags {
            task.tags = tags.clone();
        }
        if let Some(notes) = &self.notes {
            task.notes = notes.clone();
        }
        if let Some(comments) = &self.comments {
            task.comments = comments.clone();
        }
        if let Some(progress) = self.progress {
            task.progress = progress.min(100);
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = completed_at;
        }
    }

    pub fn to_field_set(&self) -> FieldSet {
        fn json<T: Serialize>(value: &T) -> Value {
            serde_json::to_value(value).unwrap_or(Value::Null)
        }
        let mut set = FieldSet::new();
        if let Some(title) = &self.title {
            set = set.set("title", title.as_str());
        }
        if let Some(description) = &self.description {
            set = set.set("description", description.as_str());
        }
        if let Some(priority) = self.priority {
            set = set.set("priority", priority.label());
        }
        if let Some(status) = self.status {
            set = set.set("status", status.as_str());
        }
        if let Some(deadline) = &self.deadline {
            set = set.set("deadline", json(deadline));
        }
        if let Some(assignee) = &self.assignee {
            set = set.set("assignee", json(assignee));
        }
        if let Some(tags) = &self.tags {
            set = set.set("tags", json(tags));
        }
        if let Some(notes) = &self.notes {
            set = set.set("notes", json(notes));
        }
        if let Some(comments) = &self.comments {
            set = set.set("comments", json(comments));
        }
        if let Some(progress) = self.progress {
            set = set.set("progress", progress.min(100));
        }
        if let Some(completed_at) = &self.completed_at {
            set = set.set("completedAt", json(completed_at));
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FieldOp;
    use chrono::TimeZone;
    use serde_json::json;

    fn doc(id: &str, value: Value) -> Document {
        Document::new(id, value.as_object().cloned().unwrap())
    }

    fn sample_task() -> Task {
        Task::from_document(&doc(
            "t1",
            json!({ "categoryId": "c1", "title": "Write report" }),
        ))
        .unwrap()
    }

    #[test]
    fn task_decodes_with_defaults() {
        let task = sample_task();
        assert_eq!(task.id, "t1");
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.status, TaskStatus::Todo);
        assert!(task.tags.is_empty());
        assert_eq!(task.completed_at, None);
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(serde_json::to_value(TaskStatus::InProgress).unwrap(), json!("inProgress"));
        assert_eq!(TaskStatus::from_column_id("done"), Some(TaskStatus::Done));
        assert_eq!(TaskStatus::from_column_id("archived"), None);
    }

    #[test]
    fn priority_is_ordered() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
    }

    #[test]
    fn legacy_string_tags_decode_as_blue() {
        let task = Task::from_document(&doc(
            "t1",
            json!({
                "categoryId": "c1",
                "title": "x",
                "tags": ["urgent", { "text": "ops", "color": "red" }]
            }),
        ))
        .unwrap();
        assert_eq!(task.tags[0], Tag::new("urgent", TagColor::Blue));
        assert_eq!(task.tags[1], Tag::new("ops", TagColor::Red));
    }

    #[test]
    fn legacy_local_deadline_is_read_as_utc() {
        let task = Task::from_document(&doc(
            "t1",
            json!({ "categoryId": "c1", "title": "x", "deadline": "2025-03-01T09:30" }),
        ))
        .unwrap();
        assert_eq!(
            task.deadline,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap())
        );
    }

    #[test]
    fn undecodable_document_reports_its_id() {
        let err = Task::from_document(&doc("bad", json!({ "title": 5 }))).unwrap_err();
        assert_eq!(err.id, "bad");
    }

    #[test]
    fn category_fields_omit_id() {
        let category = Category::from_document(&doc(
            "c1",
            json!({ "name": "Home", "createdBy": "u1", "sharedWith": ["v@x"] }),
        ))
        .unwrap();
        assert!(category.is_owned_by("u1"));
        assert!(category.is_shared_with("v@x"));
        let fields = category.to_fields();
        assert!(!fields.contains_key("id"));
        assert_eq!(fields["name"], json!("Home"));
    }

    #[test]
    fn patch_merge_keeps_latest_per_field() {
        let mut patch = TaskPatch::title("a");
        patch.merge(TaskPatch::description("d"));
        patch.merge(TaskPatch::title("abc"));
        assert_eq!(patch.title.as_deref(), Some("abc"));
        assert_eq!(patch.description.as_deref(), Some("d"));
    }

    #[test]
    fn completion_follows_status() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut task = sample_task();

        let to_done = TaskPatch {
            status: Some(TaskStatus::Done),
            ..TaskPatch::default()
        }
        .with_completion(&task, now);
        assert_eq!(to_done.completed_at, Some(Some(now)));
        to_done.apply_to(&mut task);
        assert_eq!(task.completed_at, Some(now));

        let back = TaskPatch {
            status: Some(TaskStatus::Todo),
            ..TaskPatch::default()
        }
        .with_completion(&task, now);
        assert_eq!(back.completed_at, Some(None));
    }

    #[test]
    fn patch_field_set_uses_wire_names() {
        let patch = TaskPatch {
            status: Some(TaskStatus::InProgress),
            assignee: Some(None),
            ..TaskPatch::default()
        };
        let set = patch.to_field_set();
        assert_eq!(set.get("status"), Some(&FieldOp::Set(json!("inProgress"))));
        assert_eq!(set.get("assignee"), Some(&FieldOp::Set(Value::Null)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn draft_stamps_creation_and_completion() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut draft = TaskDraft::new("c1", "  Ship it ");
        draft.status = TaskStatus::Done;
        let task = draft.into_task("t9".into(), "u1", Some("u1@x"), now);
        assert_eq!(task.title, "Ship it");
        assert_eq!(task.completed_at, Some(now));
        assert_eq!(task.created_by.as_deref(), Some("u1"));
        assert_eq!(task.last_modified_by_email.as_deref(), Some("u1@x"));
    }
}
