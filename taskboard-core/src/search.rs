/// Local search over the merged snapshot.
///
/// Matching is a case- and accent-insensitive substring test. Tasks match on
/// title, description, tag text or priority label; categories on name. Hits
/// come out tasks first, then categories, each in snapshot order. Nothing
/// here talks to the store.
use std::sync::Arc;

use unicode_normalization::UnicodeNormalization;

use crate::merge::Snapshot;
use crate::types::{Category, Task};

/// Quick-search box behaviour: start matching at 2 characters, show 5 hits.
pub const QUICK_MIN_CHARS: usize = 2;
pub const QUICK_LIMIT: usize = 5;

/// Unicode-aware normalization for search: lowercases, NFD-decomposes, and
/// strips combining marks (accents). This lets "resume" match "résumé".
fn normalize_for_search(value: &str) -> String {
    value
        .to_lowercase()
        .nfd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchHit {
    Task(Task),
    Category(Category),
}

impl SearchHit {
    pub fn id(&self) -> &str {
        match self {
            SearchHit::Task(task) => &task.id,
            SearchHit::Category(category) => &category.id,
        }
    }
}

#[derive(Debug)]
struct Indexed {
    snapshot: Snapshot,
    /// Normalized searchable text per task, parallel to `snapshot.tasks`.
    task_text: Vec<Vec<String>>,
    category_text: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SearchIndex {
    inner: Arc<Indexed>,
}

impl SearchIndex {
    pub fn new(snapshot: Snapshot) -> Self {
        let task_text = snapshot
            .tasks
            .iter()
            .map(|task| {
                let mut fields = vec![
                    normalize_for_search(&task.title),
                    normalize_for_search(&task.description),
                    task.priority.label().to_string(),
                ];
                fields.extend(task.tags.iter().map(|tag| normalize_for_search(&tag.text)));
                fields
            })
            .collect();
        let category_text = snapshot
            .categories
            .iter()
            .map(|category| normalize_for_search(&category.name))
            .collect();
        Self {
            inner: Arc::new(Indexed {
                snapshot,
                task_text,
                category_text,
            }),
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.inner.snapshot
    }

    /// Lazy matches for `query`. Blank queries match nothing.
    pub fn search(&self, query: &str) -> Matches {
        let needle = normalize_for_search(query.trim());
        Matches {
            index: self.inner.clone(),
            position: if needle.is_empty() { usize::MAX } else { 0 },
            needle,
        }
    }

    /// Search-box variant: nothing under `QUICK_MIN_CHARS`, at most
    /// `QUICK_LIMIT` hits.
    pub fn quick_search(&self, query: &str) -> Vec<SearchHit> {
        if query.trim().chars().count() < QUICK_MIN_CHARS {
            return Vec::new();
        }
        self.search(query).take(QUICK_LIMIT).collect()
    }
}

/// Iterator over search hits. Cloning restarts from the clone's position;
/// `restart` rewinds to the first hit.
#[derive(Debug, Clone)]
pub struct Matches {
    index: Arc<Indexed>,
    needle: String,
    /// Tasks occupy positions `0..tasks.len()`, categories follow.
    position: usize,
}

impl Matches {
    pub fn restart(&mut self) {
        if self.position != usize::MAX {
            self.position = 0;
        }
    }
}

impl Iterator for Matches {
    type Item = SearchHit;

    fn next(&mut self) -> Option<SearchHit> {
        let task_count = self.index.task_text.len();
        let total = task_count + self.index.category_text.len();
        while self.position < total {
            let at = self.position;
            self.position += 1;
            if at < task_count {
                if self.index.task_text[at]
                    .iter()
                    .any(|text| text.contains(&self.needle))
                {
                    return Some(SearchHit::Task(self.index.snapshot.tasks[at].clone()));
                }
            } else {
                let at = at - task_count;
                if self.index.category_text[at].contains(&self.needle) {
                    return Some(SearchHit::Category(
                        self.index.snapshot.categories[at].clone(),
                    ));
                }
            }
        }
        None
    }
}

/// Search results kept current as the snapshot or the query changes.
#[derive(Debug, Clone)]
pub struct LiveSearch {
    index: SearchIndex,
    query: String,
    results: Vec<SearchHit>,
}

impl LiveSearch {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            index: SearchIndex::new(snapshot),
            query: String::new(),
            results: Vec::new(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn results(&self) -> &[SearchHit] {
        &self.results
    }

    pub fn set_query(&mut self, query: &str) -> &[SearchHit] {
        if query != self.query {
            self.query = query.to_string();
            self.rerun();
        }
        &self.results
    }

    pub fn set_snapshot(&mut self, snapshot: Snapshot) -> &[SearchHit] {
        if &snapshot != self.index.snapshot() {
            self.index = SearchIndex::new(snapshot);
            self.rerun();
        }
        &self.results
    }

    fn rerun(&mut self) {
        self.results = self.index.search(&self.query).collect();
    }
}
