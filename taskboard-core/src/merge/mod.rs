pub mod cache;
pub mod feed;

use std::sync::Arc;

pub use cache::{MergeCache, SharedCache, SourceBatch};
pub use feed::{CategoryFeed, DualSource, FeedError, TaskFeed};

use crate::types::{Category, Task};

/// Combined read view of the merged caches at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub categories: Arc<Vec<Category>>,
    pub tasks: Arc<Vec<Task>>,
}

impl Snapshot {
    pub fn new(categories: Arc<Vec<Category>>, tasks: Arc<Vec<Task>>) -> Self {
        Self { categories, tasks }
    }

    pub fn category(&self, id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn tasks_in<'a>(&'a self, category_id: &'a str) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks.iter().filter(move |t| t.category_id == category_id)
    }
}
