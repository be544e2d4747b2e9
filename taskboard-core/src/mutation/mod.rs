/// Optimistic mutations.
///
/// Local caches change first and synchronously; the remote write follows on
/// the pipeline's ordered write queue. Failed writes become notices, local
/// state is never rolled back.
pub mod editor;
pub mod pipeline;
pub mod throttle;

use tokio::sync::oneshot;

use crate::storage::StoreError;

pub use editor::TaskEditSession;
pub use pipeline::MutationPipeline;
pub use throttle::EditThrottle;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MutationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Category {category_id} kept: {} of its tasks could not be deleted", .failed.len())]
    CascadeIncomplete {
        category_id: String,
        failed: Vec<String>,
        deleted: Vec<String>,
    },

    #[error("Write cancelled before it completed")]
    Cancelled,
}

/// Dismissible user-facing message about a failed write.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub message: String,
    pub entity_id: Option<String>,
}

impl Notice {
    pub fn write_failed(action: &str, entity_id: Option<String>, error: &MutationError) -> Self {
        Self {
            message: format!("Could not {}: {}", action, error),
            entity_id,
        }
    }
}

/// Completion handle of a dispatched remote write. Dropping it does not
/// cancel the write.
#[derive(Debug)]
pub struct PendingWrite {
    rx: oneshot::Receiver<Result<(), MutationError>>,
}

impl PendingWrite {
    pub(crate) fn new(rx: oneshot::Receiver<Result<(), MutationError>>) -> Self {
        Self { rx }
    }

    /// Wait for the remote outcome.
    pub async fn wait(self) -> Result<(), MutationError> {
        self.rx.await.unwrap_or(Err(MutationError::Cancelled))
    }

    /// Outcome if the write has already finished.
    pub fn try_result(&mut self) -> Option<Result<(), MutationError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(MutationError::Cancelled)),
        }
    }
}
