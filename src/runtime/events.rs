//! Runtime event stream payloads.

use crate::{core::store::StoreChange, types::BatchId};

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Neutral information.
    Info,
    /// A requested operation finished.
    Success,
    /// A recoverable failure the user should see.
    Error,
}

/// Dismissible notification with a title and a description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Severity.
    pub kind: NoticeKind,
    /// Short headline.
    pub title: String,
    /// Longer explanation.
    pub description: String,
}

impl Notice {
    /// Builds a notice.
    pub fn new(kind: NoticeKind, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            description: description.into(),
        }
    }
}

/// Events emitted from the single-writer runtime loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CartEvent {
    /// The store applied a transition.
    Store(StoreChange),
    /// The persisted projection reached the medium.
    Persisted,
    /// Writing the projection failed; in-memory state is unaffected.
    PersistFailed {
        /// Error text for diagnostics.
        message: String,
    },
    /// A notification for the user.
    Notice(Notice),
    /// A batch finished and was cleared from the store.
    BatchCompleted {
        /// Finished batch.
        batch_id: BatchId,
    },
    /// A finished batch was configured to shut the host down.
    ShutdownRequested {
        /// Finished batch.
        batch_id: BatchId,
    },
}
