//! User-facing error taxonomy for cart and catalog commands.

use thiserror::Error;

use crate::{
    api::ApiError,
    runtime::{
        events::{Notice, NoticeKind},
        handle::RuntimeError,
    },
};

/// Failure of a user-initiated command. Every variant is recoverable.
#[derive(Debug, Error)]
pub enum CartError {
    /// Caller-side precondition on the cart contents.
    #[error("{0}")]
    Validation(String),
    /// A control command needs an active batch.
    #[error("{0}")]
    Precondition(String),
    /// The gateway call failed; optimistic changes were not committed.
    #[error("could not {action}: {source}")]
    Transport {
        /// What was being attempted, e.g. `start the batch`.
        action: &'static str,
        /// Underlying gateway failure.
        #[source]
        source: ApiError,
    },
    /// The cart runtime stopped.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl CartError {
    pub(crate) fn transport(action: &'static str, source: ApiError) -> Self {
        Self::Transport { action, source }
    }

    /// Dismissible notification describing this error.
    pub fn notice(&self) -> Notice {
        let title = match self {
            Self::Validation(_) => "Check your cart".to_string(),
            Self::Precondition(_) => "No active batch".to_string(),
            Self::Transport { action, .. } => format!("Could not {action}"),
            Self::Runtime(_) => "Cart unavailable".to_string(),
        };
        Notice::new(NoticeKind::Error, title, self.to_string())
    }
}
