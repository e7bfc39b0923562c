pub mod migrate;
pub mod sqlite;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, warn};

use crate::core::store::{CartStore, PersistedState};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("payload error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Durable key-value medium holding one versioned cart projection.
pub trait StateSink: Send {
    /// Returns the stored payload without interpreting its version.
    fn load_raw(&self) -> PersistResult<Option<Value>>;
    fn save(&mut self, state: &PersistedState) -> PersistResult<()>;
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
}

/// Loads, migrates and hydrates a store, falling back to defaults.
///
/// Storage and migration failures are logged, never returned.
pub fn restore_store(sink: &dyn StateSink) -> CartStore {
    let raw = match sink.load_raw() {
        Ok(Some(raw)) => raw,
        Ok(None) => return CartStore::new(),
        Err(err) => {
            error!(error = %err, "failed to read persisted cart state; starting empty");
            return CartStore::new();
        }
    };

    match migrate::migrate(raw) {
        Ok(state) => CartStore::from_state(state),
        Err(err) => {
            warn!(error = %err, "persisted cart state could not be migrated; resetting to defaults");
            CartStore::from_state(PersistedState::default())
        }
    }
}
