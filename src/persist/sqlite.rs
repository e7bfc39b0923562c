//! SQLite-backed key-value medium for the cart projection.

use std::path::Path;

use chrono::{DateTime, Utc};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::core::store::PersistedState;

use super::{PersistResult, StateSink};

/// Key the cart projection is stored under unless overridden.
pub const DEFAULT_STATE_KEY: &str = "lecturecart/cart";

/// SQLite implementation of [`crate::persist::StateSink`].
pub struct SqliteStateSink {
    conn: Connection,
    key: String,
}

impl SqliteStateSink {
    /// Opens or creates a SQLite-backed sink at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite sink.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn,
            key: DEFAULT_STATE_KEY.to_string(),
        })
    }

    /// Stores the projection under `key` instead of [`DEFAULT_STATE_KEY`].
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Writes an arbitrary payload, e.g. one produced by an older release.
    pub fn write_raw(&mut self, payload: &Value) -> PersistResult<()> {
        let version = payload
            .get("__version")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        self.upsert(version, serde_json::to_vec(payload)?)
    }

    /// Time of the last successful save under this key.
    pub fn saved_at(&self) -> PersistResult<Option<DateTime<Utc>>> {
        let ts_ms: Option<i64> = self
            .conn
            .query_row(
                "SELECT ts_ms FROM kv_state WHERE key = ?1",
                params![self.key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts_ms.and_then(DateTime::from_timestamp_millis))
    }

    /// Removes the stored projection.
    pub fn clear(&mut self) -> PersistResult<usize> {
        let count = self
            .conn
            .execute("DELETE FROM kv_state WHERE key = ?1", params![self.key])?;
        Ok(count)
    }

    fn upsert(&mut self, version: i64, payload: Vec<u8>) -> PersistResult<()> {
        self.conn.execute(
            "INSERT INTO kv_state(key, version, ts_ms, payload) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET version = excluded.version,
                 ts_ms = excluded.ts_ms, payload = excluded.payload",
            params![self.key, version, Utc::now().timestamp_millis(), payload],
        )?;
        Ok(())
    }
}

impl StateSink for SqliteStateSink {
    fn load_raw(&self) -> PersistResult<Option<Value>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM kv_state WHERE key = ?1",
                params![self.key],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&payload)?))
    }

    fn save(&mut self, state: &PersistedState) -> PersistResult<()> {
        let payload = serde_json::to_vec(state)?;
        self.upsert(i64::from(state.version), payload)
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }
}
