//! Chained upgrades of the persisted cart projection.
//!
//! Each migrator understands exactly one prior shape and produces the next.
//! Version history:
//!
//! * v1: items carry `status` and `estSeconds`; `parallelism` is an integer
//!   where `0` means auto; `lastRunAt` is epoch milliseconds.
//! * v2: items carry `state` and `estMs`; `parallelism` is `"auto"` or a
//!   worker count.
//! * v3: `lastRunAt` is an RFC 3339 timestamp and `activeBatchId` is present.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::store::PersistedState;

/// Current schema version written by this crate.
pub const STATE_VERSION: u32 = 3;

/// Payloads without a version tag predate versioning.
const UNVERSIONED: u32 = 1;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("persisted state is not a JSON object")]
    NotAnObject,
    #[error("persisted version {found} is newer than supported version {supported}")]
    FromFuture { found: u32, supported: u32 },
    #[error("no migrator from version {0}")]
    MissingMigrator(u32),
    #[error("version {from} payload is malformed: {message}")]
    Malformed { from: u32, message: String },
    #[error("migrated payload failed to decode: {0}")]
    Decode(#[from] serde_json::Error),
}

type Migrator = fn(Map<String, Value>) -> Result<Map<String, Value>, MigrationError>;

/// `(from_version, migrator)`; the migrator yields `from_version + 1`.
const MIGRATORS: &[(u32, Migrator)] = &[(1, v1_to_v2), (2, v2_to_v3)];

/// Upgrades `raw` step by step to [`STATE_VERSION`] and decodes it.
pub fn migrate(raw: Value) -> Result<PersistedState, MigrationError> {
    let Value::Object(mut obj) = raw else {
        return Err(MigrationError::NotAnObject);
    };

    let mut version = match obj.get("__version") {
        None | Some(Value::Null) => UNVERSIONED,
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| MigrationError::Malformed {
                from: 0,
                message: format!("invalid __version: {v}"),
            })?,
    };

    if version > STATE_VERSION {
        return Err(MigrationError::FromFuture {
            found: version,
            supported: STATE_VERSION,
        });
    }

    while version < STATE_VERSION {
        let migrator = MIGRATORS
            .iter()
            .find(|(from, _)| *from == version)
            .map(|(_, m)| *m)
            .ok_or(MigrationError::MissingMigrator(version))?;
        obj = migrator(obj)?;
        version += 1;
        obj.insert("__version".into(), Value::from(version));
    }

    Ok(serde_json::from_value(Value::Object(obj))?)
}

fn v1_to_v2(mut obj: Map<String, Value>) -> Result<Map<String, Value>, MigrationError> {
    if let Some(items) = obj.get_mut("items") {
        upgrade_v1_items(items)?;
    }
    if let Some(Value::Array(presets)) = obj.get_mut("presets") {
        for preset in presets {
            if let Some(items) = preset.get_mut("items") {
                upgrade_v1_items(items)?;
            }
            if let Some(p) = preset.get_mut("parallelism") {
                upgrade_v1_parallelism(p);
            }
        }
    }
    if let Some(p) = obj.get_mut("parallelism") {
        upgrade_v1_parallelism(p);
    }
    Ok(obj)
}

fn upgrade_v1_items(items: &mut Value) -> Result<(), MigrationError> {
    let Value::Array(items) = items else {
        return Err(MigrationError::Malformed {
            from: 1,
            message: "items is not an array".to_string(),
        });
    };

    for item in items {
        let Value::Object(item) = item else {
            return Err(MigrationError::Malformed {
                from: 1,
                message: "item is not an object".to_string(),
            });
        };
        if let Some(status) = item.remove("status") {
            item.insert("state".into(), status);
        }
        if let Some(secs) = item.remove("estSeconds") {
            let ms = secs
                .as_f64()
                .map(|s| (s.max(0.0) * 1000.0).round() as u64)
                .unwrap_or(0);
            item.insert("estMs".into(), Value::from(ms));
        }
    }
    Ok(())
}

fn upgrade_v1_parallelism(p: &mut Value) {
    if p.as_u64() == Some(0) {
        *p = Value::String("auto".to_string());
    }
}

fn v2_to_v3(mut obj: Map<String, Value>) -> Result<Map<String, Value>, MigrationError> {
    if let Some(last) = obj.get_mut("lastRunAt") {
        if let Some(ms) = last.as_i64() {
            let ts = DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
                MigrationError::Malformed {
                    from: 2,
                    message: format!("lastRunAt out of range: {ms}"),
                }
            })?;
            *last = Value::String(ts.to_rfc3339());
        }
    }
    obj.entry("activeBatchId").or_insert(Value::Null);
    Ok(obj)
}
