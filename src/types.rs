//! Shared primitive IDs and cart-related enums.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Cart item identifier, generated by the store.
pub type ItemId = Uuid;
/// Preset identifier, generated by the store.
pub type PresetId = Uuid;

/// Opaque batch identifier handed out by the API gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    /// Prefix used for batches that never left this process.
    pub const LOCAL_PREFIX: &'static str = "local-";

    /// Creates a batch id for a locally simulated run.
    pub fn local() -> Self {
        Self(format!("{}{}", Self::LOCAL_PREFIX, Uuid::new_v4()))
    }

    /// True when the batch was created by the local simulation.
    pub fn is_local(&self) -> bool {
        self.0.starts_with(Self::LOCAL_PREFIX)
    }

    /// Borrows the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a single cart item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    /// Freshly added, not yet submitted.
    #[default]
    Idle,
    /// Accepted by a batch, waiting for a worker.
    Queued,
    /// Executing.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Error,
    /// Held by an engine-level pause.
    Paused,
}

impl ItemState {
    /// True for `Success` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Paused => "paused",
        }
    }
}

/// How many items a batch may execute at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Parallelism {
    /// Let the server decide.
    #[default]
    Auto,
    /// Strictly sequential.
    One,
    /// Two at a time.
    Two,
    /// Four at a time.
    Four,
}

impl Parallelism {
    /// Numeric worker count, `None` for [`Parallelism::Auto`].
    pub fn workers(self) -> Option<u8> {
        match self {
            Self::Auto => None,
            Self::One => Some(1),
            Self::Two => Some(2),
            Self::Four => Some(4),
        }
    }

    /// Maps a worker count back to a setting; anything unsupported is `None`.
    pub fn from_workers(n: u64) -> Option<Self> {
        match n {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            4 => Some(Self::Four),
            _ => None,
        }
    }
}

impl Serialize for Parallelism {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.workers() {
            None => serializer.serialize_str("auto"),
            Some(n) => serializer.serialize_u8(n),
        }
    }
}

impl<'de> Deserialize<'de> for Parallelism {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Self::from_workers(n)
                .ok_or_else(|| serde::de::Error::custom(format!("unsupported parallelism: {n}"))),
            Raw::Text(s) if s == "auto" => Ok(Self::Auto),
            Raw::Text(s) => s
                .parse::<u64>()
                .ok()
                .and_then(Self::from_workers)
                .ok_or_else(|| serde::de::Error::custom(format!("unsupported parallelism: {s}"))),
        }
    }
}

/// What the host should do once a batch finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnCompletion {
    /// Show a completion notification.
    #[default]
    Notify,
    /// Ask the host to shut down.
    Shutdown,
    /// Stay silent.
    Nothing,
}

/// Severity of an item log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal progress.
    #[default]
    Info,
    /// Something unexpected but recoverable.
    Warn,
    /// A failure.
    Error,
}

