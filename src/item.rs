//! Cart item record, draft, log lines, partial updates and typed parameters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ItemId, ItemState, LogLevel};

/// Number of log lines an item retains; older lines are evicted first.
pub const MAX_ITEM_LOGS: usize = 50;

/// Open key-value parameter bag as it travels on the wire.
pub type ParamMap = Map<String, Value>;

/// One log line attached to a cart item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Line identifier.
    pub id: Uuid,
    /// Time the line was produced.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable text.
    pub message: String,
}

/// Input for appending a log line; missing id and timestamp are filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDraft {
    /// Severity.
    pub level: LogLevel,
    /// Human-readable text.
    pub message: String,
    /// Optional producer timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    /// Optional producer id.
    pub id: Option<Uuid>,
}

impl LogDraft {
    /// Info-level line stamped at append time.
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    /// Line with an explicit level stamped at append time.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: None,
            id: None,
        }
    }

    /// Materializes the draft into a [`LogEntry`].
    pub fn into_entry(self) -> LogEntry {
        LogEntry {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            level: self.level,
            message: self.message,
        }
    }
}

/// One queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    /// Stable identifier.
    pub id: ItemId,
    /// Display title.
    pub title: String,
    /// Action kind, e.g. `transcribe`.
    pub action: String,
    /// Optional catalog lecture association.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lecture_id: Option<String>,
    /// Action-specific arguments.
    #[serde(default)]
    pub params: ParamMap,
    /// Estimated duration, display only.
    #[serde(default)]
    pub est_ms: u64,
    /// Informational prerequisite labels.
    #[serde(default)]
    pub prereqs: Vec<String>,
    /// Lifecycle state.
    #[serde(default)]
    pub state: ItemState,
    /// Most recent log lines, oldest first.
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl CartItem {
    /// Appends a log line and evicts the oldest lines beyond [`MAX_ITEM_LOGS`].
    pub fn push_log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
        self.trim_logs();
    }

    /// Drops the oldest lines until at most [`MAX_ITEM_LOGS`] remain.
    pub fn trim_logs(&mut self) {
        if self.logs.len() > MAX_ITEM_LOGS {
            let excess = self.logs.len() - MAX_ITEM_LOGS;
            self.logs.drain(..excess);
        }
    }

    /// Typed view over `action` and `params`.
    pub fn task_params(&self) -> Result<TaskParams, ParamsError> {
        TaskParams::parse(&self.action, &self.params)
    }
}

/// Insert payload used to create a new [`CartItem`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemDraft {
    /// Preferred id; the store generates one when absent or already taken.
    pub id: Option<ItemId>,
    /// Display title.
    pub title: String,
    /// Action kind.
    pub action: String,
    /// Optional catalog lecture association.
    pub lecture_id: Option<String>,
    /// Action-specific arguments.
    pub params: ParamMap,
    /// Estimated duration, display only.
    pub est_ms: u64,
    /// Informational prerequisite labels.
    pub prereqs: Vec<String>,
}

impl ItemDraft {
    /// Draft with no parameters.
    pub fn new(title: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            action: action.into(),
            ..Self::default()
        }
    }

    /// Builds a draft from typed parameters.
    pub fn from_task(title: impl Into<String>, task: TaskParams) -> Self {
        let (action, params) = task.into_parts();
        Self {
            title: title.into(),
            action,
            params,
            ..Self::default()
        }
    }

    /// Sets the catalog lecture association.
    pub fn with_lecture(mut self, lecture_id: impl Into<String>) -> Self {
        self.lecture_id = Some(lecture_id.into());
        self
    }

    /// Sets the duration estimate.
    pub fn with_est_ms(mut self, est_ms: u64) -> Self {
        self.est_ms = est_ms;
        self
    }

    /// Appends a prerequisite label.
    pub fn with_prereq(mut self, label: impl Into<String>) -> Self {
        self.prereqs.push(label.into());
        self
    }
}

/// Partial per-item update merged by [`crate::core::store::CartStore::hydrate_from_batch`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemUpdate {
    /// Target item.
    pub id: ItemId,
    /// Replacement state.
    pub state: Option<ItemState>,
    /// Replacement estimate.
    pub est_ms: Option<u64>,
    /// Lines to append in order.
    pub logs: Vec<LogDraft>,
}

/// Rejected parameters for a modeled action kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    /// A field had the wrong JSON type.
    #[error("action `{action}`: field `{field}` must be {expected}")]
    WrongType {
        /// Action kind.
        action: String,
        /// Offending field.
        field: String,
        /// Expected JSON type.
        expected: &'static str,
    },
}

/// Typed parameters per action kind, with an opaque fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskParams {
    /// Speech-to-text over the lecture audio.
    Transcribe {
        /// Model override.
        model: Option<String>,
        /// Spoken language hint.
        language: Option<String>,
    },
    /// Slide extraction and rendering.
    ProcessSlides {
        /// Run OCR over rendered slides.
        ocr: bool,
        /// Render resolution.
        dpi: Option<u32>,
    },
    /// Notes generation from transcript and slides.
    GenerateNotes {
        /// Output style hint.
        style: Option<String>,
    },
    /// Action kind not modeled here; parameters pass through untouched.
    Other {
        /// Action kind.
        action: String,
        /// Raw parameters.
        params: ParamMap,
    },
}

impl TaskParams {
    /// Action name for transcription.
    pub const TRANSCRIBE: &'static str = "transcribe";
    /// Action name for slide processing.
    pub const PROCESS_SLIDES: &'static str = "process_slides";
    /// Action name for notes generation.
    pub const GENERATE_NOTES: &'static str = "generate_notes";

    /// Parses a wire `(action, params)` pair. Unknown actions never fail.
    pub fn parse(action: &str, params: &ParamMap) -> Result<Self, ParamsError> {
        match action {
            Self::TRANSCRIBE => Ok(Self::Transcribe {
                model: opt_str(action, params, "model")?,
                language: opt_str(action, params, "language")?,
            }),
            Self::PROCESS_SLIDES => {
                let ocr = match params.get("ocr") {
                    None | Some(Value::Null) => false,
                    Some(Value::Bool(b)) => *b,
                    Some(_) => return Err(wrong_type(action, "ocr", "a boolean")),
                };
                let dpi = match params.get("dpi") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(
                        v.as_u64()
                            .and_then(|n| u32::try_from(n).ok())
                            .ok_or_else(|| wrong_type(action, "dpi", "a positive integer"))?,
                    ),
                };
                Ok(Self::ProcessSlides { ocr, dpi })
            }
            Self::GENERATE_NOTES => Ok(Self::GenerateNotes {
                style: opt_str(action, params, "style")?,
            }),
            other => Ok(Self::Other {
                action: other.to_string(),
                params: params.clone(),
            }),
        }
    }

    /// Splits into the wire `(action, params)` pair.
    pub fn into_parts(self) -> (String, ParamMap) {
        let mut map = ParamMap::new();
        let action = match self {
            Self::Transcribe { model, language } => {
                if let Some(v) = model {
                    map.insert("model".into(), Value::String(v));
                }
                if let Some(v) = language {
                    map.insert("language".into(), Value::String(v));
                }
                Self::TRANSCRIBE.to_string()
            }
            Self::ProcessSlides { ocr, dpi } => {
                map.insert("ocr".into(), Value::Bool(ocr));
                if let Some(v) = dpi {
                    map.insert("dpi".into(), Value::from(v));
                }
                Self::PROCESS_SLIDES.to_string()
            }
            Self::GenerateNotes { style } => {
                if let Some(v) = style {
                    map.insert("style".into(), Value::String(v));
                }
                Self::GENERATE_NOTES.to_string()
            }
            Self::Other { action, params } => {
                map = params;
                action
            }
        };
        (action, map)
    }
}

fn opt_str(action: &str, params: &ParamMap, field: &str) -> Result<Option<String>, ParamsError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(wrong_type(action, field, "a string")),
    }
}

fn wrong_type(action: &str, field: &str, expected: &'static str) -> ParamsError {
    ParamsError::WrongType {
        action: action.to_string(),
        field: field.to_string(),
        expected,
    }
}
