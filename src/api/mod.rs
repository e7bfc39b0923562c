//! API gateway seam: wire payloads, the [`BatchApi`] trait and its HTTP client.

pub mod http;
pub mod sse;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    item::{CartItem, LogDraft, ParamMap},
    types::{BatchId, ItemId, ItemState, LogLevel, OnCompletion, Parallelism},
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("event stream failed: {0}")]
    Stream(String),
}

/// One task as submitted to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub id: ItemId,
    pub title: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lecture_id: Option<String>,
    #[serde(default)]
    pub params: ParamMap,
    #[serde(default)]
    pub est_ms: u64,
    #[serde(default)]
    pub prereqs: Vec<String>,
}

impl From<&CartItem> for TaskSpec {
    fn from(item: &CartItem) -> Self {
        Self {
            id: item.id,
            title: item.title.clone(),
            action: item.action.clone(),
            lecture_id: item.lecture_id.clone(),
            params: item.params.clone(),
            est_ms: item.est_ms,
            prereqs: item.prereqs.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub parallelism: Parallelism,
    pub on_completion: OnCompletion,
    pub tasks: Vec<TaskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset_name: Option<String>,
}

/// Gateway acknowledgement for enqueue and control requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAck {
    pub id: BatchId,
    #[serde(default = "default_accepted")]
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Number of tasks that passed validation, reported for dry runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated: Option<usize>,
}

fn default_accepted() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchCommand {
    Pause,
    Resume,
    Cancel,
}

impl BatchCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBatchRequest {
    pub command: BatchCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderRequest {
    pub order: Vec<ItemId>,
}

/// Historical log line returned by the catch-up fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchLogEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub item_id: Option<ItemId>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub state: Option<ItemState>,
}

impl BatchLogEntry {
    /// Log line to append, if the entry carries a message.
    pub fn log_draft(&self) -> Option<LogDraft> {
        let message = self.message.clone()?;
        Some(LogDraft {
            level: self.level.unwrap_or_default(),
            message,
            timestamp: self.timestamp,
            id: self.id.as_deref().and_then(|s| Uuid::parse_str(s).ok()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchLogs {
    #[serde(default)]
    pub entries: Vec<BatchLogEntry>,
}

/// Live event pushed on a batch stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEvent {
    #[serde(default)]
    pub item_id: Option<ItemId>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub state: Option<ItemState>,
    #[serde(default)]
    pub est_ms: Option<u64>,
    #[serde(default)]
    pub batch_state: Option<String>,
}

impl BatchEvent {
    pub const COMPLETED: &'static str = "completed";

    pub fn is_batch_completed(&self) -> bool {
        self.batch_state.as_deref() == Some(Self::COMPLETED)
    }
}

/// Raw event payloads from a batch stream, one `data` block per element.
pub type BatchStream = BoxStream<'static, Result<String, ApiError>>;

/// Remote batch execution endpoints.
#[async_trait]
pub trait BatchApi: Send + Sync {
    async fn enqueue_batch(&self, request: &EnqueueRequest) -> Result<BatchAck, ApiError>;
    async fn update_batch(
        &self,
        batch_id: &BatchId,
        command: BatchCommand,
    ) -> Result<BatchAck, ApiError>;
    async fn reorder_batch(&self, batch_id: &BatchId, order: &[ItemId]) -> Result<(), ApiError>;
    async fn fetch_batch_logs(&self, batch_id: &BatchId) -> Result<BatchLogs, ApiError>;
    /// Opens the server-push stream scoped to `batch_id`.
    async fn open_batch_stream(&self, batch_id: &BatchId) -> Result<BatchStream, ApiError>;
}
