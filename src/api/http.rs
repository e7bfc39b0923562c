//! reqwest-backed gateway client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, header::ACCEPT};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    catalog::{BulkLectureUpdate, CatalogApi, ClassNode},
    types::{BatchId, ItemId},
};

use super::{
    ApiError, BatchAck, BatchApi, BatchCommand, BatchLogs, BatchStream, EnqueueRequest,
    ReorderRequest, UpdateBatchRequest, sse::data_stream,
};

/// HTTP client for the batch and catalog endpoints under one base URL.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpGateway {
    /// Builds a client with a per-request timeout.
    ///
    /// The timeout is not applied to the long-lived event stream.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .user_agent(concat!("lecturecart/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(request_timeout)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn batch_url(&self, batch_id: &BatchId, suffix: &str) -> String {
        self.url(&format!("batches/{}{}", batch_id, suffix))
    }
}

async fn checked(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
    let bytes = checked(resp).await?.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl BatchApi for HttpGateway {
    async fn enqueue_batch(&self, request: &EnqueueRequest) -> Result<BatchAck, ApiError> {
        let resp = self
            .client
            .post(self.url("batches"))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }

    async fn update_batch(
        &self,
        batch_id: &BatchId,
        command: BatchCommand,
    ) -> Result<BatchAck, ApiError> {
        let resp = self
            .client
            .patch(self.batch_url(batch_id, ""))
            .timeout(self.request_timeout)
            .json(&UpdateBatchRequest { command })
            .send()
            .await?;
        decode(resp).await
    }

    async fn reorder_batch(&self, batch_id: &BatchId, order: &[ItemId]) -> Result<(), ApiError> {
        let resp = self
            .client
            .post(self.batch_url(batch_id, "/reorder"))
            .timeout(self.request_timeout)
            .json(&ReorderRequest {
                order: order.to_vec(),
            })
            .send()
            .await?;
        checked(resp).await?;
        Ok(())
    }

    async fn fetch_batch_logs(&self, batch_id: &BatchId) -> Result<BatchLogs, ApiError> {
        let resp = self
            .client
            .get(self.batch_url(batch_id, "/logs"))
            .timeout(self.request_timeout)
            .send()
            .await?;
        decode(resp).await
    }

    async fn open_batch_stream(&self, batch_id: &BatchId) -> Result<BatchStream, ApiError> {
        let resp = self
            .client
            .get(self.batch_url(batch_id, "/events"))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        let resp = checked(resp).await?;
        debug!(batch_id = %batch_id, "batch event stream opened");

        Ok(data_stream(resp.bytes_stream()))
    }
}

#[async_trait]
impl CatalogApi for HttpGateway {
    async fn list_classes(&self) -> Result<Vec<ClassNode>, ApiError> {
        let resp = self
            .client
            .get(self.url("classes"))
            .timeout(self.request_timeout)
            .send()
            .await?;
        decode(resp).await
    }

    async fn bulk_update_lectures(&self, request: &BulkLectureUpdate) -> Result<(), ApiError> {
        let resp = self
            .client
            .patch(self.url("lectures/bulk"))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;
        checked(resp).await?;
        Ok(())
    }
}
