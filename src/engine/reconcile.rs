use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    api::{BatchApi, BatchEvent, BatchLogs},
    item::{ItemUpdate, LogDraft},
    runtime::handle::{CartHandle, RuntimeError},
    types::BatchId,
};

use super::{batch_cleared, complete_batch};

#[derive(Debug, Error)]
#[error("unparsable batch event: {source}")]
pub struct StreamParseError {
    pub payload: String,
    #[source]
    pub source: serde_json::Error,
}

pub fn parse_event(payload: &str) -> Result<BatchEvent, StreamParseError> {
    serde_json::from_str(payload).map_err(|source| StreamParseError {
        payload: payload.to_string(),
        source,
    })
}

/// Catch-up entries as ordered single-entry updates.
pub fn catch_up_updates(logs: BatchLogs) -> Vec<ItemUpdate> {
    logs.entries
        .into_iter()
        .filter_map(|entry| {
            let id = entry.item_id?;
            Some(ItemUpdate {
                id,
                state: entry.state,
                est_ms: None,
                logs: entry.log_draft().into_iter().collect(),
            })
        })
        .collect()
}

/// Store update carried by a live event, if it targets an item.
pub fn event_update(event: &BatchEvent) -> Option<ItemUpdate> {
    let id = event.item_id?;
    let logs = event
        .message
        .as_ref()
        .map(|m| LogDraft::new(event.level.unwrap_or_default(), m.clone()))
        .into_iter()
        .collect();
    Some(ItemUpdate {
        id,
        state: event.state,
        est_ms: event.est_ms,
        logs,
    })
}

/// Live link between one batch and the store.
///
/// Stopping is idempotent and also happens on drop. The underlying stream is
/// owned by the task and closed on every exit path.
pub struct BatchSubscription {
    batch_id: BatchId,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl BatchSubscription {
    pub fn start(api: Arc<dyn BatchApi>, handle: CartHandle, batch_id: BatchId) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(reconcile(api, handle, batch_id.clone(), stop_rx));
        Self {
            batch_id,
            stop_tx,
            task: Some(task),
        }
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Waits for the task to exit after [`Self::stop`] or natural completion.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for BatchSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn reconcile(
    api: Arc<dyn BatchApi>,
    handle: CartHandle,
    batch_id: BatchId,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut events = handle.subscribe();

    // Completion clears the active batch itself; let the follower finish first.
    tokio::select! {
        biased;
        res = follow_batch(api.as_ref(), &handle, &batch_id) => {
            if let Err(err) = res {
                debug!(batch_id = %batch_id, error = %err, "reconciliation ended with runtime error");
            }
        }
        _ = stopped(&mut stop_rx) => {
            debug!(batch_id = %batch_id, "batch subscription stopped");
        }
        _ = batch_cleared(&mut events, &batch_id) => {
            debug!(batch_id = %batch_id, "active batch cleared; closing stream");
        }
    }
}

async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn follow_batch(api: &dyn BatchApi, handle: &CartHandle, batch_id: &BatchId) -> Result<(), RuntimeError> {
    match api.fetch_batch_logs(batch_id).await {
        Ok(logs) => {
            let updates = catch_up_updates(logs);
            if !updates.is_empty() {
                handle.hydrate_from_batch(batch_id.clone(), updates).await?;
            }
        }
        Err(err) => warn!(batch_id = %batch_id, error = %err, "catch-up log fetch failed"),
    }

    let mut stream = match api.open_batch_stream(batch_id).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(batch_id = %batch_id, error = %err, "could not open batch event stream");
            return Ok(());
        }
    };

    while let Some(next) = stream.next().await {
        let payload = match next {
            Ok(payload) => payload,
            Err(err) => {
                warn!(batch_id = %batch_id, error = %err, "batch event stream closed");
                break;
            }
        };

        let event = match parse_event(&payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(batch_id = %batch_id, error = %err, payload = %err.payload, "dropping batch event");
                continue;
            }
        };
        debug!(batch_id = %batch_id, ?event, "batch event");

        if let Some(update) = event_update(&event) {
            handle.hydrate_from_batch(batch_id.clone(), vec![update]).await?;
        }
        if event.is_batch_completed() {
            complete_batch(handle, batch_id).await?;
            break;
        }
    }
    Ok(())
}
