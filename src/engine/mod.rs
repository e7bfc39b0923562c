//! Run lifecycle over the cart runtime and the batch gateway.

/// Cart engine commands.
pub mod cart;
/// Per-command in-flight flags.
pub mod pending;
/// Catch-up and live stream reconciliation.
pub mod reconcile;
/// Offline stand-in for the batch gateway.
pub mod simulate;

use tokio::sync::broadcast;
use tracing::info;

use crate::{
    core::store::StoreChange,
    runtime::{
        events::{CartEvent, Notice, NoticeKind},
        handle::{CartHandle, RuntimeError},
    },
    types::{BatchId, OnCompletion},
};

/// Upper bound for one simulated item, whatever its estimate says.
pub const SIMULATION_CAP_MS: u64 = 3000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delay between simulated item starts, multiplied by position.
    pub simulation_stagger_ms: u64,
    /// Simulated duration cap; clamped to [`SIMULATION_CAP_MS`].
    pub simulation_cap_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            simulation_stagger_ms: 350,
            simulation_cap_ms: SIMULATION_CAP_MS,
        }
    }
}

impl EngineConfig {
    pub fn effective_cap_ms(&self) -> u64 {
        self.simulation_cap_ms.clamp(1, SIMULATION_CAP_MS)
    }
}

/// Clears `running` and the active batch, then announces completion.
///
/// Returns false when `batch_id` was no longer the active batch.
pub(crate) async fn complete_batch(handle: &CartHandle, batch_id: &BatchId) -> Result<bool, RuntimeError> {
    let on_completion = handle.snapshot().await?.on_completion;
    if !handle.finish_batch(batch_id.clone()).await? {
        return Ok(false);
    }

    info!(batch_id = %batch_id, "batch completed");
    handle.emit(CartEvent::BatchCompleted {
        batch_id: batch_id.clone(),
    });
    match on_completion {
        OnCompletion::Notify => handle.notify(Notice::new(
            NoticeKind::Success,
            "Batch complete",
            format!("Batch {batch_id} finished."),
        )),
        OnCompletion::Shutdown => {
            handle.emit(CartEvent::ShutdownRequested {
                batch_id: batch_id.clone(),
            });
            handle.notify(Notice::new(
                NoticeKind::Info,
                "Batch complete",
                format!("Batch {batch_id} finished; shutdown requested."),
            ));
        }
        OnCompletion::Nothing => {}
    }
    Ok(true)
}

/// Resolves once `batch_id` stops being the active batch or the runtime closes.
pub(crate) async fn batch_cleared(events: &mut broadcast::Receiver<CartEvent>, batch_id: &BatchId) {
    loop {
        match events.recv().await {
            Ok(CartEvent::Store(StoreChange::ActiveBatchChanged { batch_id: active }))
                if active.as_ref() != Some(batch_id) =>
            {
                return;
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
