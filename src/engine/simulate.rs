use rand::Rng;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Duration, Instant},
};
use tracing::debug;

use crate::{
    item::LogDraft,
    runtime::handle::{CartHandle, RuntimeError},
    types::{BatchId, ItemId, ItemState},
};

use super::{EngineConfig, batch_cleared, complete_batch};

/// One scheduled transition, relative to the simulation start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimStep {
    pub at: Duration,
    pub item: ItemId,
    pub state: ItemState,
    pub message: &'static str,
}

/// Stand-in deadline for offsets past what [`Instant`] can represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimControl {
    Running,
    Paused,
    Cancelled,
}

/// Lays out `idle -> running -> success` for each `(id, est_ms)` in cart order.
///
/// Item `n` starts at `n * stagger`; its duration is drawn from the upper half
/// of `min(est_ms, cap)`, or of the cap when there is no estimate.
pub fn plan(items: &[(ItemId, u64)], config: &EngineConfig, rng: &mut impl Rng) -> Vec<SimStep> {
    let cap = config.effective_cap_ms();
    let mut steps = Vec::with_capacity(items.len() * 2);

    for (pos, (id, est_ms)) in items.iter().enumerate() {
        let start = config.simulation_stagger_ms.saturating_mul(pos as u64);
        let bound = if *est_ms == 0 { cap } else { (*est_ms).min(cap) };
        let duration = rng.gen_range(bound / 2..=bound);

        steps.push(SimStep {
            at: Duration::from_millis(start),
            item: *id,
            state: ItemState::Running,
            message: "Started (simulated)",
        });
        steps.push(SimStep {
            at: Duration::from_millis(start.saturating_add(duration)),
            item: *id,
            state: ItemState::Success,
            message: "Completed (simulated)",
        });
    }

    steps.sort_by_key(|s| s.at);
    steps
}

/// A locally driven batch that never touches the network.
pub struct Simulation {
    batch_id: BatchId,
    control: watch::Sender<SimControl>,
    task: Option<JoinHandle<()>>,
}

impl Simulation {
    pub fn start(handle: CartHandle, batch_id: BatchId, steps: Vec<SimStep>) -> Self {
        let (control, control_rx) = watch::channel(SimControl::Running);
        let task_batch = batch_id.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = drive(&handle, &task_batch, steps, control_rx).await {
                debug!(batch_id = %task_batch, error = %err, "simulation ended with runtime error");
            }
        });
        Self {
            batch_id,
            control,
            task: Some(task),
        }
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    pub fn pause(&self) {
        self.signal(SimControl::Paused);
    }

    pub fn resume(&self) {
        self.signal(SimControl::Running);
    }

    pub fn cancel(&self) {
        self.control.send_replace(SimControl::Cancelled);
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn signal(&self, next: SimControl) {
        self.control.send_if_modified(|current| {
            if *current == SimControl::Cancelled || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn drive(
    handle: &CartHandle,
    batch_id: &BatchId,
    steps: Vec<SimStep>,
    mut control: watch::Receiver<SimControl>,
) -> Result<(), RuntimeError> {
    let mut events = handle.subscribe();
    let base = Instant::now();
    let mut shift = Duration::ZERO;
    let mut started: Vec<ItemId> = Vec::new();

    for step in steps {
        loop {
            let signal = *control.borrow_and_update();
            match signal {
                SimControl::Cancelled => return Ok(()),
                SimControl::Paused => {
                    let paused_at = Instant::now();
                    for id in &started {
                        handle.update_item_state(*id, ItemState::Paused).await?;
                    }
                    tokio::select! {
                        changed = control.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                        _ = batch_cleared(&mut events, batch_id) => return Ok(()),
                    }
                    shift += paused_at.elapsed();
                    if *control.borrow() == SimControl::Running {
                        for id in &started {
                            handle.update_item_state(*id, ItemState::Running).await?;
                        }
                    }
                }
                SimControl::Running => {
                    let deadline = deadline_after(base, step.at.saturating_add(shift));
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => break,
                        changed = control.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                        _ = batch_cleared(&mut events, batch_id) => return Ok(()),
                    }
                }
            }
        }

        handle.update_item_state(step.item, step.state).await?;
        handle
            .append_item_log(step.item, LogDraft::info(step.message))
            .await?;
        match step.state {
            ItemState::Running => started.push(step.item),
            _ => started.retain(|id| *id != step.item),
        }
    }

    complete_batch(handle, batch_id).await?;
    Ok(())
}

fn deadline_after(base: Instant, offset: Duration) -> Instant {
    base.checked_add(offset)
        .unwrap_or_else(|| Instant::now() + FAR_FUTURE)
}
