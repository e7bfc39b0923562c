use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::{
    api::{ApiError, BatchAck, BatchApi, BatchCommand, EnqueueRequest, TaskSpec},
    core::store::CartSnapshot,
    error::CartError,
    preset::CartPreset,
    runtime::{
        events::{CartEvent, Notice, NoticeKind},
        handle::CartHandle,
    },
    types::{BatchId, ItemId, OnCompletion, Parallelism, PresetId},
};

use super::{
    EngineConfig,
    pending::{EngineCommand, PendingFlags, PendingSnapshot},
    reconcile::BatchSubscription,
    simulate::{self, Simulation},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub dry_run: bool,
    pub preset_name: Option<String>,
}

impl RunOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            preset_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Dry run passed; nothing was started.
    Validated { count: usize },
    /// The gateway accepted the batch and reconciliation is attached.
    Started { batch_id: BatchId },
    /// No gateway configured; a local simulation is driving the items.
    Simulated { batch_id: BatchId },
}

enum ActiveRun {
    Remote(BatchSubscription),
    Local(Simulation),
}

impl ActiveRun {
    fn batch_id(&self) -> &BatchId {
        match self {
            Self::Remote(sub) => sub.batch_id(),
            Self::Local(sim) => sim.batch_id(),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Self::Remote(sub) => sub.is_finished(),
            Self::Local(sim) => sim.is_finished(),
        }
    }

    async fn stop(self) {
        match self {
            Self::Remote(sub) => {
                sub.stop();
                sub.join().await;
            }
            Self::Local(sim) => {
                sim.cancel();
                sim.join().await;
            }
        }
    }
}

/// Run lifecycle between the cart runtime and an optional batch gateway.
///
/// Every failed command is also broadcast as a [`Notice`] before it is returned.
pub struct CartEngine {
    handle: CartHandle,
    api: Option<Arc<dyn BatchApi>>,
    config: EngineConfig,
    pending: Arc<PendingFlags>,
    active: Mutex<Option<ActiveRun>>,
}

impl CartEngine {
    pub fn new(handle: CartHandle, api: Option<Arc<dyn BatchApi>>, config: EngineConfig) -> Self {
        Self {
            handle,
            api,
            config,
            pending: Arc::new(PendingFlags::default()),
            active: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> &CartHandle {
        &self.handle
    }

    pub fn is_simulated(&self) -> bool {
        self.api.is_none()
    }

    pub fn pending(&self) -> PendingSnapshot {
        self.pending.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CartEvent> {
        self.handle.subscribe()
    }

    /// True while a stream follower or simulation is still driving the active batch.
    pub async fn is_following(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| !run.is_finished())
    }

    pub async fn snapshot(&self) -> Result<CartSnapshot, CartError> {
        self.report(self.handle.snapshot().await.map_err(CartError::from))
    }

    /// Submits the cart as a batch, or validates it when `dry_run` is set.
    pub async fn run(&self, options: RunOptions) -> Result<RunOutcome, CartError> {
        let command = if options.dry_run {
            EngineCommand::DryRun
        } else {
            EngineCommand::Run
        };
        let _pending = self.pending.begin(command);
        let result = self.run_inner(options).await;
        self.report(result)
    }

    pub async fn dry_run(&self) -> Result<RunOutcome, CartError> {
        self.run(RunOptions::dry_run()).await
    }

    pub async fn pause(&self) -> Result<(), CartError> {
        let _pending = self.pending.begin(EngineCommand::Pause);
        let result = self.control(BatchCommand::Pause).await;
        self.report(result)
    }

    pub async fn resume(&self) -> Result<(), CartError> {
        let _pending = self.pending.begin(EngineCommand::Resume);
        let result = self.control(BatchCommand::Resume).await;
        self.report(result)
    }

    pub async fn cancel(&self) -> Result<(), CartError> {
        let _pending = self.pending.begin(EngineCommand::Cancel);
        let result = self.control(BatchCommand::Cancel).await;
        self.report(result)
    }

    /// Applies `order` locally, then forwards it to the active remote batch.
    ///
    /// The forward is best-effort and never rolls the local order back.
    pub async fn reorder(&self, order: Vec<ItemId>) -> Result<Vec<ItemId>, CartError> {
        let _pending = self.pending.begin(EngineCommand::Reorder);
        let result = self.reorder_inner(order).await;
        self.report(result)
    }

    pub async fn remove_item(&self, id: ItemId) -> Result<bool, CartError> {
        let _pending = self.pending.begin(EngineCommand::RemoveItem);
        self.report(self.handle.remove_item(id).await.map_err(CartError::from))
    }

    pub async fn set_parallelism(&self, parallelism: Parallelism) -> Result<(), CartError> {
        let _pending = self.pending.begin(EngineCommand::SetParallelism);
        self.report(
            self.handle
                .set_parallelism(parallelism)
                .await
                .map_err(CartError::from),
        )
    }

    pub async fn set_on_completion(&self, on_completion: OnCompletion) -> Result<(), CartError> {
        let _pending = self.pending.begin(EngineCommand::SetOnCompletion);
        self.report(
            self.handle
                .set_on_completion(on_completion)
                .await
                .map_err(CartError::from),
        )
    }

    pub async fn save_preset(&self, name: &str) -> Result<CartPreset, CartError> {
        let _pending = self.pending.begin(EngineCommand::SavePreset);
        let result: Result<CartPreset, CartError> = async {
            let name = name.trim();
            if name.is_empty() {
                return Err(CartError::Validation("preset name is empty".to_string()));
            }
            Ok(self.handle.save_preset(name).await?)
        }
        .await;
        self.report(result)
    }

    pub async fn delete_preset(&self, id: PresetId) -> Result<bool, CartError> {
        let _pending = self.pending.begin(EngineCommand::DeletePreset);
        self.report(self.handle.delete_preset(id).await.map_err(CartError::from))
    }

    /// Replaces the cart with a preset, detaching from any active batch first.
    pub async fn load_preset(&self, id: PresetId) -> Result<(), CartError> {
        let _pending = self.pending.begin(EngineCommand::LoadPreset);
        let result: Result<(), CartError> = async {
            let snapshot = self.handle.snapshot().await?;
            if !snapshot.presets.iter().any(|p| p.id == id) {
                return Err(CartError::Validation(format!("unknown preset {id}")));
            }
            self.stop_active().await;
            self.handle.load_preset(id).await?;
            Ok(())
        }
        .await;
        self.report(result)
    }

    /// Re-attaches to a batch left active by a previous session.
    ///
    /// Local simulations cannot outlive their process, so a persisted local
    /// batch is cleared instead. Returns the batch now being followed.
    pub async fn resume_active_batch(&self) -> Result<Option<BatchId>, CartError> {
        let result = self.resume_active_inner().await;
        self.report(result)
    }

    /// Stops any stream or simulation owned by this engine.
    pub async fn dispose(&self) {
        self.stop_active().await;
    }

    async fn run_inner(&self, options: RunOptions) -> Result<RunOutcome, CartError> {
        let snapshot = self.handle.snapshot().await?;
        if snapshot.items.is_empty() {
            return Err(CartError::Validation("cart is empty".to_string()));
        }
        // A batch whose stream dropped without completing may be replaced.
        if !options.dry_run && snapshot.running && self.is_following().await {
            return Err(CartError::Precondition(
                "a batch is already running".to_string(),
            ));
        }

        let Some(api) = &self.api else {
            if options.dry_run {
                return Ok(RunOutcome::Validated {
                    count: snapshot.items.len(),
                });
            }
            return self.start_simulation(&snapshot).await;
        };

        let action = if options.dry_run {
            "validate the cart"
        } else {
            "start the batch"
        };
        let request = EnqueueRequest {
            parallelism: snapshot.parallelism,
            on_completion: snapshot.on_completion,
            tasks: snapshot.items.iter().map(TaskSpec::from).collect(),
            dry_run: options.dry_run.then_some(true),
            preset_name: options.preset_name,
        };
        let ack = api
            .enqueue_batch(&request)
            .await
            .map_err(|e| CartError::transport(action, e))?;
        let ack = accepted(ack, action)?;

        if options.dry_run {
            let count = ack.validated.unwrap_or(request.tasks.len());
            info!(count, "dry run validated");
            return Ok(RunOutcome::Validated { count });
        }

        self.stop_active().await;
        self.handle.begin_batch(ack.id.clone()).await?;
        let sub = BatchSubscription::start(Arc::clone(api), self.handle.clone(), ack.id.clone());
        *self.active.lock().await = Some(ActiveRun::Remote(sub));
        info!(batch_id = %ack.id, tasks = request.tasks.len(), "batch accepted");
        Ok(RunOutcome::Started { batch_id: ack.id })
    }

    async fn start_simulation(&self, snapshot: &CartSnapshot) -> Result<RunOutcome, CartError> {
        let batch_id = BatchId::local();
        let items: Vec<(ItemId, u64)> = snapshot.items.iter().map(|i| (i.id, i.est_ms)).collect();
        let steps = simulate::plan(&items, &self.config, &mut rand::thread_rng());

        self.stop_active().await;
        self.handle.begin_batch(batch_id.clone()).await?;
        let sim = Simulation::start(self.handle.clone(), batch_id.clone(), steps);
        *self.active.lock().await = Some(ActiveRun::Local(sim));
        info!(batch_id = %batch_id, items = items.len(), "simulating batch locally");
        Ok(RunOutcome::Simulated { batch_id })
    }

    async fn control(&self, command: BatchCommand) -> Result<(), CartError> {
        let verb = command.as_str();
        let batch_id = self
            .handle
            .snapshot()
            .await?
            .active_batch_id
            .ok_or_else(|| CartError::Precondition(format!("no active batch to {verb}")))?;

        match &self.api {
            Some(api) if !batch_id.is_local() => {
                let action = match command {
                    BatchCommand::Pause => "pause the batch",
                    BatchCommand::Resume => "resume the batch",
                    BatchCommand::Cancel => "cancel the batch",
                };
                let ack = api
                    .update_batch(&batch_id, command)
                    .await
                    .map_err(|e| CartError::transport(action, e))?;
                accepted(ack, action)?;
            }
            _ => self.signal_simulation(&batch_id, command).await,
        }

        match command {
            BatchCommand::Pause => self.handle.set_running(false).await?,
            BatchCommand::Resume => self.handle.set_running(true).await?,
            BatchCommand::Cancel => {
                self.stop_active().await;
                self.handle.finish_batch(batch_id.clone()).await?;
                self.handle.notify(Notice::new(
                    NoticeKind::Info,
                    "Batch cancelled",
                    format!("Batch {batch_id} was cancelled."),
                ));
            }
        }
        info!(batch_id = %batch_id, command = verb, "batch control applied");
        Ok(())
    }

    async fn signal_simulation(&self, batch_id: &BatchId, command: BatchCommand) {
        let active = self.active.lock().await;
        if let Some(ActiveRun::Local(sim)) = active.as_ref() {
            if sim.batch_id() == batch_id {
                match command {
                    BatchCommand::Pause => sim.pause(),
                    BatchCommand::Resume => sim.resume(),
                    BatchCommand::Cancel => sim.cancel(),
                }
            }
        }
    }

    async fn reorder_inner(&self, order: Vec<ItemId>) -> Result<Vec<ItemId>, CartError> {
        let applied = self.handle.reorder_by_ids(order).await?;
        let active = self.handle.snapshot().await?.active_batch_id;

        if let (Some(api), Some(batch_id)) = (&self.api, active) {
            if !batch_id.is_local() {
                let api = Arc::clone(api);
                let order = applied.clone();
                tokio::spawn(async move {
                    if let Err(err) = api.reorder_batch(&batch_id, &order).await {
                        warn!(batch_id = %batch_id, error = %err, "batch reorder not forwarded");
                    }
                });
            }
        }
        Ok(applied)
    }

    async fn resume_active_inner(&self) -> Result<Option<BatchId>, CartError> {
        let Some(batch_id) = self.handle.snapshot().await?.active_batch_id else {
            return Ok(None);
        };

        let api = match &self.api {
            Some(api) if !batch_id.is_local() => Arc::clone(api),
            _ => {
                warn!(batch_id = %batch_id, "dropping batch that cannot be followed");
                self.handle.finish_batch(batch_id).await?;
                return Ok(None);
            }
        };

        if self
            .active
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| run.batch_id() == &batch_id && !run.is_finished())
        {
            return Ok(Some(batch_id));
        }

        self.stop_active().await;
        self.handle.set_running(true).await?;
        let sub = BatchSubscription::start(api, self.handle.clone(), batch_id.clone());
        *self.active.lock().await = Some(ActiveRun::Remote(sub));
        info!(batch_id = %batch_id, "re-attached to active batch");
        Ok(Some(batch_id))
    }

    async fn stop_active(&self) {
        let active = self.active.lock().await.take();
        if let Some(run) = active {
            run.stop().await;
        }
    }

    fn report<T>(&self, result: Result<T, CartError>) -> Result<T, CartError> {
        if let Err(err) = &result {
            warn!(error = %err, "cart command failed");
            self.handle.notify(err.notice());
        }
        result
    }
}

fn accepted(ack: BatchAck, action: &'static str) -> Result<BatchAck, CartError> {
    if ack.accepted {
        return Ok(ack);
    }
    let reason = ack
        .status
        .unwrap_or_else(|| format!("batch {} was not accepted", ack.id));
    Err(CartError::transport(action, ApiError::Rejected(reason)))
}
