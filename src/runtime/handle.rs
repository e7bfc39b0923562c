use std::sync::Arc;

use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot, watch},
    time::{Duration, Instant},
};
use tracing::{debug, error};

use crate::{
    core::store::{CartSnapshot, CartStore, PersistedState},
    item::{ItemDraft, ItemUpdate, LogDraft},
    persist::{PersistError, StateSink},
    preset::CartPreset,
    types::{BatchId, ItemId, ItemState, OnCompletion, Parallelism, PresetId},
};

use super::events::{CartEvent, Notice};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("persistence failed: {0}")]
    Persist(#[from] PersistError),
    #[error("cart runtime is no longer running")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub persist_debounce_ms: u64,
    pub command_queue_bound: usize,
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            persist_debounce_ms: 150,
            command_queue_bound: 256,
            event_capacity: 1024,
        }
    }
}

/// Cloneable front door to the single task that owns the [`CartStore`].
#[derive(Clone)]
pub struct CartHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<CartEvent>,
}

enum Command {
    AddItem {
        draft: ItemDraft,
        resp: oneshot::Sender<ItemId>,
    },
    RemoveItem {
        id: ItemId,
        resp: oneshot::Sender<bool>,
    },
    UpdateItemState {
        id: ItemId,
        state: ItemState,
        resp: oneshot::Sender<bool>,
    },
    AppendItemLog {
        id: ItemId,
        log: LogDraft,
        resp: oneshot::Sender<bool>,
    },
    ClearItemLogs {
        id: ItemId,
        resp: oneshot::Sender<bool>,
    },
    SetItemEstimate {
        id: ItemId,
        est_ms: u64,
        resp: oneshot::Sender<bool>,
    },
    Reorder {
        from: usize,
        to: usize,
        resp: oneshot::Sender<Vec<ItemId>>,
    },
    ReorderByIds {
        order: Vec<ItemId>,
        resp: oneshot::Sender<Vec<ItemId>>,
    },
    Clear {
        resp: oneshot::Sender<()>,
    },
    SavePreset {
        name: String,
        resp: oneshot::Sender<CartPreset>,
    },
    LoadPreset {
        id: PresetId,
        resp: oneshot::Sender<bool>,
    },
    DeletePreset {
        id: PresetId,
        resp: oneshot::Sender<bool>,
    },
    HydrateFromBatch {
        batch_id: BatchId,
        updates: Vec<ItemUpdate>,
        resp: oneshot::Sender<usize>,
    },
    SetActiveBatch {
        batch_id: Option<BatchId>,
        resp: oneshot::Sender<()>,
    },
    BeginBatch {
        batch_id: BatchId,
        resp: oneshot::Sender<()>,
    },
    FinishBatch {
        batch_id: BatchId,
        resp: oneshot::Sender<bool>,
    },
    SetRunning {
        running: bool,
        resp: oneshot::Sender<()>,
    },
    SetParallelism {
        parallelism: Parallelism,
        resp: oneshot::Sender<()>,
    },
    SetOnCompletion {
        on_completion: OnCompletion,
        resp: oneshot::Sender<()>,
    },
    Snapshot {
        resp: oneshot::Sender<CartSnapshot>,
    },
    Flush {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum PersistCtl {
    Flush {
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

struct PersistLink {
    state_tx: watch::Sender<Option<PersistedState>>,
    ctl_tx: mpsc::Sender<PersistCtl>,
}

/// Spawns the single-writer loop; must be called inside a tokio runtime.
pub fn spawn_cart(
    store: CartStore,
    sink: Option<Box<dyn StateSink>>,
    config: RuntimeConfig,
) -> CartHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound);
    let (events_tx, _) = broadcast::channel::<CartEvent>(config.event_capacity);

    let persist = sink.map(|sink| {
        let (state_tx, state_rx) = watch::channel(None);
        let (ctl_tx, ctl_rx) = mpsc::channel(8);
        spawn_persistence_worker(
            sink,
            state_rx,
            ctl_rx,
            events_tx.clone(),
            Duration::from_millis(config.persist_debounce_ms),
        );
        PersistLink { state_tx, ctl_tx }
    });

    let events_tx_loop = events_tx.clone();

    tokio::spawn(async move {
        let mut store = store;
        while let Some(cmd) = cmd_rx.recv().await {
            let done = handle_command(cmd, &mut store, persist.as_ref()).await;
            publish_changes(&mut store, &events_tx_loop, persist.as_ref());
            if done {
                break;
            }
        }
        debug!("cart runtime loop exited");
    });

    CartHandle { cmd_tx, events_tx }
}

impl CartHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<CartEvent> {
        self.events_tx.subscribe()
    }

    /// Broadcasts a notification to every subscriber.
    pub fn notify(&self, notice: Notice) {
        let _ = self.events_tx.send(CartEvent::Notice(notice));
    }

    pub(crate) fn emit(&self, event: CartEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub async fn add_item(&self, draft: ItemDraft) -> Result<ItemId, RuntimeError> {
        self.request(|resp| Command::AddItem { draft, resp }).await
    }

    pub async fn remove_item(&self, id: ItemId) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::RemoveItem { id, resp }).await
    }

    pub async fn update_item_state(&self, id: ItemId, state: ItemState) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::UpdateItemState { id, state, resp })
            .await
    }

    pub async fn append_item_log(&self, id: ItemId, log: LogDraft) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::AppendItemLog { id, log, resp })
            .await
    }

    pub async fn clear_item_logs(&self, id: ItemId) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::ClearItemLogs { id, resp }).await
    }

    pub async fn set_item_estimate(&self, id: ItemId, est_ms: u64) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::SetItemEstimate { id, est_ms, resp })
            .await
    }

    pub async fn reorder(&self, from: usize, to: usize) -> Result<Vec<ItemId>, RuntimeError> {
        self.request(|resp| Command::Reorder { from, to, resp }).await
    }

    pub async fn reorder_by_ids(&self, order: Vec<ItemId>) -> Result<Vec<ItemId>, RuntimeError> {
        self.request(|resp| Command::ReorderByIds { order, resp }).await
    }

    pub async fn clear(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Clear { resp }).await
    }

    pub async fn save_preset(&self, name: impl Into<String>) -> Result<CartPreset, RuntimeError> {
        let name = name.into();
        self.request(|resp| Command::SavePreset { name, resp }).await
    }

    pub async fn load_preset(&self, id: PresetId) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::LoadPreset { id, resp }).await
    }

    pub async fn delete_preset(&self, id: PresetId) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::DeletePreset { id, resp }).await
    }

    pub async fn hydrate_from_batch(
        &self,
        batch_id: BatchId,
        updates: Vec<ItemUpdate>,
    ) -> Result<usize, RuntimeError> {
        self.request(|resp| Command::HydrateFromBatch {
            batch_id,
            updates,
            resp,
        })
        .await
    }

    pub async fn set_active_batch(&self, batch_id: Option<BatchId>) -> Result<(), RuntimeError> {
        self.request(|resp| Command::SetActiveBatch { batch_id, resp })
            .await
    }

    /// Marks `batch_id` active and sets `running` in one step.
    pub async fn begin_batch(&self, batch_id: BatchId) -> Result<(), RuntimeError> {
        self.request(|resp| Command::BeginBatch { batch_id, resp }).await
    }

    /// Clears `running` and the active batch if `batch_id` is still the active one.
    pub async fn finish_batch(&self, batch_id: BatchId) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::FinishBatch { batch_id, resp }).await
    }

    pub async fn set_running(&self, running: bool) -> Result<(), RuntimeError> {
        self.request(|resp| Command::SetRunning { running, resp }).await
    }

    pub async fn set_parallelism(&self, parallelism: Parallelism) -> Result<(), RuntimeError> {
        self.request(|resp| Command::SetParallelism { parallelism, resp })
            .await
    }

    pub async fn set_on_completion(&self, on_completion: OnCompletion) -> Result<(), RuntimeError> {
        self.request(|resp| Command::SetOnCompletion {
            on_completion,
            resp,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<CartSnapshot, RuntimeError> {
        self.request(|resp| Command::Snapshot { resp }).await
    }

    /// Writes any pending projection immediately.
    pub async fn flush(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Flush { resp }).await?
    }

    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Shutdown { resp }).await?
    }
}

async fn handle_command(cmd: Command, store: &mut CartStore, persist: Option<&PersistLink>) -> bool {
    match cmd {
        Command::AddItem { draft, resp } => {
            let _ = resp.send(store.add_item(draft));
        }
        Command::RemoveItem { id, resp } => {
            let _ = resp.send(store.remove_item(id));
        }
        Command::UpdateItemState { id, state, resp } => {
            let _ = resp.send(store.update_item_state(id, state));
        }
        Command::AppendItemLog { id, log, resp } => {
            let _ = resp.send(store.append_item_log(id, log));
        }
        Command::ClearItemLogs { id, resp } => {
            let _ = resp.send(store.clear_item_logs(id));
        }
        Command::SetItemEstimate { id, est_ms, resp } => {
            let _ = resp.send(store.set_item_estimate(id, est_ms));
        }
        Command::Reorder { from, to, resp } => {
            let _ = resp.send(store.reorder(from, to));
        }
        Command::ReorderByIds { order, resp } => {
            let _ = resp.send(store.reorder_by_ids(&order));
        }
        Command::Clear { resp } => {
            store.clear();
            let _ = resp.send(());
        }
        Command::SavePreset { name, resp } => {
            let _ = resp.send(store.save_preset(name));
        }
        Command::LoadPreset { id, resp } => {
            let _ = resp.send(store.load_preset(id));
        }
        Command::DeletePreset { id, resp } => {
            let _ = resp.send(store.delete_preset(id));
        }
        Command::HydrateFromBatch {
            batch_id,
            updates,
            resp,
        } => {
            let _ = resp.send(store.hydrate_from_batch(&batch_id, updates));
        }
        Command::SetActiveBatch { batch_id, resp } => {
            store.set_active_batch(batch_id);
            let _ = resp.send(());
        }
        Command::BeginBatch { batch_id, resp } => {
            store.set_active_batch(Some(batch_id));
            store.set_running(true);
            let _ = resp.send(());
        }
        Command::FinishBatch { batch_id, resp } => {
            let is_active = store.active_batch_id() == Some(&batch_id);
            if is_active {
                store.set_running(false);
                store.set_active_batch(None);
            }
            let _ = resp.send(is_active);
        }
        Command::SetRunning { running, resp } => {
            store.set_running(running);
            let _ = resp.send(());
        }
        Command::SetParallelism { parallelism, resp } => {
            store.set_parallelism(parallelism);
            let _ = resp.send(());
        }
        Command::SetOnCompletion {
            on_completion,
            resp,
        } => {
            store.set_on_completion(on_completion);
            let _ = resp.send(());
        }
        Command::Snapshot { resp } => {
            let _ = resp.send(store.snapshot());
        }
        Command::Flush { resp } => {
            let out = match persist {
                Some(link) => {
                    if store.take_dirty() {
                        link.state_tx.send_replace(Some(store.export_state()));
                    }
                    let (tx, rx) = oneshot::channel();
                    if link.ctl_tx.send(PersistCtl::Flush { resp: tx }).await.is_err() {
                        Err(RuntimeError::ChannelClosed)
                    } else {
                        rx.await
                            .map_err(|_| RuntimeError::ChannelClosed)
                            .and_then(|r| r.map_err(RuntimeError::from))
                    }
                }
                None => Ok(()),
            };
            let _ = resp.send(out);
        }
        Command::Shutdown { resp } => {
            let out = match persist {
                Some(link) => {
                    if store.take_dirty() {
                        link.state_tx.send_replace(Some(store.export_state()));
                    }
                    let (tx, rx) = oneshot::channel();
                    if link
                        .ctl_tx
                        .send(PersistCtl::Shutdown { resp: tx })
                        .await
                        .is_err()
                    {
                        Err(RuntimeError::ChannelClosed)
                    } else {
                        rx.await.map_err(|_| RuntimeError::ChannelClosed)
                    }
                }
                None => Ok(()),
            };
            let _ = resp.send(out);
            return true;
        }
    }

    false
}

fn publish_changes(
    store: &mut CartStore,
    events_tx: &broadcast::Sender<CartEvent>,
    persist: Option<&PersistLink>,
) {
    for change in store.drain_changes() {
        let _ = events_tx.send(CartEvent::Store(change));
    }
    if store.take_dirty() {
        if let Some(link) = persist {
            link.state_tx.send_replace(Some(store.export_state()));
        }
    }
}

fn spawn_persistence_worker(
    sink: Box<dyn StateSink>,
    mut state_rx: watch::Receiver<Option<PersistedState>>,
    mut ctl_rx: mpsc::Receiver<PersistCtl>,
    events_tx: broadcast::Sender<CartEvent>,
    debounce: Duration,
) {
    let sink = Arc::new(Mutex::new(sink));
    tokio::spawn(async move {
        let mut pending = false;
        let mut deadline = Instant::now();

        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        if pending {
                            let _ = write_latest(&sink, &mut state_rx, &events_tx).await;
                        }
                        break;
                    }
                    if !pending {
                        pending = true;
                        deadline = Instant::now() + debounce;
                    }
                }
                _ = tokio::time::sleep_until(deadline), if pending => {
                    let _ = write_latest(&sink, &mut state_rx, &events_tx).await;
                    pending = false;
                }
                ctl = ctl_rx.recv() => {
                    match ctl {
                        Some(PersistCtl::Flush { resp }) => {
                            let mut result = write_latest(&sink, &mut state_rx, &events_tx).await;
                            pending = false;
                            if result.is_ok() {
                                result = run_blocking(&sink, |sink| sink.flush()).await;
                            }
                            let _ = resp.send(result);
                        }
                        Some(PersistCtl::Shutdown { resp }) => {
                            let _ = write_latest(&sink, &mut state_rx, &events_tx).await;
                            let _ = run_blocking(&sink, |sink| sink.flush()).await;
                            let _ = resp.send(());
                            break;
                        }
                        None => {
                            if pending {
                                let _ = write_latest(&sink, &mut state_rx, &events_tx).await;
                            }
                            break;
                        }
                    }
                }
            }
        }
    });
}

async fn write_latest(
    sink: &Arc<Mutex<Box<dyn StateSink>>>,
    state_rx: &mut watch::Receiver<Option<PersistedState>>,
    events_tx: &broadcast::Sender<CartEvent>,
) -> Result<(), PersistError> {
    let Some(state) = state_rx.borrow_and_update().clone() else {
        return Ok(());
    };

    let result = run_blocking(sink, move |sink| sink.save(&state)).await;
    match &result {
        Ok(()) => {
            let _ = events_tx.send(CartEvent::Persisted);
        }
        Err(err) => {
            error!(error = %err, "failed to persist cart state");
            let _ = events_tx.send(CartEvent::PersistFailed {
                message: err.to_string(),
            });
        }
    }
    result
}

async fn run_blocking<F>(sink: &Arc<Mutex<Box<dyn StateSink>>>, f: F) -> Result<(), PersistError>
where
    F: FnOnce(&mut Box<dyn StateSink>) -> Result<(), PersistError> + Send + 'static,
{
    let sink_ref = Arc::clone(sink);
    tokio::task::spawn_blocking(move || {
        let mut sink = sink_ref.blocking_lock();
        f(&mut sink)
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))?
}
