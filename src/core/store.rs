use chrono::{DateTime, Utc};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    item::{CartItem, ItemDraft, ItemUpdate, LogDraft, LogEntry},
    persist::migrate::STATE_VERSION,
    preset::CartPreset,
    types::{BatchId, ItemId, ItemState, OnCompletion, Parallelism, PresetId},
};

/// A state transition recorded by the store, drained by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    /// An item was appended.
    ItemAdded {
        /// New item id.
        id: ItemId,
    },
    /// An item was removed.
    ItemRemoved {
        /// Removed item id.
        id: ItemId,
    },
    /// An item changed state.
    ItemStateChanged {
        /// Item id.
        id: ItemId,
        /// New state.
        state: ItemState,
    },
    /// A log line was appended.
    ItemLogAppended {
        /// Item id.
        id: ItemId,
        /// Appended line.
        entry: LogEntry,
    },
    /// An item's logs were cleared.
    ItemLogsCleared {
        /// Item id.
        id: ItemId,
    },
    /// An item's estimate changed.
    ItemEstimateChanged {
        /// Item id.
        id: ItemId,
        /// New estimate.
        est_ms: u64,
    },
    /// Item order changed.
    Reordered {
        /// Resulting order.
        order: Vec<ItemId>,
    },
    /// The cart was emptied.
    Cleared,
    /// A preset was saved.
    PresetSaved {
        /// Preset id.
        id: PresetId,
    },
    /// A preset was deleted.
    PresetDeleted {
        /// Preset id.
        id: PresetId,
    },
    /// A preset replaced the cart.
    PresetLoaded {
        /// Preset id.
        id: PresetId,
    },
    /// Parallelism or completion behavior changed.
    ConfigChanged,
    /// The running flag flipped.
    RunningChanged {
        /// New value.
        running: bool,
    },
    /// The active batch was set or cleared.
    ActiveBatchChanged {
        /// New active batch.
        batch_id: Option<BatchId>,
    },
}

/// Durable projection of the store, tagged with its schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    /// Cart items in order.
    #[serde(default)]
    pub items: Vec<CartItem>,
    /// Parallelism setting.
    #[serde(default)]
    pub parallelism: Parallelism,
    /// Completion behavior.
    #[serde(default)]
    pub on_completion: OnCompletion,
    /// Saved presets.
    #[serde(default)]
    pub presets: Vec<CartPreset>,
    /// Time the last batch was accepted.
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Batch accepted but not yet finished.
    #[serde(default)]
    pub active_batch_id: Option<BatchId>,
    /// Schema version.
    #[serde(rename = "__version")]
    pub version: u32,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            parallelism: Parallelism::default(),
            on_completion: OnCompletion::default(),
            presets: Vec::new(),
            last_run_at: None,
            active_batch_id: None,
            version: STATE_VERSION,
        }
    }
}

/// Read-only view handed to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct CartSnapshot {
    /// Cart items in order.
    pub items: Vec<CartItem>,
    /// Whether a batch is executing.
    pub running: bool,
    /// Parallelism setting.
    pub parallelism: Parallelism,
    /// Completion behavior.
    pub on_completion: OnCompletion,
    /// Batch accepted but not yet finished.
    pub active_batch_id: Option<BatchId>,
    /// Time the last batch was accepted.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Saved presets.
    pub presets: Vec<CartPreset>,
}

/// Single source of truth for cart state.
///
/// Every operation is total: unknown ids and out-of-range indices are silent
/// no-ops reported through the boolean or unchanged return value.
#[derive(Debug, Default)]
pub struct CartStore {
    items: Vec<CartItem>,
    pos: HashMap<ItemId, usize>,
    presets: Vec<CartPreset>,
    parallelism: Parallelism,
    on_completion: OnCompletion,
    running: bool,
    active_batch_id: Option<BatchId>,
    last_run_at: Option<DateTime<Utc>>,
    pending_changes: Vec<StoreChange>,
    dirty: bool,
}

impl CartStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrates from a migrated projection, re-establishing item invariants.
    ///
    /// Duplicate item ids keep their first occurrence; logs are trimmed.
    /// `running` always starts false.
    pub fn from_state(state: PersistedState) -> Self {
        let mut store = Self {
            parallelism: state.parallelism,
            on_completion: state.on_completion,
            presets: state.presets,
            last_run_at: state.last_run_at,
            active_batch_id: state.active_batch_id,
            ..Self::default()
        };

        let mut seen = HashSet::new();
        for mut item in state.items {
            if !seen.insert(item.id) {
                continue;
            }
            item.trim_logs();
            store.items.push(item);
        }
        store.rebuild_positions();
        store
    }

    pub fn export_state(&self) -> PersistedState {
        PersistedState {
            items: self.items.clone(),
            parallelism: self.parallelism,
            on_completion: self.on_completion,
            presets: self.presets.clone(),
            last_run_at: self.last_run_at,
            active_batch_id: self.active_batch_id.clone(),
            version: STATE_VERSION,
        }
    }

    pub fn snapshot(&self) -> CartSnapshot {
        CartSnapshot {
            items: self.items.clone(),
            running: self.running,
            parallelism: self.parallelism,
            on_completion: self.on_completion,
            active_batch_id: self.active_batch_id.clone(),
            last_run_at: self.last_run_at,
            presets: self.presets.clone(),
        }
    }

    pub fn add_item(&mut self, draft: ItemDraft) -> ItemId {
        let id = match draft.id {
            Some(id) if !self.pos.contains_key(&id) => id,
            _ => self.fresh_id(),
        };

        let item = CartItem {
            id,
            title: draft.title,
            action: draft.action,
            lecture_id: draft.lecture_id,
            params: draft.params,
            est_ms: draft.est_ms,
            prereqs: draft.prereqs,
            state: ItemState::Idle,
            logs: Vec::new(),
        };

        self.pos.insert(id, self.items.len());
        self.items.push(item);
        self.record(StoreChange::ItemAdded { id });
        id
    }

    pub fn remove_item(&mut self, id: ItemId) -> bool {
        let Some(idx) = self.pos.remove(&id) else {
            return false;
        };
        self.items.remove(idx);
        self.rebuild_positions();
        self.record(StoreChange::ItemRemoved { id });
        true
    }

    pub fn update_item_state(&mut self, id: ItemId, state: ItemState) -> bool {
        let Some(item) = self.item_mut(id) else {
            return false;
        };
        item.state = state;
        self.record(StoreChange::ItemStateChanged { id, state });
        true
    }

    pub fn append_item_log(&mut self, id: ItemId, log: LogDraft) -> bool {
        let Some(item) = self.item_mut(id) else {
            return false;
        };
        let entry = log.into_entry();
        item.push_log(entry.clone());
        self.record(StoreChange::ItemLogAppended { id, entry });
        true
    }

    pub fn clear_item_logs(&mut self, id: ItemId) -> bool {
        let Some(item) = self.item_mut(id) else {
            return false;
        };
        item.logs.clear();
        self.record(StoreChange::ItemLogsCleared { id });
        true
    }

    /// Moves the item at `from` to `to` and returns the resulting order.
    pub fn reorder(&mut self, from: usize, to: usize) -> Vec<ItemId> {
        let len = self.items.len();
        if from >= len || to >= len {
            return self.ordered_ids();
        }
        if from != to {
            let item = self.items.remove(from);
            self.items.insert(to, item);
            self.rebuild_positions();
            let order = self.ordered_ids();
            self.record(StoreChange::Reordered {
                order: order.clone(),
            });
            return order;
        }
        self.ordered_ids()
    }

    /// Applies a full ordering by id.
    ///
    /// Listed ids come first in the given order; unknown and repeated ids are
    /// skipped; unlisted items follow in their previous relative order.
    pub fn reorder_by_ids(&mut self, order: &[ItemId]) -> Vec<ItemId> {
        let before = self.ordered_ids();
        let mut placed = HashSet::new();
        let mut next = Vec::with_capacity(self.items.len());

        for id in order {
            if self.pos.contains_key(id) && placed.insert(*id) {
                next.push(*id);
            }
        }
        for id in &before {
            if !placed.contains(id) {
                next.push(*id);
            }
        }

        if next == before {
            return before;
        }

        let mut by_id: HashMap<ItemId, CartItem> =
            self.items.drain(..).map(|item| (item.id, item)).collect();
        self.items = next.iter().filter_map(|id| by_id.remove(id)).collect();
        self.rebuild_positions();
        self.record(StoreChange::Reordered {
            order: next.clone(),
        });
        next
    }

    pub fn clear(&mut self) {
        if self.items.is_empty() {
            return;
        }
        self.items.clear();
        self.pos.clear();
        self.record(StoreChange::Cleared);
    }

    /// Snapshots current items and config; the cart is left as is.
    pub fn save_preset(&mut self, name: impl Into<String>) -> CartPreset {
        let preset = CartPreset {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
            items: self.items.clone(),
            parallelism: self.parallelism,
            on_completion: self.on_completion,
        };
        self.presets.push(preset.clone());
        self.record(StoreChange::PresetSaved { id: preset.id });
        preset
    }

    /// Replaces the cart with a fresh instantiation of the preset.
    ///
    /// Clears the running flag and any active batch.
    pub fn load_preset(&mut self, id: PresetId) -> bool {
        let Some(preset) = self.presets.iter().find(|p| p.id == id) else {
            return false;
        };

        let taken: HashSet<ItemId> = self.pos.keys().copied().collect();
        let items = preset.instantiate(&taken);
        let parallelism = preset.parallelism;
        let on_completion = preset.on_completion;

        self.items = items;
        self.rebuild_positions();
        self.parallelism = parallelism;
        self.on_completion = on_completion;
        self.set_running(false);
        if self.active_batch_id.is_some() {
            self.set_active_batch(None);
        }
        self.record(StoreChange::PresetLoaded { id });
        true
    }

    pub fn delete_preset(&mut self, id: PresetId) -> bool {
        let before = self.presets.len();
        self.presets.retain(|p| p.id != id);
        if self.presets.len() == before {
            return false;
        }
        self.record(StoreChange::PresetDeleted { id });
        true
    }

    /// Merges per-item updates; unknown ids are ignored. Returns how many applied.
    pub fn hydrate_from_batch(&mut self, _batch_id: &BatchId, updates: Vec<ItemUpdate>) -> usize {
        let mut applied = 0;
        for update in updates {
            if !self.pos.contains_key(&update.id) {
                continue;
            }
            let id = update.id;
            if let Some(state) = update.state {
                self.update_item_state(id, state);
            }
            if let Some(est_ms) = update.est_ms {
                self.set_item_estimate(id, est_ms);
            }
            for log in update.logs {
                self.append_item_log(id, log);
            }
            applied += 1;
        }
        applied
    }

    pub fn set_item_estimate(&mut self, id: ItemId, est_ms: u64) -> bool {
        let Some(item) = self.item_mut(id) else {
            return false;
        };
        item.est_ms = est_ms;
        self.record(StoreChange::ItemEstimateChanged { id, est_ms });
        true
    }

    /// Setting a batch stamps `last_run_at`; clearing leaves it alone.
    pub fn set_active_batch(&mut self, batch_id: Option<BatchId>) {
        if batch_id.is_some() {
            self.last_run_at = Some(Utc::now());
        }
        self.active_batch_id = batch_id.clone();
        self.record(StoreChange::ActiveBatchChanged { batch_id });
    }

    pub fn set_running(&mut self, running: bool) {
        if self.running == running {
            return;
        }
        self.running = running;
        self.pending_changes
            .push(StoreChange::RunningChanged { running });
    }

    pub fn set_parallelism(&mut self, parallelism: Parallelism) {
        self.parallelism = parallelism;
        self.record(StoreChange::ConfigChanged);
    }

    pub fn set_on_completion(&mut self, on_completion: OnCompletion) {
        self.on_completion = on_completion;
        self.record(StoreChange::ConfigChanged);
    }

    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    pub fn item(&self, id: ItemId) -> Option<&CartItem> {
        self.pos.get(&id).and_then(|idx| self.items.get(*idx))
    }

    pub fn ordered_ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|i| i.id).collect()
    }

    pub fn presets(&self) -> &[CartPreset] {
        &self.presets
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn parallelism(&self) -> Parallelism {
        self.parallelism
    }

    pub fn on_completion(&self) -> OnCompletion {
        self.on_completion
    }

    pub fn active_batch_id(&self) -> Option<&BatchId> {
        self.active_batch_id.as_ref()
    }

    pub fn last_run_at(&self) -> Option<DateTime<Utc>> {
        self.last_run_at
    }

    pub fn drain_changes(&mut self) -> Vec<StoreChange> {
        std::mem::take(&mut self.pending_changes)
    }

    /// Returns and resets whether the persisted projection changed.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn item_mut(&mut self, id: ItemId) -> Option<&mut CartItem> {
        let idx = *self.pos.get(&id)?;
        self.items.get_mut(idx)
    }

    fn fresh_id(&self) -> ItemId {
        let mut id = Uuid::new_v4();
        while self.pos.contains_key(&id) {
            id = Uuid::new_v4();
        }
        id
    }

    fn rebuild_positions(&mut self) {
        self.pos.clear();
        for (idx, item) in self.items.iter().enumerate() {
            self.pos.insert(item.id, idx);
        }
    }

    fn record(&mut self, change: StoreChange) {
        self.dirty = true;
        self.pending_changes.push(change);
    }
}
