//! Named, reusable cart templates.

use chrono::{DateTime, Utc};
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    item::CartItem,
    types::{ItemId, ItemState, OnCompletion, Parallelism, PresetId},
};

/// Snapshot of cart contents and run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartPreset {
    /// Preset identifier.
    pub id: PresetId,
    /// Display name.
    pub name: String,
    /// Time the preset was saved.
    pub created_at: DateTime<Utc>,
    /// Items as they were when saved.
    pub items: Vec<CartItem>,
    /// Parallelism at save time.
    pub parallelism: Parallelism,
    /// Completion behavior at save time.
    pub on_completion: OnCompletion,
}

impl CartPreset {
    /// Clones the template items with fresh ids, `idle` state and no logs.
    ///
    /// Fresh ids never collide with the ids stored in the preset or in `taken`.
    pub fn instantiate(&self, taken: &HashSet<ItemId>) -> Vec<CartItem> {
        let mut used: HashSet<ItemId> = self.items.iter().map(|i| i.id).collect();
        used.extend(taken.iter().copied());

        self.items
            .iter()
            .map(|template| {
                let mut id = Uuid::new_v4();
                while used.contains(&id) {
                    id = Uuid::new_v4();
                }
                used.insert(id);
                CartItem {
                    id,
                    state: ItemState::Idle,
                    logs: Vec::new(),
                    ..template.clone()
                }
            })
            .collect()
    }
}
