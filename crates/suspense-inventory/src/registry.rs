//! Handle-based registry of live inventories.
//!
//! Transactions, history and replicators refer to inventories by
//! [`InventoryId`] and resolve them here at the moment of use. A destroyed
//! inventory simply stops resolving.

use ahash::AHashMap;
use suspense_common::InventoryId;
use tracing::debug;

use crate::component::InventoryComponent;

/// Owns every inventory and hands out non-reused IDs.
#[derive(Debug)]
pub struct InventoryRegistry {
    next_id: u32,
    inventories: AHashMap<InventoryId, InventoryComponent>,
}

impl Default for InventoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InventoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            inventories: AHashMap::new(),
        }
    }

    /// Takes ownership of an inventory and assigns it a fresh ID.
    pub fn insert(&mut self, mut inventory: InventoryComponent) -> InventoryId {
        let id = InventoryId::new(self.next_id);
        self.next_id += 1;
        inventory.set_id(id);
        self.inventories.insert(id, inventory);
        debug!("Registered {}", id);
        id
    }

    /// Resolves a handle.
    #[must_use]
    pub fn get(&self, id: InventoryId) -> Option<&InventoryComponent> {
        self.inventories.get(&id)
    }

    /// Resolves a handle mutably.
    pub fn get_mut(&mut self, id: InventoryId) -> Option<&mut InventoryComponent> {
        self.inventories.get_mut(&id)
    }

    /// Removes and returns an inventory. Its ID is never handed out again.
    pub fn remove(&mut self, id: InventoryId) -> Option<InventoryComponent> {
        let removed = self.inventories.remove(&id);
        if removed.is_some() {
            debug!("Unregistered {}", id);
        }
        removed
    }

    /// Checks if a handle still resolves.
    #[must_use]
    pub fn contains(&self, id: InventoryId) -> bool {
        self.inventories.contains_key(&id)
    }

    /// Number of live inventories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inventories.len()
    }

    /// Checks if no inventories are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inventories.is_empty()
    }

    /// Live IDs in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<InventoryId> {
        let mut ids: Vec<_> = self.inventories.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
