//! Snapshot-based transactions over a single inventory.

use serde::{Deserialize, Serialize};
use suspense_common::{InventoryId, TransactionId};
use tracing::{debug, error, warn};

use crate::events::InventoryEvent;
use crate::operation::OperationRecord;
use crate::registry::InventoryRegistry;
use crate::snapshot::InventorySnapshot;

/// Transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransactionState {
    /// Nothing started
    #[default]
    None,
    /// Mutations are being collected
    Active,
    /// Changes kept
    Committed,
    /// Changes reverted
    RolledBack,
    /// Revert could not restore every item
    Failed,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// All-or-nothing grouping of mutations on one inventory.
///
/// Mutations are applied as they happen; rolling back restores the snapshot
/// taken at [`begin`](Self::begin).
#[derive(Debug, Clone)]
pub struct InventoryTransaction {
    inventory: InventoryId,
    id: Option<TransactionId>,
    state: TransactionState,
    snapshot: Option<InventorySnapshot>,
    entries: Vec<OperationRecord>,
}

impl InventoryTransaction {
    /// Creates an idle transaction bound to `inventory`.
    #[must_use]
    pub fn new(inventory: InventoryId) -> Self {
        Self {
            inventory,
            id: None,
            state: TransactionState::None,
            snapshot: None,
            entries: Vec::new(),
        }
    }

    /// Inventory this transaction targets.
    #[must_use]
    pub const fn inventory(&self) -> InventoryId {
        self.inventory
    }

    /// Current transaction ID, if one was ever started.
    #[must_use]
    pub const fn id(&self) -> Option<TransactionId> {
        self.id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if mutations are being collected.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Operations logged so far.
    #[must_use]
    pub fn entries(&self) -> &[OperationRecord] {
        &self.entries
    }

    /// Takes the logged operations, leaving the log empty.
    pub fn take_entries(&mut self) -> Vec<OperationRecord> {
        std::mem::take(&mut self.entries)
    }

    /// Snapshots the inventory and starts collecting.
    ///
    /// Fails if already active or if the inventory no longer exists.
    pub fn begin(&mut self, registry: &InventoryRegistry) -> bool {
        if self.is_active() {
            warn!("Transaction on {} already active", self.inventory);
            return false;
        }
        let Some(inventory) = registry.get(self.inventory) else {
            warn!("Cannot begin transaction: {} not found", self.inventory);
            return false;
        };

        let id = TransactionId::new();
        self.id = Some(id);
        self.snapshot = Some(inventory.snapshot());
        self.entries.clear();
        self.state = TransactionState::Active;
        debug!("{} began on {}", id, self.inventory);
        self.publish_state(registry);
        true
    }

    /// Appends a record while active; ignored otherwise.
    pub fn log_operation(&mut self, record: OperationRecord) {
        if self.is_active() {
            self.entries.push(record);
        }
    }

    /// Keeps all changes.
    pub fn commit(&mut self, registry: &InventoryRegistry) -> bool {
        if !self.is_active() {
            return false;
        }
        self.snapshot = None;
        self.state = TransactionState::Committed;
        debug!(
            "{} committed {} operations",
            self.id.map(|id| id.to_string()).unwrap_or_default(),
            self.entries.len()
        );

        if let Some(bus) = registry.get(self.inventory).and_then(|i| i.event_bus()) {
            bus.publish(InventoryEvent::InventoryUpdated {
                inventory: self.inventory,
            });
        }
        self.publish_state(registry);
        true
    }

    /// Restores the inventory to its state at [`begin`](Self::begin).
    pub fn rollback(&mut self, registry: &mut InventoryRegistry) -> bool {
        if !self.is_active() {
            return false;
        }
        let snapshot = self.snapshot.take();
        self.entries.clear();

        let restored = match (registry.get_mut(self.inventory), snapshot) {
            (Some(inventory), Some(snapshot)) => inventory.restore_snapshot(&snapshot),
            (None, _) => Err(crate::component::InventoryError::RestoreFailed(format!(
                "{} no longer exists",
                self.inventory
            ))),
            (Some(_), None) => Err(crate::component::InventoryError::RestoreFailed(
                "no snapshot".to_string(),
            )),
        };

        match restored {
            Ok(()) => {
                self.state = TransactionState::RolledBack;
                debug!("Transaction on {} rolled back", self.inventory);
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                error!("Rollback on {} failed: {}", self.inventory, e);
            }
        }
        self.publish_state(registry);
        self.state == TransactionState::RolledBack
    }

    /// Abandons the transaction without restoring anything.
    pub fn cancel(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.snapshot = None;
        self.entries.clear();
        self.state = TransactionState::RolledBack;
        debug!("Transaction on {} cancelled", self.inventory);
        true
    }

    fn publish_state(&self, registry: &InventoryRegistry) {
        let (Some(id), Some(bus)) = (
            self.id,
            registry.get(self.inventory).and_then(|i| i.event_bus()),
        ) else {
            return;
        };
        bus.publish(InventoryEvent::TransactionStateChanged {
            inventory: self.inventory,
            transaction_id: id,
            state: self.state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::component;
    use suspense_common::ItemId;

    fn setup() -> (InventoryRegistry, InventoryId) {
        let mut registry = InventoryRegistry::new();
        let mut inv = component(4, 4);
        inv.add_item(&ItemId::new("vest"), 1).expect("vest");
        let id = registry.insert(inv);
        (registry, id)
    }

    #[test]
    fn test_rollback_restores_snapshot() {
        let (mut registry, id) = setup();
        let before = registry.get(id).map(|i| i.snapshot()).expect("inv");

        let mut txn = InventoryTransaction::new(id);
        assert!(txn.begin(&registry));
        assert!(!txn.begin(&registry));

        let inv = registry.get_mut(id).expect("inv");
        let record = inv.add_item(&ItemId::new("medkit"), 2).expect("add");
        txn.log_operation(record);
        let record = inv.move_item(0, 10).expect("move");
        txn.log_operation(record);
        assert_eq!(txn.entries().len(), 2);

        assert!(txn.rollback(&mut registry));
        assert_eq!(txn.state(), TransactionState::RolledBack);
        assert!(txn.entries().is_empty());
        let after = registry.get(id).map(|i| i.snapshot()).expect("inv");
        assert!(after.same_items(&before));
        assert!((after.current_weight - before.current_weight).abs() < 1e-4);
    }

    #[test]
    fn test_commit_keeps_changes() {
        let (mut registry, id) = setup();
        let mut txn = InventoryTransaction::new(id);
        assert!(txn.begin(&registry));
        let record = registry
            .get_mut(id)
            .and_then(|i| i.add_item(&ItemId::new("medkit"), 1).ok())
            .expect("add");
        txn.log_operation(record);

        assert!(txn.commit(&registry));
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(!txn.commit(&registry));
        assert!(!txn.rollback(&mut registry));
        assert_eq!(registry.get(id).map(|i| i.items().len()), Some(2));
    }

    #[test]
    fn test_log_ignored_when_idle() {
        let (registry, id) = setup();
        let mut txn = InventoryTransaction::new(id);
        let item = registry.get(id).map(|i| i.items()[0].clone()).expect("item");
        txn.log_operation(OperationRecord::add(&item));
        assert!(txn.entries().is_empty());
        assert!(!txn.cancel());
    }

    #[test]
    fn test_cancel_skips_restore() {
        let (mut registry, id) = setup();
        let mut txn = InventoryTransaction::new(id);
        assert!(txn.begin(&registry));
        registry
            .get_mut(id)
            .map(|i| i.remove_item_at_slot(0))
            .expect("inv")
            .expect("remove");
        assert!(txn.cancel());
        assert_eq!(txn.state(), TransactionState::RolledBack);
        assert_eq!(registry.get(id).map(|i| i.items().len()), Some(0));
    }

    #[test]
    fn test_begin_on_missing_inventory() {
        let (mut registry, id) = setup();
        registry.remove(id);
        let mut txn = InventoryTransaction::new(id);
        assert!(!txn.begin(&registry));
        assert_eq!(txn.state(), TransactionState::None);
    }

    #[test]
    fn test_rollback_after_destroy_fails() {
        let (mut registry, id) = setup();
        let mut txn = InventoryTransaction::new(id);
        assert!(txn.begin(&registry));
        registry.remove(id);
        assert!(!txn.rollback(&mut registry));
        assert_eq!(txn.state(), TransactionState::Failed);
    }
}
