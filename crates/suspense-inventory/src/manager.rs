//! Inventory manager.
//!
//! Owns every inventory together with its constraints, history, transaction
//! and replication state, and sequences each mutation as
//! validate, mutate, log (transaction or history), mark dirty.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use suspense_common::{
    ActorId, InstanceId, InventoryId, InventoryResultCode, ItemId, PredictionId, TransactionId,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::authority::AuthorityGate;
use crate::component::{InventoryComponent, InventoryError, InventoryResult};
use crate::config::InventoryConfig;
use crate::constraints::{InventoryConstraints, InventoryRules, ValidationResult};
use crate::events::{EventBus, InventoryEvent};
use crate::history::InventoryHistory;
use crate::item_data::ItemDataProvider;
use crate::operation::OperationRecord;
use crate::registry::InventoryRegistry;
use crate::replicator::{
    ClientRequest, DeltaOutcome, FullStateSync, InventoryReplicator, PredictionAck,
    ReplicationError, ReplicationRole, ReplicationSink,
};
use crate::snapshot::{InventorySaveData, SnapshotError};
use crate::transaction::{InventoryTransaction, TransactionState};
use crate::wire::ReplicationMessage;

/// Manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Inventory handle does not resolve
    #[error("Inventory {0} not found")]
    InventoryNotFound(InventoryId),

    /// Constraints rejected the operation
    #[error("Validation failed: {0}")]
    Validation(ValidationResult),

    /// The inventory rejected the mutation
    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    /// A transaction is already running
    #[error("Transaction already active on {0}")]
    TransactionActive(InventoryId),

    /// No transaction is running
    #[error("No active transaction on {0}")]
    NoTransaction(InventoryId),

    /// Rollback could not restore the inventory
    #[error("Rollback of {0} failed")]
    RollbackFailed(InventoryId),

    /// An atomic batch stopped and was rolled back
    #[error("Batch aborted at operation {index}: {source}")]
    BatchAborted {
        /// Index of the failing operation
        index: usize,
        /// Why it failed
        source: Box<ManagerError>,
    },

    /// Prediction could not be opened
    #[error("Prediction {0} refused")]
    PredictionRefused(PredictionId),

    /// Replication failed
    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// Save data could not be read or written
    #[error("Save data error: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl ManagerError {
    /// Result code reported to callers and peers.
    #[must_use]
    pub fn code(&self) -> InventoryResultCode {
        match self {
            Self::InventoryNotFound(_) => InventoryResultCode::NotInitialized,
            Self::Validation(_) => InventoryResultCode::ValidationFailed,
            Self::Inventory(e) => e.code(),
            Self::TransactionActive(_) | Self::NoTransaction(_) | Self::RollbackFailed(_) => {
                InventoryResultCode::TransactionFailed
            }
            Self::BatchAborted { source, .. } => source.code(),
            Self::PredictionRefused(_) | Self::Replication(_) | Self::Snapshot(_) => {
                InventoryResultCode::Unknown
            }
        }
    }
}

/// Result type for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// One step of [`InventoryManager::execute_batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOperation {
    /// Create and auto-place a stack
    Add {
        /// Item type
        item_id: ItemId,
        /// Units
        quantity: u32,
    },
    /// Remove units of an instance
    Remove {
        /// Instance
        instance_id: InstanceId,
        /// Units
        quantity: u32,
    },
    /// Move the item covering a slot
    Move {
        /// Any cell of the item
        from_slot: usize,
        /// New anchor
        to_slot: usize,
    },
    /// Swap two items
    Swap {
        /// First slot
        slot_a: usize,
        /// Second slot
        slot_b: usize,
    },
    /// Rotate in place
    Rotate {
        /// Any cell of the item
        slot: usize,
    },
    /// Split units off a stack
    Split {
        /// Any cell of the source stack
        slot: usize,
        /// Units to split off
        quantity: u32,
        /// Anchor for the new stack, auto-placed when `None`
        target_slot: Option<usize>,
    },
    /// Merge one stack into another
    Merge {
        /// Source stack
        source_slot: usize,
        /// Target stack
        target_slot: usize,
    },
}

/// Owns all inventories and coordinates their subsystems.
pub struct InventoryManager {
    config: InventoryConfig,
    role: ReplicationRole,
    item_data: Arc<dyn ItemDataProvider>,
    events: Arc<EventBus>,
    registry: InventoryRegistry,
    constraints: InventoryConstraints,
    histories: AHashMap<InventoryId, InventoryHistory>,
    transactions: AHashMap<InventoryId, InventoryTransaction>,
    replicators: AHashMap<InventoryId, InventoryReplicator>,
}

impl std::fmt::Debug for InventoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryManager")
            .field("role", &self.role)
            .field("inventories", &self.registry.ids())
            .finish_non_exhaustive()
    }
}

impl InventoryManager {
    /// Creates a server-side manager.
    #[must_use]
    pub fn new(config: InventoryConfig, item_data: Arc<dyn ItemDataProvider>) -> Self {
        Self::with_role(config, item_data, ReplicationRole::Server)
    }

    /// Creates a manager whose inventories replicate as `role`.
    #[must_use]
    pub fn with_role(
        mut config: InventoryConfig,
        item_data: Arc<dyn ItemDataProvider>,
        role: ReplicationRole,
    ) -> Self {
        config.validate();
        let events = Arc::new(EventBus::new(config.event_capacity));
        Self {
            constraints: InventoryConstraints::new(Arc::clone(&item_data)),
            config,
            role,
            item_data,
            events,
            registry: InventoryRegistry::new(),
            histories: AHashMap::new(),
            transactions: AHashMap::new(),
            replicators: AHashMap::new(),
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &InventoryConfig {
        &self.config
    }

    /// Replication role of every inventory.
    #[must_use]
    pub const fn role(&self) -> ReplicationRole {
        self.role
    }

    /// Shared event bus.
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Item data lookup.
    #[must_use]
    pub fn item_data(&self) -> &Arc<dyn ItemDataProvider> {
        &self.item_data
    }

    /// All inventories.
    #[must_use]
    pub const fn registry(&self) -> &InventoryRegistry {
        &self.registry
    }

    /// Constraint rules and locks.
    #[must_use]
    pub const fn constraints(&self) -> &InventoryConstraints {
        &self.constraints
    }

    /// Mutable constraint rules and locks.
    pub fn constraints_mut(&mut self) -> &mut InventoryConstraints {
        &mut self.constraints
    }

    /// Looks up an inventory.
    #[must_use]
    pub fn inventory(&self, id: InventoryId) -> Option<&InventoryComponent> {
        self.registry.get(id)
    }

    /// Undo history of an inventory.
    #[must_use]
    pub fn history(&self, id: InventoryId) -> Option<&InventoryHistory> {
        self.histories.get(&id)
    }

    /// Mutable undo history of an inventory.
    pub fn history_mut(&mut self, id: InventoryId) -> Option<&mut InventoryHistory> {
        self.histories.get_mut(&id)
    }

    /// Replication state of an inventory.
    #[must_use]
    pub fn replicator(&self, id: InventoryId) -> Option<&InventoryReplicator> {
        self.replicators.get(&id)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Creates an inventory with the configured grid size and weight limit.
    pub fn create_inventory(&mut self) -> InventoryId {
        self.create_inventory_sized(
            self.config.grid_width,
            self.config.grid_height,
            self.config.max_weight,
        )
    }

    /// Creates an inventory with an explicit grid size and weight limit.
    pub fn create_inventory_sized(
        &mut self,
        width: i32,
        height: i32,
        max_weight: f32,
    ) -> InventoryId {
        let mut component =
            InventoryComponent::new(width, height, max_weight, Arc::clone(&self.item_data))
                .with_event_bus(Arc::clone(&self.events));
        component.set_auto_rotate(self.config.auto_rotate);

        let id = self.registry.insert(component);
        self.histories
            .insert(id, InventoryHistory::with_max_size(id, self.config.history_size));
        self.transactions.insert(id, InventoryTransaction::new(id));
        self.replicators.insert(
            id,
            InventoryReplicator::new(id, self.role)
                .with_max_pending(self.config.max_pending_predictions),
        );
        info!("Created inventory {} ({}x{})", id, width, height);
        id
    }

    /// Creates a default-sized inventory governed by `rules`.
    pub fn create_inventory_with_rules(&mut self, rules: InventoryRules) -> InventoryId {
        let id = self.create_inventory();
        self.constraints.set_rules(id, rules);
        id
    }

    /// Destroys an inventory and everything attached to it.
    pub fn destroy_inventory(&mut self, id: InventoryId) -> bool {
        if self.registry.remove(id).is_none() {
            return false;
        }
        self.histories.remove(&id);
        self.transactions.remove(&id);
        self.replicators.remove(&id);
        self.constraints.remove_inventory(id);
        info!("Destroyed inventory {}", id);
        true
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Validates and adds a new stack of `item_id`, honouring slot constraints.
    pub fn add_item(
        &mut self,
        inventory: InventoryId,
        item_id: &ItemId,
        quantity: u32,
    ) -> ManagerResult<OperationRecord> {
        let instance = self.component(inventory)?.create_instance(item_id, quantity);
        self.add_instance(inventory, instance, None)
    }

    /// Validates and adds an existing instance.
    pub fn add_instance(
        &mut self,
        inventory: InventoryId,
        instance: crate::item::ItemInstance,
        slot: Option<usize>,
    ) -> ManagerResult<OperationRecord> {
        let validation = self
            .constraints
            .validate_add_item(&self.registry, inventory, &instance, slot);
        self.ensure_allowed(inventory, validation)?;

        let mut instance = instance;
        let slot = match slot {
            Some(slot) => slot,
            None => self.place_automatically(inventory, &mut instance)?,
        };
        self.execute(inventory, |inv| inv.add_instance(instance, Some(slot)))
    }

    /// Removes `quantity` units of an instance, the whole stack when it covers them.
    pub fn remove_item(
        &mut self,
        inventory: InventoryId,
        instance_id: InstanceId,
        quantity: u32,
    ) -> ManagerResult<OperationRecord> {
        let validation = self
            .constraints
            .validate_remove_item(&self.registry, inventory, instance_id, quantity);
        self.ensure_allowed(inventory, validation)?;

        let have = self
            .component(inventory)?
            .item(instance_id)
            .map(|i| i.quantity)
            .ok_or(InventoryError::InstanceNotFound(instance_id))?;
        if quantity >= have {
            self.execute(inventory, |inv| inv.remove_instance(instance_id))
        } else {
            self.execute(inventory, |inv| inv.set_quantity(instance_id, have - quantity))
        }
    }

    /// Removes the whole item covering `slot`.
    pub fn remove_item_at_slot(
        &mut self,
        inventory: InventoryId,
        slot: usize,
    ) -> ManagerResult<OperationRecord> {
        let (instance_id, quantity) = self.occupant(inventory, slot)?;
        self.remove_item(inventory, instance_id, quantity)
    }

    /// Removes an item from the world-facing side (subject to `allow_drop`).
    pub fn drop_item(
        &mut self,
        inventory: InventoryId,
        instance_id: InstanceId,
    ) -> ManagerResult<OperationRecord> {
        let validation = self
            .constraints
            .validate_drop(&self.registry, inventory, instance_id);
        self.ensure_allowed(inventory, validation)?;
        self.execute(inventory, |inv| inv.remove_instance(instance_id))
    }

    /// Moves the item covering `from_slot` so its anchor lands on `to_slot`.
    pub fn move_item(
        &mut self,
        inventory: InventoryId,
        from_slot: usize,
        to_slot: usize,
    ) -> ManagerResult<OperationRecord> {
        let (instance_id, _) = self.occupant(inventory, from_slot)?;
        let validation = self
            .constraints
            .validate_move_item(&self.registry, inventory, instance_id, to_slot);
        self.ensure_allowed(inventory, validation)?;
        self.execute(inventory, |inv| inv.move_instance(instance_id, to_slot))
    }

    /// Swaps the items covering two slots.
    pub fn swap_items(
        &mut self,
        inventory: InventoryId,
        slot_a: usize,
        slot_b: usize,
    ) -> ManagerResult<OperationRecord> {
        let (instance_id, _) = self.occupant(inventory, slot_a)?;
        let validation = self
            .constraints
            .validate_swap_items(&self.registry, inventory, instance_id, slot_b);
        self.ensure_allowed(inventory, validation)?;
        self.execute(inventory, |inv| inv.swap_items(slot_a, slot_b))
    }

    /// Rotates the item covering `slot` a quarter turn.
    pub fn rotate_item(
        &mut self,
        inventory: InventoryId,
        slot: usize,
    ) -> ManagerResult<OperationRecord> {
        let (instance_id, _) = self.occupant(inventory, slot)?;
        let validation = self
            .constraints
            .validate_rotate_item(&self.registry, inventory, instance_id);
        self.ensure_allowed(inventory, validation)?;
        self.execute(inventory, |inv| inv.rotate_item(slot))
    }

    /// Splits `quantity` units off the stack covering `slot`.
    pub fn split_stack(
        &mut self,
        inventory: InventoryId,
        slot: usize,
        quantity: u32,
        target_slot: Option<usize>,
    ) -> ManagerResult<OperationRecord> {
        if !self
            .constraints
            .rules(inventory)
            .map_or(true, |r| r.allow_stacking)
        {
            let mut validation = ValidationResult::allowed();
            validation.deny(
                crate::constraints::ViolationKind::StackingDisabled,
                "Stacking is not allowed",
            );
            return Err(self.reject(inventory, validation));
        }
        self.execute(inventory, |inv| inv.split_stack(slot, quantity, target_slot))
    }

    /// Merges the stack covering `source_slot` into the one covering `target_slot`.
    pub fn merge_stacks(
        &mut self,
        inventory: InventoryId,
        source_slot: usize,
        target_slot: usize,
    ) -> ManagerResult<OperationRecord> {
        let (source, _) = self.occupant(inventory, source_slot)?;
        let (target, _) = self.occupant(inventory, target_slot)?;
        let validation = self
            .constraints
            .validate_stack(&self.registry, inventory, source, target);
        self.ensure_allowed(inventory, validation)?;
        self.execute(inventory, |inv| inv.merge_instances(source, target))
    }

    /// Sets a stack's quantity.
    pub fn set_quantity(
        &mut self,
        inventory: InventoryId,
        instance_id: InstanceId,
        quantity: u32,
    ) -> ManagerResult<OperationRecord> {
        self.execute(inventory, |inv| inv.set_quantity(instance_id, quantity))
    }

    /// Merges partial stacks of `item_id`. Returns the merge records.
    pub fn consolidate_stacks(
        &mut self,
        inventory: InventoryId,
        item_id: &ItemId,
    ) -> ManagerResult<Vec<OperationRecord>> {
        let records = self.component_mut(inventory)?.consolidate_stacks(item_id)?;
        for record in &records {
            self.log_operation(inventory, record.clone());
        }
        Ok(records)
    }

    /// Moves an instance from `source` into `target`.
    ///
    /// Logged as a remove on the source and an add on the target. If the
    /// target refuses the item it is put back where it was.
    pub fn transfer_item(
        &mut self,
        source: InventoryId,
        target: InventoryId,
        instance_id: InstanceId,
        target_slot: Option<usize>,
    ) -> ManagerResult<OperationRecord> {
        if source == target {
            return Err(InventoryError::SameInstance.into());
        }
        if !self.registry.contains(target) {
            return Err(ManagerError::InventoryNotFound(target));
        }
        let validation = self
            .constraints
            .validate_transfer(&self.registry, source, target, instance_id, target_slot);
        self.ensure_allowed(source, validation)?;

        let original = self
            .component(source)?
            .item(instance_id)
            .cloned()
            .ok_or(InventoryError::InstanceNotFound(instance_id))?;
        let removed = self.component_mut(source)?.remove_instance(instance_id)?;

        let mut moving = original.clone();
        moving.clear_placement();
        let placed = match target_slot {
            Some(slot) => Ok(slot),
            None => self.place_automatically(target, &mut moving),
        };
        let added = placed.and_then(|slot| {
            Ok(self.component_mut(target)?.add_instance(moving, Some(slot))?)
        });
        match added {
            Ok(added) => {
                self.log_operation(source, removed);
                self.log_operation(target, added.clone());
                debug!("Transferred {} from {} to {}", instance_id.short(), source, target);
                Ok(added)
            }
            Err(e) => {
                let previous_slot = original.slot_index;
                if let Err(restore) = self
                    .component_mut(source)?
                    .add_instance(original, previous_slot)
                {
                    error!(
                        "Transfer of {} failed and could not be undone: {}",
                        instance_id.short(),
                        restore
                    );
                }
                Err(e)
            }
        }
    }

    /// Repacks an inventory. Clears its undo history.
    pub fn defragment(&mut self, inventory: InventoryId) -> ManagerResult<usize> {
        let moved = self.component_mut(inventory)?.defragment()?;
        if let Some(history) = self.histories.get_mut(&inventory) {
            history.clear();
        }
        if let Some(replicator) = self.replicators.get_mut(&inventory) {
            replicator.mark_all_dirty();
        }
        Ok(moved)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Starts a transaction. History recording is deferred until commit.
    pub fn begin_transaction(&mut self, inventory: InventoryId) -> ManagerResult<TransactionId> {
        let transaction = self
            .transactions
            .get_mut(&inventory)
            .ok_or(ManagerError::InventoryNotFound(inventory))?;
        if transaction.is_active() {
            return Err(ManagerError::TransactionActive(inventory));
        }
        if !transaction.begin(&self.registry) {
            return Err(ManagerError::InventoryNotFound(inventory));
        }
        transaction
            .id()
            .ok_or(ManagerError::NoTransaction(inventory))
    }

    /// Keeps the transaction's changes and records them in history.
    ///
    /// Returns the number of operations committed.
    pub fn commit_transaction(&mut self, inventory: InventoryId) -> ManagerResult<usize> {
        let transaction = self
            .transactions
            .get_mut(&inventory)
            .ok_or(ManagerError::InventoryNotFound(inventory))?;
        if !transaction.commit(&self.registry) {
            return Err(ManagerError::NoTransaction(inventory));
        }
        let entries = transaction.take_entries();
        let count = entries.len();
        if let Some(history) = self.histories.get_mut(&inventory) {
            for record in entries {
                history.record_operation(record);
            }
        }
        Ok(count)
    }

    /// Restores the inventory to its state when the transaction began.
    pub fn rollback_transaction(&mut self, inventory: InventoryId) -> ManagerResult<()> {
        let transaction = self
            .transactions
            .get_mut(&inventory)
            .ok_or(ManagerError::InventoryNotFound(inventory))?;
        if !transaction.is_active() {
            return Err(ManagerError::NoTransaction(inventory));
        }
        let restored = transaction.rollback(&mut self.registry);
        if let Some(replicator) = self.replicators.get_mut(&inventory) {
            replicator.mark_all_dirty();
        }
        if restored {
            Ok(())
        } else {
            Err(ManagerError::RollbackFailed(inventory))
        }
    }

    /// Ends the transaction keeping its changes but without recording history.
    pub fn cancel_transaction(&mut self, inventory: InventoryId) -> ManagerResult<()> {
        let transaction = self
            .transactions
            .get_mut(&inventory)
            .ok_or(ManagerError::InventoryNotFound(inventory))?;
        if transaction.cancel() {
            Ok(())
        } else {
            Err(ManagerError::NoTransaction(inventory))
        }
    }

    /// Checks if a transaction is running.
    #[must_use]
    pub fn is_transaction_active(&self, inventory: InventoryId) -> bool {
        self.transactions
            .get(&inventory)
            .is_some_and(InventoryTransaction::is_active)
    }

    /// State of the inventory's most recent transaction.
    #[must_use]
    pub fn transaction_state(&self, inventory: InventoryId) -> TransactionState {
        self.transactions
            .get(&inventory)
            .map_or(TransactionState::None, InventoryTransaction::state)
    }

    /// Starts a transaction that rolls back on drop unless marked successful.
    pub fn scoped_transaction(
        &mut self,
        inventory: InventoryId,
    ) -> ManagerResult<TransactionScope<'_>> {
        self.begin_transaction(inventory)?;
        Ok(TransactionScope {
            manager: self,
            inventory,
            success: false,
        })
    }

    /// Runs several operations on one inventory.
    ///
    /// Atomic batches run inside a transaction and stop at the first failure,
    /// leaving the inventory untouched. Non-atomic batches skip failures.
    pub fn execute_batch(
        &mut self,
        inventory: InventoryId,
        operations: &[BatchOperation],
        atomic: bool,
    ) -> ManagerResult<Vec<OperationRecord>> {
        let owns_transaction = atomic && !self.is_transaction_active(inventory);
        if owns_transaction {
            self.begin_transaction(inventory)?;
        }

        let mut records = Vec::with_capacity(operations.len());
        for (index, operation) in operations.iter().enumerate() {
            match self.apply_batch_operation(inventory, operation) {
                Ok(record) => records.push(record),
                Err(e) if atomic => {
                    warn!("Batch on {} aborted at {}: {}", inventory, index, e);
                    if owns_transaction {
                        if let Err(rollback) = self.rollback_transaction(inventory) {
                            error!("Batch rollback on {} failed: {}", inventory, rollback);
                        }
                    }
                    return Err(ManagerError::BatchAborted {
                        index,
                        source: Box::new(e),
                    });
                }
                Err(e) => debug!("Batch on {} skipped {}: {}", inventory, index, e),
            }
        }

        if owns_transaction {
            self.commit_transaction(inventory)?;
        }
        Ok(records)
    }

    fn apply_batch_operation(
        &mut self,
        inventory: InventoryId,
        operation: &BatchOperation,
    ) -> ManagerResult<OperationRecord> {
        match operation {
            BatchOperation::Add { item_id, quantity } => {
                self.add_item(inventory, item_id, *quantity)
            }
            BatchOperation::Remove {
                instance_id,
                quantity,
            } => self.remove_item(inventory, *instance_id, *quantity),
            BatchOperation::Move { from_slot, to_slot } => {
                self.move_item(inventory, *from_slot, *to_slot)
            }
            BatchOperation::Swap { slot_a, slot_b } => self.swap_items(inventory, *slot_a, *slot_b),
            BatchOperation::Rotate { slot } => self.rotate_item(inventory, *slot),
            BatchOperation::Split {
                slot,
                quantity,
                target_slot,
            } => self.split_stack(inventory, *slot, *quantity, *target_slot),
            BatchOperation::Merge {
                source_slot,
                target_slot,
            } => self.merge_stacks(inventory, *source_slot, *target_slot),
        }
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Undoes the latest operation. Refused while a transaction is running.
    pub fn undo(&mut self, inventory: InventoryId) -> bool {
        if self.is_transaction_active(inventory) {
            warn!("Undo on {} refused during a transaction", inventory);
            return false;
        }
        let Some(history) = self.histories.get_mut(&inventory) else {
            return false;
        };
        if !history.undo(&mut self.registry) {
            return false;
        }
        let affected = history
            .last_undone()
            .map(OperationRecord::affected_instances)
            .unwrap_or_default();
        self.mark_dirty(inventory, &affected);
        true
    }

    /// Re-applies the latest undone operation.
    pub fn redo(&mut self, inventory: InventoryId) -> bool {
        if self.is_transaction_active(inventory) {
            warn!("Redo on {} refused during a transaction", inventory);
            return false;
        }
        let Some(history) = self.histories.get_mut(&inventory) else {
            return false;
        };
        if !history.redo(&mut self.registry) {
            return false;
        }
        let affected = history
            .last_done()
            .map(OperationRecord::affected_instances)
            .unwrap_or_default();
        self.mark_dirty(inventory, &affected);
        true
    }

    /// Undoes up to `count` operations. Returns how many were undone.
    pub fn undo_multiple(&mut self, inventory: InventoryId, count: usize) -> usize {
        (0..count).take_while(|_| self.undo(inventory)).count()
    }

    /// Redoes up to `count` operations. Returns how many were redone.
    pub fn redo_multiple(&mut self, inventory: InventoryId, count: usize) -> usize {
        (0..count).take_while(|_| self.redo(inventory)).count()
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Sends pending changes of one inventory.
    pub fn flush_replication(
        &mut self,
        inventory: InventoryId,
        sink: &mut dyn ReplicationSink,
    ) -> ManagerResult<Option<u64>> {
        let replicator = self
            .replicators
            .get_mut(&inventory)
            .ok_or(ManagerError::InventoryNotFound(inventory))?;
        Ok(replicator.flush_replication(&self.registry, sink)?)
    }

    /// Sends pending changes of every inventory. Returns the number of deltas sent.
    pub fn flush_all(&mut self, sink: &mut dyn ReplicationSink) -> ManagerResult<usize> {
        let mut sent = 0;
        for id in self.registry.ids() {
            if self.flush_replication(id, sink)?.is_some() {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Complete state of an inventory for a joining client.
    pub fn full_state(&mut self, inventory: InventoryId) -> Option<FullStateSync> {
        self.replicators
            .get_mut(&inventory)?
            .build_full_state(&self.registry)
    }

    /// Server side: checks authority, applies a client request and records it.
    pub fn serve_request(
        &mut self,
        inventory: InventoryId,
        gate: &dyn AuthorityGate,
        actor: ActorId,
        request: &ClientRequest,
    ) -> PredictionAck {
        let Some(replicator) = self.replicators.get_mut(&inventory) else {
            return PredictionAck {
                prediction_id: request.prediction_id(),
                success: false,
                result_code: InventoryResultCode::NotInitialized,
                instance_id: None,
            };
        };
        let response = replicator.handle_client_request(&mut self.registry, gate, actor, request);
        if let Some(record) = response.record {
            self.log_operation(inventory, record);
        }
        response.ack
    }

    /// Client side: applies a request locally ahead of the server's verdict.
    ///
    /// Predicted operations are not recorded in history.
    pub fn predict(
        &mut self,
        inventory: InventoryId,
        request: &ClientRequest,
    ) -> ManagerResult<OperationRecord> {
        let prediction_id = request.prediction_id();
        let replicator = self
            .replicators
            .get_mut(&inventory)
            .ok_or(ManagerError::InventoryNotFound(inventory))?;
        if !replicator.begin_prediction(&self.registry, prediction_id) {
            return Err(ManagerError::PredictionRefused(prediction_id));
        }
        let component = self
            .registry
            .get_mut(inventory)
            .ok_or(ManagerError::InventoryNotFound(inventory))?;
        match request.apply(component) {
            Ok(record) => Ok(record),
            Err(e) => {
                replicator.end_prediction(&mut self.registry, prediction_id, false);
                Err(e.into())
            }
        }
    }

    /// Client side: applies a message from the server.
    ///
    /// Returns false when the message could not be applied cleanly.
    pub fn apply_server_message(
        &mut self,
        inventory: InventoryId,
        message: ReplicationMessage,
    ) -> bool {
        let Some(replicator) = self.replicators.get_mut(&inventory) else {
            return false;
        };
        match message {
            ReplicationMessage::Delta(delta) => !matches!(
                replicator.apply_delta(&mut self.registry, delta),
                DeltaOutcome::Desynced | DeltaOutcome::Ignored
            ),
            ReplicationMessage::FullState(sync) => {
                replicator.client_full_state_sync(&mut self.registry, &sync)
            }
            ReplicationMessage::Ack(ack) => replicator.handle_server_ack(&mut self.registry, &ack),
            ReplicationMessage::Request(request) => {
                warn!(
                    "{} ignoring client request {} on the client",
                    inventory,
                    request.prediction_id()
                );
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Writes an inventory's save data to `path`.
    pub fn save_inventory(&self, inventory: InventoryId, path: &Path) -> ManagerResult<()> {
        self.component(inventory)?.to_save_data().save_to(path)?;
        info!("Saved {} to {}", inventory, path.display());
        Ok(())
    }

    /// Replaces an inventory's contents with save data from `path`.
    ///
    /// Clears its undo history.
    pub fn load_inventory(&mut self, inventory: InventoryId, path: &Path) -> ManagerResult<()> {
        let save = InventorySaveData::load_from(path)?;
        self.component_mut(inventory)?.load_save_data(&save)?;
        if let Some(history) = self.histories.get_mut(&inventory) {
            history.clear();
        }
        if let Some(replicator) = self.replicators.get_mut(&inventory) {
            replicator.mark_all_dirty();
        }
        info!("Loaded {} items into {}", save.items.len(), inventory);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn component(&self, inventory: InventoryId) -> ManagerResult<&InventoryComponent> {
        self.registry
            .get(inventory)
            .ok_or(ManagerError::InventoryNotFound(inventory))
    }

    fn component_mut(&mut self, inventory: InventoryId) -> ManagerResult<&mut InventoryComponent> {
        self.registry
            .get_mut(inventory)
            .ok_or(ManagerError::InventoryNotFound(inventory))
    }

    /// Instance covering `slot` and its quantity.
    fn occupant(&self, inventory: InventoryId, slot: usize) -> ManagerResult<(InstanceId, u32)> {
        self.component(inventory)?
            .item_at_slot(slot)
            .map(|i| (i.instance_id, i.quantity))
            .ok_or_else(|| InventoryError::SlotEmpty(slot).into())
    }

    /// Picks a slot for an unplaced instance, turning it when only the
    /// rotated footprint fits.
    fn place_automatically(
        &self,
        inventory: InventoryId,
        instance: &mut crate::item::ItemInstance,
    ) -> ManagerResult<usize> {
        let component = self.component(inventory)?;
        match self.constraints.find_best_placement(component, instance) {
            Some((slot, rotation)) => {
                instance.rotation = rotation;
                Ok(slot)
            }
            None => {
                debug!("No free slot for {} in {}", instance.item_id, inventory);
                let error = InventoryError::InsufficientSpace(instance.item_id.clone());
                self.events.publish(InventoryEvent::OperationFailed {
                    inventory,
                    code: error.code(),
                });
                Err(error.into())
            }
        }
    }

    fn ensure_allowed(
        &self,
        inventory: InventoryId,
        validation: ValidationResult,
    ) -> ManagerResult<()> {
        if validation.is_allowed() {
            Ok(())
        } else {
            Err(self.reject(inventory, validation))
        }
    }

    fn reject(&self, inventory: InventoryId, validation: ValidationResult) -> ManagerError {
        debug!("{} rejected: {}", inventory, validation);
        self.events.publish(InventoryEvent::OperationFailed {
            inventory,
            code: InventoryResultCode::ValidationFailed,
        });
        ManagerError::Validation(validation)
    }

    fn execute<F>(&mut self, inventory: InventoryId, operation: F) -> ManagerResult<OperationRecord>
    where
        F: FnOnce(&mut InventoryComponent) -> InventoryResult<OperationRecord>,
    {
        match operation(self.component_mut(inventory)?) {
            Ok(record) => {
                self.log_operation(inventory, record.clone());
                Ok(record)
            }
            Err(e) => {
                self.events.publish(InventoryEvent::OperationFailed {
                    inventory,
                    code: e.code(),
                });
                Err(e.into())
            }
        }
    }

    /// Sends a record to the active transaction or to history, then marks it dirty.
    fn log_operation(&mut self, inventory: InventoryId, record: OperationRecord) {
        let affected = record.affected_instances();
        match self.transactions.get_mut(&inventory) {
            Some(transaction) if transaction.is_active() => transaction.log_operation(record),
            _ => {
                if let Some(history) = self.histories.get_mut(&inventory) {
                    history.record_operation(record);
                }
            }
        }
        self.mark_dirty(inventory, &affected);
    }

    fn mark_dirty(&mut self, inventory: InventoryId, instances: &[InstanceId]) {
        if let Some(replicator) = self.replicators.get_mut(&inventory) {
            for id in instances {
                replicator.mark_item_dirty(*id);
            }
        }
    }
}

/// Transaction guard returned by [`InventoryManager::scoped_transaction`].
///
/// Dropping it commits when [`mark_success`](Self::mark_success) was called
/// and rolls back otherwise.
pub struct TransactionScope<'a> {
    manager: &'a mut InventoryManager,
    inventory: InventoryId,
    success: bool,
}

impl TransactionScope<'_> {
    /// Inventory the transaction covers.
    #[must_use]
    pub const fn inventory(&self) -> InventoryId {
        self.inventory
    }

    /// Commit on drop.
    pub fn mark_success(&mut self) {
        self.success = true;
    }
}

impl Deref for TransactionScope<'_> {
    type Target = InventoryManager;

    fn deref(&self) -> &Self::Target {
        self.manager
    }
}

impl DerefMut for TransactionScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.manager
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.manager.is_transaction_active(self.inventory) {
            return;
        }
        let result = if self.success {
            self.manager.commit_transaction(self.inventory).map(|_| ())
        } else {
            self.manager.rollback_transaction(self.inventory)
        };
        if let Err(e) = result {
            error!("Scoped transaction on {} did not close: {}", self.inventory, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::AllowAll;
    use crate::constraints::ViolationKind;
    use crate::replicator::{AddItemRequest, MoveItemRequest};
    use crate::test_support::item_table;
    use crate::transaction::TransactionState;
    use tempfile::TempDir;

    fn manager() -> InventoryManager {
        let config = InventoryConfig {
            grid_width: 4,
            grid_height: 4,
            max_weight: 0.0,
            ..InventoryConfig::default()
        };
        InventoryManager::new(config, item_table())
    }

    fn id(s: &str) -> ItemId {
        ItemId::new(s)
    }

    #[test]
    fn test_rules_reject_and_publish() {
        let mut m = manager();
        let inv = m.create_inventory_with_rules(InventoryRules::weapons_only());
        let _setup = m.events().drain();

        let err = m.add_item(inv, &id("medkit"), 1).expect_err("should fail");
        let ManagerError::Validation(validation) = &err else {
            panic!("expected validation error, got {err}");
        };
        assert!(validation.has_violation(&ViolationKind::ItemTypeNotAllowed));
        assert_eq!(err.code(), InventoryResultCode::ValidationFailed);
        assert!(m.inventory(inv).expect("inv").items().is_empty());
        assert!(!m.history(inv).expect("history").can_undo());
        assert!(m
            .events()
            .drain()
            .iter()
            .any(|e| matches!(e, InventoryEvent::OperationFailed { .. })));

        assert!(m.add_item(inv, &id("pistol"), 1).is_ok());
    }

    #[test]
    fn test_slot_constraints_steer_auto_placement() {
        let mut m = manager();
        let rules = InventoryRules::default()
            .with_slot_constraint(crate::constraints::SlotConstraint {
                is_locked: true,
                ..crate::constraints::SlotConstraint::new(0)
            });
        let inv = m.create_inventory_with_rules(rules);
        let record = m.add_item(inv, &id("keycard"), 1).expect("add");
        assert_eq!(record.new_slot, Some(1));
    }

    #[test]
    fn test_auto_placement_fails_when_every_slot_is_locked() {
        let mut m = manager();
        let inv = m.create_inventory_sized(2, 1, 0.0);
        m.constraints_mut().lock_slot(inv, 0);
        m.constraints_mut().lock_slot(inv, 1);
        let _setup = m.events().drain();

        let err = m.add_item(inv, &id("keycard"), 1).expect_err("no slot");
        assert!(matches!(
            err,
            ManagerError::Inventory(InventoryError::InsufficientSpace(_))
        ));
        assert!(m.inventory(inv).expect("inv").items().is_empty());
        assert!(!m.history(inv).expect("history").can_undo());
        assert!(m
            .events()
            .drain()
            .iter()
            .any(|e| matches!(e, InventoryEvent::OperationFailed { .. })));

        m.constraints_mut().unlock_slot(inv, 1);
        let record = m.add_item(inv, &id("keycard"), 1).expect("add");
        assert_eq!(record.new_slot, Some(1));
    }

    #[test]
    fn test_auto_placement_honours_slot_types() {
        let mut m = manager();
        let inv = m.create_inventory_sized(2, 1, 0.0);
        let mut quest_free = crate::constraints::SlotConstraint::new(0);
        quest_free.blocked_types.insert("Item.Type.Quest");
        m.constraints_mut()
            .set_rules(inv, InventoryRules::default().with_slot_constraint(quest_free));
        m.constraints_mut().lock_slot(inv, 1);

        assert!(matches!(
            m.add_item(inv, &id("keycard"), 1),
            Err(ManagerError::Inventory(InventoryError::InsufficientSpace(_)))
        ));
        let record = m.add_item(inv, &id("medkit"), 1).expect("medkit");
        assert_eq!(record.new_slot, Some(0));
    }

    #[test]
    fn test_auto_placement_turns_item_to_fit() {
        let mut m = manager();
        let inv = m.create_inventory_sized(1, 2, 0.0);
        let pistol = m.add_item(inv, &id("pistol"), 1).expect("pistol").instance_id;
        let placed = m.inventory(inv).and_then(|i| i.item(pistol)).expect("placed");
        assert_eq!(placed.slot_index, Some(0));
        assert!(placed.rotation.is_transposed());

        let fixed = m.create_inventory_sized(1, 2, 0.0);
        m.constraints_mut().set_rules(
            fixed,
            InventoryRules {
                allow_rotation: false,
                ..InventoryRules::default()
            },
        );
        assert!(matches!(
            m.add_item(fixed, &id("pistol"), 1),
            Err(ManagerError::Inventory(InventoryError::InsufficientSpace(_)))
        ));
        assert!(m.inventory(fixed).expect("fixed").items().is_empty());
    }

    #[test]
    fn test_total_quantity_cap_does_not_overflow() {
        let mut m = manager();
        let inv =
            m.create_inventory_with_rules(InventoryRules::default().with_max_total_quantity(100));
        m.add_item(inv, &id("ammo_9mm"), 5).expect("ammo");

        let err = m.add_item(inv, &id("ammo_9mm"), u32::MAX).expect_err("over cap");
        let ManagerError::Validation(validation) = &err else {
            panic!("expected validation error, got {err}");
        };
        assert!(validation.has_violation(&ViolationKind::MaxQuantityExceeded));
        assert_eq!(validation.max_allowed_quantity, Some(95));
        assert_eq!(m.inventory(inv).expect("inv").total_quantity(), 5);
    }

    #[test]
    fn test_remove_zero_is_rejected() {
        let mut m = manager();
        let inv = m.create_inventory();
        let ammo = m.add_item(inv, &id("ammo_9mm"), 10).expect("ammo").instance_id;

        let err = m.remove_item(inv, ammo, 0).expect_err("zero");
        let ManagerError::Validation(validation) = &err else {
            panic!("expected validation error, got {err}");
        };
        assert!(validation.has_violation(&ViolationKind::InvalidItem));
        assert_eq!(
            m.inventory(inv).and_then(|i| i.item(ammo)).map(|i| i.quantity),
            Some(10)
        );
        assert_eq!(m.history(inv).expect("history").undo_count(), 1);
    }

    #[test]
    fn test_undo_redo_marks_dirty() {
        let mut m = manager();
        let inv = m.create_inventory();
        m.add_item(inv, &id("ammo_9mm"), 30).expect("add");
        let mut sink: Vec<ReplicationMessage> = Vec::new();
        assert_eq!(m.flush_replication(inv, &mut sink).expect("flush"), Some(1));

        assert!(m.undo(inv));
        assert!(m.inventory(inv).expect("inv").items().is_empty());
        assert!(m.replicator(inv).expect("rep").has_dirty());
        assert_eq!(m.flush_replication(inv, &mut sink).expect("flush"), Some(2));

        assert!(m.redo(inv));
        assert_eq!(m.inventory(inv).expect("inv").item_count(&id("ammo_9mm")), 30);
        assert_eq!(m.undo_multiple(inv, 5), 1);
        assert_eq!(m.redo_multiple(inv, 5), 1);
    }

    #[test]
    fn test_scoped_transaction_rolls_back_on_drop() {
        let mut m = manager();
        let inv = m.create_inventory();
        m.add_item(inv, &id("vest"), 1).expect("vest");
        let before = m.inventory(inv).expect("inv").snapshot();

        {
            let mut scope = m.scoped_transaction(inv).expect("scope");
            scope.add_item(inv, &id("pistol"), 1).expect("pistol");
            scope.move_item(inv, 0, 10).expect("move");
            assert!(scope.is_transaction_active(inv));
        }

        assert_eq!(m.transaction_state(inv), TransactionState::RolledBack);
        assert!(m.inventory(inv).expect("inv").snapshot().same_items(&before));
        // Only the vest add made it to history.
        assert_eq!(m.history(inv).expect("history").undo_count(), 1);
    }

    #[test]
    fn test_scoped_transaction_commits_into_history() {
        let mut m = manager();
        let inv = m.create_inventory();
        {
            let mut scope = m.scoped_transaction(inv).expect("scope");
            scope.add_item(inv, &id("pistol"), 1).expect("pistol");
            scope.add_item(inv, &id("medkit"), 2).expect("medkit");
            assert!(!scope.undo(inv));
            scope.mark_success();
        }
        assert_eq!(m.transaction_state(inv), TransactionState::Committed);
        assert_eq!(m.history(inv).expect("history").undo_count(), 2);
        assert!(m.begin_transaction(inv).is_ok());
        assert!(matches!(
            m.begin_transaction(inv),
            Err(ManagerError::TransactionActive(_))
        ));
        assert!(m.cancel_transaction(inv).is_ok());
        assert!(matches!(
            m.commit_transaction(inv),
            Err(ManagerError::NoTransaction(_))
        ));
    }

    #[test]
    fn test_atomic_batch() {
        let mut m = manager();
        let inv = m.create_inventory();
        let ops = vec![
            BatchOperation::Add {
                item_id: id("vest"),
                quantity: 1,
            },
            BatchOperation::Add {
                item_id: id("medkit"),
                quantity: 3,
            },
            BatchOperation::Move {
                from_slot: 15,
                to_slot: 0,
            },
        ];

        let err = m.execute_batch(inv, &ops, true).expect_err("should fail");
        assert!(matches!(err, ManagerError::BatchAborted { index: 2, .. }));
        assert_eq!(err.code(), InventoryResultCode::ItemNotFound);
        assert!(m.inventory(inv).expect("inv").items().is_empty());
        assert!(!m.history(inv).expect("history").can_undo());

        let records = m.execute_batch(inv, &ops, false).expect("lenient");
        assert_eq!(records.len(), 2);
        assert_eq!(m.history(inv).expect("history").undo_count(), 2);
    }

    #[test]
    fn test_transfer_between_inventories() {
        let mut m = manager();
        let backpack = m.create_inventory();
        let stash = m.create_inventory_sized(2, 2, 0.0);
        let rifle = m.add_item(backpack, &id("rifle"), 1).expect("rifle").instance_id;
        let pistol = m.add_item(backpack, &id("pistol"), 1).expect("pistol").instance_id;

        // A 4x2 rifle cannot fit a 2x2 stash; it must land back where it was.
        assert!(m.transfer_item(backpack, stash, rifle, None).is_err());
        assert_eq!(
            m.inventory(backpack).and_then(|i| i.item(rifle)).and_then(|i| i.slot_index),
            Some(0)
        );

        let added = m.transfer_item(backpack, stash, pistol, None).expect("pistol");
        assert_eq!(added.new_slot, Some(0));
        assert!(!m.inventory(backpack).expect("bp").contains(pistol));
        assert!(m.inventory(stash).expect("stash").contains(pistol));
        assert_eq!(m.history(stash).expect("history").undo_count(), 1);
    }

    #[test]
    fn test_drop_respects_rules() {
        let mut m = manager();
        let inv = m.create_inventory_with_rules(InventoryRules::quest_items());
        let card = m.add_item(inv, &id("keycard"), 1).expect("card").instance_id;
        assert!(matches!(m.drop_item(inv, card), Err(ManagerError::Validation(_))));
        assert!(m.remove_item(inv, card, 1).is_ok());
    }

    #[test]
    fn test_prediction_round_trip() {
        let mut server = manager();
        let mut client = InventoryManager::with_role(
            server.config().clone(),
            item_table(),
            ReplicationRole::Client,
        );
        let server_inv = server.create_inventory();
        let client_inv = client.create_inventory();
        assert_eq!(server_inv, client_inv);

        let add = ClientRequest::AddItem(AddItemRequest {
            prediction_id: PredictionId::new(1),
            item_id: id("vest"),
            quantity: 1,
            target_slot: Some(0),
            instance_id: InstanceId::new(),
        });
        client.predict(client_inv, &add).expect("predict add");
        let ack = server.serve_request(server_inv, &AllowAll, ActorId::new(1), &add);
        assert!(client.apply_server_message(client_inv, ReplicationMessage::Ack(ack)));

        // The server moves something into the way, so the client's move will be wrong.
        server.add_item(server_inv, &id("keycard"), 1).expect("card");
        let vest = client.inventory(client_inv).expect("c").items()[0].instance_id;
        let bad_move = ClientRequest::MoveItem(MoveItemRequest {
            prediction_id: PredictionId::new(2),
            instance_id: vest,
            to_slot: 1,
        });
        client.predict(client_inv, &bad_move).expect("predict move");
        let ack = server.serve_request(server_inv, &AllowAll, ActorId::new(1), &bad_move);
        assert!(!ack.success);
        client.apply_server_message(client_inv, ReplicationMessage::Ack(ack));

        let mut sink: Vec<ReplicationMessage> = Vec::new();
        server.flush_all(&mut sink).expect("flush");
        for message in sink {
            client.apply_server_message(client_inv, message);
        }
        let server_state = server.inventory(server_inv).expect("s").snapshot();
        assert!(client
            .inventory(client_inv)
            .expect("c")
            .snapshot()
            .same_items(&server_state));
        assert_eq!(server.history(server_inv).expect("history").undo_count(), 2);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("backpack.scis");
        let mut m = manager();
        let inv = m.create_inventory();
        m.add_item(inv, &id("rifle"), 1).expect("rifle");
        m.add_item(inv, &id("ammo_9mm"), 45).expect("ammo");
        m.save_inventory(inv, &path).expect("save");
        let saved = m.inventory(inv).expect("inv").snapshot();

        m.remove_item_at_slot(inv, 0).expect("remove");
        m.load_inventory(inv, &path).expect("load");
        assert!(m.inventory(inv).expect("inv").snapshot().same_items(&saved));
        assert!(!m.history(inv).expect("history").can_undo());
    }

    #[test]
    fn test_destroy_inventory() {
        let mut m = manager();
        let inv = m.create_inventory();
        m.constraints_mut().lock_slot(inv, 3);
        assert!(m.destroy_inventory(inv));
        assert!(!m.destroy_inventory(inv));
        assert!(m.history(inv).is_none());
        assert!(!m.constraints().is_slot_locked(inv, 3));
        assert!(matches!(
            m.add_item(inv, &id("keycard"), 1),
            Err(ManagerError::InventoryNotFound(_))
        ));
    }
}
