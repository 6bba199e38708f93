//! Bounded undo/redo over operation records.
//!
//! Undo applies the inverse of a record against the live inventory; redo
//! re-applies it. A failed application leaves both stacks as they were.

use std::collections::VecDeque;

use suspense_common::{InventoryId, OperationId};
use tracing::{debug, warn};

use crate::component::{InventoryComponent, InventoryError, InventoryResult};
use crate::operation::{OperationRecord, OperationType};
use crate::registry::InventoryRegistry;

/// Default undo depth.
pub const DEFAULT_HISTORY_SIZE: usize = 50;

/// Undo and redo stacks for one inventory.
#[derive(Debug, Clone)]
pub struct InventoryHistory {
    owner: InventoryId,
    undo: VecDeque<OperationRecord>,
    redo: Vec<OperationRecord>,
    max_size: usize,
    save_point: Option<OperationId>,
}

impl InventoryHistory {
    /// Creates an empty history with the default depth.
    #[must_use]
    pub fn new(owner: InventoryId) -> Self {
        Self::with_max_size(owner, DEFAULT_HISTORY_SIZE)
    }

    /// Creates an empty history keeping at most `max_size` undo entries.
    #[must_use]
    pub fn with_max_size(owner: InventoryId, max_size: usize) -> Self {
        Self {
            owner,
            undo: VecDeque::new(),
            redo: Vec::new(),
            max_size: max_size.max(1),
            save_point: None,
        }
    }

    /// Inventory this history belongs to.
    #[must_use]
    pub const fn owner(&self) -> InventoryId {
        self.owner
    }

    /// Pushes a completed operation and invalidates redo.
    ///
    /// Failed or non-undoable records are ignored.
    pub fn record_operation(&mut self, record: OperationRecord) {
        if !record.success || !record.can_undo {
            return;
        }
        self.redo.clear();
        self.undo.push_back(record);
        self.trim();
    }

    /// Reverts the most recent operation.
    pub fn undo(&mut self, registry: &mut InventoryRegistry) -> bool {
        let Some(record) = self.undo.pop_back() else {
            return false;
        };
        let result = match registry.get_mut(self.owner) {
            Some(inventory) => apply_inverse(inventory, &record),
            None => Err(InventoryError::RestoreFailed(format!("{} not found", self.owner))),
        };

        match result {
            Ok(()) => {
                debug!("{} undo {}", self.owner, record);
                self.redo.push(record);
                true
            }
            Err(e) => {
                warn!("{} undo of {} failed: {}", self.owner, record, e);
                self.undo.push_back(record);
                false
            }
        }
    }

    /// Re-applies the most recently undone operation.
    pub fn redo(&mut self, registry: &mut InventoryRegistry) -> bool {
        let Some(record) = self.redo.pop() else {
            return false;
        };
        let result = match registry.get_mut(self.owner) {
            Some(inventory) => apply_forward(inventory, &record),
            None => Err(InventoryError::RestoreFailed(format!("{} not found", self.owner))),
        };

        match result {
            Ok(()) => {
                debug!("{} redo {}", self.owner, record);
                self.undo.push_back(record);
                self.trim();
                true
            }
            Err(e) => {
                warn!("{} redo of {} failed: {}", self.owner, record, e);
                self.redo.push(record);
                false
            }
        }
    }

    /// Undoes up to `count` operations, stopping at the first failure.
    pub fn undo_multiple(&mut self, registry: &mut InventoryRegistry, count: usize) -> usize {
        (0..count).take_while(|_| self.undo(registry)).count()
    }

    /// Redoes up to `count` operations, stopping at the first failure.
    pub fn redo_multiple(&mut self, registry: &mut InventoryRegistry, count: usize) -> usize {
        (0..count).take_while(|_| self.redo(registry)).count()
    }

    /// Checks if there is anything to undo.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    /// Checks if there is anything to redo.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Undo depth.
    #[must_use]
    pub fn undo_count(&self) -> usize {
        self.undo.len()
    }

    /// Redo depth.
    #[must_use]
    pub fn redo_count(&self) -> usize {
        self.redo.len()
    }

    /// Undo entries, newest first.
    #[must_use]
    pub fn undo_history(&self) -> Vec<&OperationRecord> {
        self.undo.iter().rev().collect()
    }

    /// Redo entries, newest first.
    #[must_use]
    pub fn redo_history(&self) -> Vec<&OperationRecord> {
        self.redo.iter().rev().collect()
    }

    /// Record most recently moved onto the redo stack.
    #[must_use]
    pub fn last_undone(&self) -> Option<&OperationRecord> {
        self.redo.last()
    }

    /// Record on top of the undo stack.
    #[must_use]
    pub fn last_done(&self) -> Option<&OperationRecord> {
        self.undo.back()
    }

    /// Remembers the current top of the undo stack as the saved state.
    pub fn mark_save_point(&mut self) {
        self.save_point = self.top_id();
    }

    /// Checks if the undo stack top matches the saved state.
    #[must_use]
    pub fn is_at_save_point(&self) -> bool {
        self.save_point == self.top_id()
    }

    /// Changes the undo depth, dropping the oldest entries if needed.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size.max(1);
        self.trim();
    }

    /// Undo depth limit.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Drops both stacks and the save point.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.save_point = None;
    }

    fn top_id(&self) -> Option<OperationId> {
        self.undo.back().map(|r| r.operation_id)
    }

    fn trim(&mut self) {
        while self.undo.len() > self.max_size {
            self.undo.pop_front();
        }
    }
}

fn slot_of(slot: Option<usize>, record: &OperationRecord) -> InventoryResult<usize> {
    slot.ok_or_else(|| InventoryError::InvalidItem(format!("{record} has no slot")))
}

fn payload(record: &OperationRecord) -> InventoryResult<&crate::item::ItemInstance> {
    record
        .instance
        .as_ref()
        .ok_or_else(|| InventoryError::InvalidItem(format!("{record} has no instance payload")))
}

fn secondary(record: &OperationRecord) -> InventoryResult<suspense_common::InstanceId> {
    record
        .secondary_instance_id
        .ok_or_else(|| InventoryError::InvalidItem(format!("{record} has no second instance")))
}

fn quantity_of(
    inventory: &InventoryComponent,
    instance_id: suspense_common::InstanceId,
) -> InventoryResult<u32> {
    inventory
        .item(instance_id)
        .map(|i| i.quantity)
        .ok_or(InventoryError::InstanceNotFound(instance_id))
}

fn apply_inverse(
    inventory: &mut InventoryComponent,
    record: &OperationRecord,
) -> InventoryResult<()> {
    match record.operation_type {
        OperationType::Add => {
            inventory.remove_instance(record.instance_id)?;
        }
        OperationType::Remove => {
            let slot = slot_of(record.previous_slot, record)?;
            inventory.add_instance(payload(record)?.clone(), Some(slot))?;
        }
        OperationType::Move => {
            let slot = slot_of(record.previous_slot, record)?;
            inventory.move_instance(record.instance_id, slot)?;
        }
        OperationType::Swap => {
            let from = slot_of(record.previous_slot, record)?;
            let to = slot_of(record.new_slot, record)?;
            let mut moves = vec![(record.instance_id, from)];
            if let Some(other) = record.secondary_instance_id {
                moves.push((other, to));
            }
            inventory.reposition(&moves)?;
        }
        OperationType::Rotate => {
            inventory.set_rotation(record.instance_id, record.previous_rotation)?;
        }
        OperationType::SplitStack => {
            let source = secondary(record)?;
            let restored = quantity_of(inventory, source)?
                .checked_add(record.quantity)
                .ok_or(InventoryError::InvalidQuantity(record.quantity))?;
            let new_stack = inventory
                .item(record.instance_id)
                .cloned()
                .ok_or(InventoryError::InstanceNotFound(record.instance_id))?;
            inventory.remove_instance(record.instance_id)?;
            if let Err(e) = inventory.set_quantity(source, restored) {
                let slot = new_stack.slot_index;
                inventory.add_instance(new_stack, slot)?;
                return Err(e);
            }
        }
        OperationType::MergeStack => {
            let target = secondary(record)?;
            let target_quantity = quantity_of(inventory, target)?;
            if target_quantity <= record.quantity {
                return Err(InventoryError::NotEnough {
                    needed: record.quantity.saturating_add(1),
                    have: target_quantity,
                });
            }
            inventory.set_quantity(target, target_quantity - record.quantity)?;
            let restored = if record.merge_consumed_source() {
                let source = payload(record)?.clone();
                let slot = source.slot_index;
                inventory.add_instance(source, slot).map(|_| ())
            } else {
                inventory
                    .set_quantity(record.instance_id, record.previous_quantity)
                    .map(|_| ())
            };
            // A failed undo leaves the target as it was.
            if let Err(e) = restored {
                inventory.set_quantity(target, target_quantity)?;
                return Err(e);
            }
        }
        OperationType::UpdateQuantity => {
            inventory.set_quantity(record.instance_id, record.previous_quantity)?;
        }
    }
    Ok(())
}

fn apply_forward(
    inventory: &mut InventoryComponent,
    record: &OperationRecord,
) -> InventoryResult<()> {
    match record.operation_type {
        OperationType::Add => {
            let slot = slot_of(record.new_slot, record)?;
            inventory.add_instance(payload(record)?.clone(), Some(slot))?;
        }
        OperationType::Remove => {
            inventory.remove_instance(record.instance_id)?;
        }
        OperationType::Move => {
            let slot = slot_of(record.new_slot, record)?;
            inventory.move_instance(record.instance_id, slot)?;
        }
        OperationType::Swap => {
            let from = slot_of(record.previous_slot, record)?;
            let to = slot_of(record.new_slot, record)?;
            let mut moves = vec![(record.instance_id, to)];
            if let Some(other) = record.secondary_instance_id {
                moves.push((other, from));
            }
            inventory.reposition(&moves)?;
        }
        OperationType::Rotate => {
            inventory.set_rotation(record.instance_id, record.new_rotation)?;
        }
        OperationType::SplitStack => {
            let new_stack = payload(record)?.clone();
            let slot = new_stack.slot_index;
            inventory.split_into(secondary(record)?, new_stack, slot)?;
        }
        OperationType::MergeStack => {
            inventory.merge_instances(record.instance_id, secondary(record)?)?;
        }
        OperationType::UpdateQuantity => {
            inventory.set_quantity(record.instance_id, record.quantity)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemInstance;
    use crate::test_support::component;
    use suspense_common::{ItemId, Rotation};

    fn setup(width: i32, height: i32) -> (InventoryRegistry, InventoryId, InventoryHistory) {
        let mut registry = InventoryRegistry::new();
        let id = registry.insert(component(width, height));
        (registry, id, InventoryHistory::new(id))
    }

    fn inv(registry: &mut InventoryRegistry, id: InventoryId) -> &mut InventoryComponent {
        registry.get_mut(id).expect("inventory")
    }

    #[test]
    fn test_undo_chain() {
        let (mut registry, id, mut history) = setup(3, 3);
        let add = inv(&mut registry, id)
            .add_instance(ItemInstance::new("medkit", 1), Some(0))
            .expect("add");
        let item = add.instance_id;
        history.record_operation(add);
        let moved = inv(&mut registry, id).move_item(0, 4).expect("move");
        history.record_operation(moved);

        let slot = |r: &InventoryRegistry| {
            r.get(id)
                .and_then(|i| i.item(item))
                .and_then(|i| i.slot_index)
        };

        assert!(history.undo(&mut registry));
        assert_eq!(slot(&registry), Some(0));
        assert!(history.undo(&mut registry));
        assert_eq!(registry.get(id).map(|i| i.items().len()), Some(0));
        assert!(!history.undo(&mut registry));

        assert!(history.redo(&mut registry));
        assert_eq!(slot(&registry), Some(0));
        assert!(history.redo(&mut registry));
        assert_eq!(slot(&registry), Some(4));
        assert!(!history.can_redo());
    }

    #[test]
    fn test_bounded_undo_keeps_newest() {
        let (mut registry, id, _) = setup(10, 10);
        let mut history = InventoryHistory::with_max_size(id, 5);
        let mut ids = Vec::new();
        for _ in 0..8 {
            let record = inv(&mut registry, id)
                .add_item(&ItemId::new("keycard"), 1)
                .expect("add");
            ids.push(record.operation_id);
            history.record_operation(record);
        }
        assert_eq!(history.undo_count(), 5);
        let kept: Vec<OperationId> =
            history.undo_history().iter().map(|r| r.operation_id).collect();
        let expected: Vec<OperationId> = ids.iter().rev().take(5).copied().collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn test_new_record_clears_redo() {
        let (mut registry, id, mut history) = setup(3, 3);
        for _ in 0..2 {
            let record = inv(&mut registry, id)
                .add_item(&ItemId::new("keycard"), 1)
                .expect("add");
            history.record_operation(record);
        }
        assert_eq!(history.undo_multiple(&mut registry, 5), 2);
        assert_eq!(history.redo_count(), 2);

        let record = inv(&mut registry, id)
            .add_item(&ItemId::new("medkit"), 1)
            .expect("add");
        history.record_operation(record);
        assert_eq!(history.redo_count(), 0);
    }

    #[test]
    fn test_failed_undo_keeps_record() {
        let (mut registry, id, mut history) = setup(3, 1);
        let add = inv(&mut registry, id)
            .add_instance(ItemInstance::new("keycard", 1), Some(0))
            .expect("add");
        let card = add.instance_id;
        history.record_operation(add);
        let moved = inv(&mut registry, id).move_item(0, 2).expect("move");
        history.record_operation(moved);

        // Something outside history occupies the old slot.
        inv(&mut registry, id)
            .add_instance(ItemInstance::new("medkit", 1), Some(0))
            .expect("blocker");

        assert!(!history.undo(&mut registry));
        assert_eq!(history.undo_count(), 2);
        assert_eq!(history.redo_count(), 0);
        assert_eq!(
            registry.get(id).and_then(|i| i.item(card)).and_then(|i| i.slot_index),
            Some(2)
        );
    }

    #[test]
    fn test_failed_merge_undo_restores_target() {
        let (mut registry, id, mut history) = setup(2, 1);
        let first = inv(&mut registry, id)
            .add_instance(ItemInstance::new("ammo_9mm", 10), Some(0))
            .expect("first");
        history.record_operation(first);
        let second = inv(&mut registry, id)
            .add_instance(ItemInstance::new("ammo_9mm", 10), Some(1))
            .expect("second");
        let target = second.instance_id;
        history.record_operation(second);
        let merge = inv(&mut registry, id).merge_stacks(0, 1).expect("merge");
        history.record_operation(merge);

        // The consumed source's cell is taken outside history.
        inv(&mut registry, id)
            .add_instance(ItemInstance::new("keycard", 1), Some(0))
            .expect("blocker");

        assert!(!history.undo(&mut registry));
        assert!(!history.undo(&mut registry));
        assert_eq!(history.undo_count(), 3);
        let inventory = registry.get(id).expect("inv");
        assert_eq!(inventory.item(target).map(|i| i.quantity), Some(20));
        assert_eq!(inventory.item_count(&ItemId::new("ammo_9mm")), 20);
    }

    #[test]
    fn test_failed_split_undo_keeps_new_stack() {
        let (mut registry, id, mut history) = setup(3, 1);
        let add = inv(&mut registry, id)
            .add_instance(ItemInstance::new("ammo_9mm", 50), Some(0))
            .expect("add");
        let source = add.instance_id;
        history.record_operation(add);
        let split = inv(&mut registry, id).split_stack(0, 20, Some(1)).expect("split");
        let new_stack = split.instance_id;
        history.record_operation(split);

        // Topping up the source outside history leaves no room to fold the split back.
        inv(&mut registry, id).set_quantity(source, 60).expect("top up");

        assert!(!history.undo(&mut registry));
        assert_eq!(history.undo_count(), 2);
        let inventory = registry.get(id).expect("inv");
        assert_eq!(inventory.item(source).map(|i| i.quantity), Some(60));
        assert_eq!(
            inventory.item(new_stack).map(|i| (i.quantity, i.slot_index)),
            Some((20, Some(1)))
        );
    }

    #[test]
    fn test_rotate_undo_is_real() {
        let (mut registry, id, mut history) = setup(3, 3);
        let add = inv(&mut registry, id)
            .add_instance(ItemInstance::new("pistol", 1), Some(0))
            .expect("add");
        let pistol = add.instance_id;
        history.record_operation(add);
        let rotate = inv(&mut registry, id).rotate_item(0).expect("rotate");
        history.record_operation(rotate);

        assert!(history.undo(&mut registry));
        let inventory = registry.get(id).expect("inv");
        assert_eq!(inventory.item(pistol).map(|i| i.rotation), Some(Rotation::Deg0));
        assert_eq!(inventory.storage().occupied_slots(pistol), vec![0, 1]);

        assert!(history.redo(&mut registry));
        let inventory = registry.get(id).expect("inv");
        assert_eq!(inventory.storage().occupied_slots(pistol), vec![0, 3]);
    }

    #[test]
    fn test_split_merge_undo() {
        let (mut registry, id, mut history) = setup(3, 3);
        let add = inv(&mut registry, id)
            .add_instance(ItemInstance::new("ammo_9mm", 40), Some(0))
            .expect("add");
        let ammo = add.instance_id;
        history.record_operation(add);
        let before = registry.get(id).map(InventoryComponent::snapshot).expect("inv");

        let split = inv(&mut registry, id).split_stack(0, 15, Some(2)).expect("split");
        history.record_operation(split);
        let merge = inv(&mut registry, id).merge_stacks(2, 0).expect("merge");
        history.record_operation(merge);
        assert_eq!(registry.get(id).map(|i| i.items().len()), Some(1));

        assert!(history.undo(&mut registry));
        assert_eq!(registry.get(id).map(|i| i.items().len()), Some(2));
        assert_eq!(registry.get(id).and_then(|i| i.item(ammo)).map(|i| i.quantity), Some(25));

        assert!(history.undo(&mut registry));
        let after = registry.get(id).map(InventoryComponent::snapshot).expect("inv");
        assert!(after.same_items(&before));

        assert_eq!(history.redo_multiple(&mut registry, 2), 2);
        assert_eq!(registry.get(id).and_then(|i| i.item(ammo)).map(|i| i.quantity), Some(40));
    }

    #[test]
    fn test_swap_undo_with_overlapping_footprints() {
        let (mut registry, id, mut history) = setup(4, 1);
        let card = inv(&mut registry, id)
            .add_instance(ItemInstance::new("keycard", 1), Some(0))
            .expect("card");
        let pistol = inv(&mut registry, id)
            .add_instance(ItemInstance::new("pistol", 1), Some(2))
            .expect("pistol");
        let before = registry.get(id).map(InventoryComponent::snapshot).expect("inv");

        // Pistol lands on cells 0-1, covering the card's old cell.
        let swap = inv(&mut registry, id).swap_items(0, 3).expect("swap");
        history.record_operation(swap);
        let slot = |r: &InventoryRegistry, i| {
            r.get(id).and_then(|x| x.item(i)).and_then(|x| x.slot_index)
        };
        assert_eq!(slot(&registry, card.instance_id), Some(2));
        assert_eq!(slot(&registry, pistol.instance_id), Some(0));

        assert!(history.undo(&mut registry));
        let after = registry.get(id).map(InventoryComponent::snapshot).expect("inv");
        assert!(after.same_items(&before));

        assert!(history.redo(&mut registry));
        assert_eq!(slot(&registry, pistol.instance_id), Some(0));
    }

    #[test]
    fn test_save_point() {
        let (mut registry, id, mut history) = setup(3, 3);
        assert!(history.is_at_save_point());
        let record = inv(&mut registry, id).add_item(&ItemId::new("keycard"), 1).expect("add");
        history.record_operation(record);
        assert!(!history.is_at_save_point());

        history.mark_save_point();
        assert!(history.is_at_save_point());
        assert!(history.undo(&mut registry));
        assert!(!history.is_at_save_point());
        assert!(history.redo(&mut registry));
        assert!(history.is_at_save_point());
    }

    #[test]
    fn test_ignores_failed_records() {
        let (_registry, id, mut history) = setup(3, 3);
        let mut record = OperationRecord::add(&ItemInstance::new("keycard", 1));
        record.success = false;
        history.record_operation(record);
        assert!(!history.can_undo());
        assert_eq!(history.owner(), id);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::test_support::component;
    use proptest::prelude::*;
    use suspense_common::ItemId;

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize),
        Remove(usize),
        Move(usize, usize),
        Swap(usize, usize),
        Rotate(usize),
        Split(usize, u32),
        Merge(usize, usize),
    }

    const TYPES: [&str; 5] = ["pistol", "ammo_9mm", "medkit", "vest", "keycard"];

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..TYPES.len()).prop_map(Op::Add),
            (0usize..16).prop_map(Op::Remove),
            (0usize..16, 0usize..16).prop_map(|(a, b)| Op::Move(a, b)),
            (0usize..16, 0usize..16).prop_map(|(a, b)| Op::Swap(a, b)),
            (0usize..16).prop_map(Op::Rotate),
            (0usize..16, 1u32..5).prop_map(|(s, q)| Op::Split(s, q)),
            (0usize..16, 0usize..16).prop_map(|(a, b)| Op::Merge(a, b)),
        ]
    }

    fn apply(inventory: &mut InventoryComponent, op: &Op) -> Option<OperationRecord> {
        match *op {
            Op::Add(t) => {
                let quantity = if TYPES[t] == "ammo_9mm" { 10 } else { 1 };
                inventory.add_item(&ItemId::new(TYPES[t]), quantity).ok()
            }
            Op::Remove(s) => inventory.remove_item_at_slot(s).ok(),
            Op::Move(a, b) => inventory.move_item(a, b).ok(),
            Op::Swap(a, b) => inventory.swap_items(a, b).ok(),
            Op::Rotate(s) => inventory.rotate_item(s).ok(),
            Op::Split(s, q) => inventory.split_stack(s, q, None).ok(),
            Op::Merge(a, b) => inventory.merge_stacks(a, b).ok(),
        }
    }

    proptest! {
        #[test]
        fn undo_all_then_redo_all_round_trips(ops in prop::collection::vec(op_strategy(), 1..30)) {
            let mut registry = InventoryRegistry::new();
            let id = registry.insert(component(4, 4));
            let mut history = InventoryHistory::with_max_size(id, 64);

            let initial = registry.get(id).map(InventoryComponent::snapshot).expect("inv");
            let mut applied = 0;
            for op in &ops {
                let inventory = registry.get_mut(id).expect("inv");
                if let Some(record) = apply(inventory, op) {
                    history.record_operation(record);
                    applied += 1;
                }
            }
            let final_state = registry.get(id).map(InventoryComponent::snapshot).expect("inv");

            prop_assert_eq!(history.undo_multiple(&mut registry, applied), applied);
            let undone = registry.get(id).map(InventoryComponent::snapshot).expect("inv");
            prop_assert!(undone.same_items(&initial));

            prop_assert_eq!(history.redo_multiple(&mut registry, applied), applied);
            let inventory = registry.get(id).expect("inv");
            prop_assert!(inventory.snapshot().same_items(&final_state));
            prop_assert!(inventory.validate_integrity().is_empty());
        }
    }
}
