//! Operation records: the immutable log entries produced by every mutation.

use serde::{Deserialize, Serialize};
use std::fmt;
use suspense_common::{
    unix_millis, InstanceId, InventoryResultCode, ItemId, OperationId, Rotation,
};

use crate::item::ItemInstance;

/// Kind of inventory mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Instance added
    Add,
    /// Instance removed
    Remove,
    /// Instance moved to another anchor
    Move,
    /// Two instances exchanged anchors
    Swap,
    /// Instance rotation changed
    Rotate,
    /// Part of a stack split into a new instance
    SplitStack,
    /// Units moved from one stack into another
    MergeStack,
    /// Stack size changed in place
    UpdateQuantity,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Log entry describing one completed mutation.
///
/// Carries enough state to compute and apply its inverse: slots and rotations
/// before and after, quantities, and for operations that create or destroy an
/// instance the full instance payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Unique, increasing ID
    pub operation_id: OperationId,
    /// Mutation kind
    pub operation_type: OperationType,
    /// Completion time (Unix milliseconds)
    pub timestamp: u64,
    /// Item type of the primary instance
    pub item_id: ItemId,
    /// Primary instance
    pub instance_id: InstanceId,
    /// Other instance involved (swap partner, split source, merge target)
    pub secondary_instance_id: Option<InstanceId>,
    /// Anchor before the mutation
    pub previous_slot: Option<usize>,
    /// Anchor after the mutation
    pub new_slot: Option<usize>,
    /// Units affected
    pub quantity: u32,
    /// Quantity of the primary instance before the mutation
    pub previous_quantity: u32,
    /// Rotation before the mutation
    pub previous_rotation: Rotation,
    /// Rotation after the mutation
    pub new_rotation: Rotation,
    /// Whether the mutation happened
    pub success: bool,
    /// Outcome code
    pub result_code: InventoryResultCode,
    /// Whether history may invert this record
    pub can_undo: bool,
    /// Instance payload for re-creation
    pub instance: Option<ItemInstance>,
}

impl OperationRecord {
    fn base(operation_type: OperationType, item: &ItemInstance) -> Self {
        Self {
            operation_id: OperationId::new(),
            operation_type,
            timestamp: unix_millis(),
            item_id: item.item_id.clone(),
            instance_id: item.instance_id,
            secondary_instance_id: None,
            previous_slot: item.slot_index,
            new_slot: item.slot_index,
            quantity: item.quantity,
            previous_quantity: item.quantity,
            previous_rotation: item.rotation,
            new_rotation: item.rotation,
            success: true,
            result_code: InventoryResultCode::Success,
            can_undo: true,
            instance: None,
        }
    }

    /// Record of an instance entering the inventory; `added` is the placed instance.
    #[must_use]
    pub fn add(added: &ItemInstance) -> Self {
        Self {
            previous_slot: None,
            instance: Some(added.clone()),
            ..Self::base(OperationType::Add, added)
        }
    }

    /// Record of an instance leaving the inventory; `removed` is its last placed state.
    #[must_use]
    pub fn remove(removed: &ItemInstance) -> Self {
        Self {
            new_slot: None,
            instance: Some(removed.clone()),
            ..Self::base(OperationType::Remove, removed)
        }
    }

    /// Record of a move between anchors.
    #[must_use]
    pub fn moved(item: &ItemInstance, from: usize, to: usize) -> Self {
        Self {
            previous_slot: Some(from),
            new_slot: Some(to),
            ..Self::base(OperationType::Move, item)
        }
    }

    /// Record of a swap: `first` went from `slot_a` to `slot_b`, `second` (if any) the other way.
    #[must_use]
    pub fn swap(
        first: &ItemInstance,
        second: Option<InstanceId>,
        slot_a: usize,
        slot_b: usize,
    ) -> Self {
        Self {
            secondary_instance_id: second,
            previous_slot: Some(slot_a),
            new_slot: Some(slot_b),
            ..Self::base(OperationType::Swap, first)
        }
    }

    /// Record of a rotation change.
    #[must_use]
    pub fn rotate(item: &ItemInstance, previous: Rotation, new: Rotation) -> Self {
        Self {
            previous_rotation: previous,
            new_rotation: new,
            ..Self::base(OperationType::Rotate, item)
        }
    }

    /// Record of `quantity` units split from `source` into `new_stack`.
    #[must_use]
    pub fn split(source: InstanceId, new_stack: &ItemInstance, quantity: u32) -> Self {
        Self {
            secondary_instance_id: Some(source),
            previous_slot: None,
            quantity,
            instance: Some(new_stack.clone()),
            ..Self::base(OperationType::SplitStack, new_stack)
        }
    }

    /// Record of `quantity` units merged from `source` (pre-merge state) into `target`.
    #[must_use]
    pub fn merge(source: &ItemInstance, target: InstanceId, quantity: u32) -> Self {
        Self {
            secondary_instance_id: Some(target),
            quantity,
            previous_quantity: source.quantity,
            new_slot: if quantity >= source.quantity {
                None
            } else {
                source.slot_index
            },
            instance: Some(source.clone()),
            ..Self::base(OperationType::MergeStack, source)
        }
    }

    /// Record of a stack size change.
    #[must_use]
    pub fn update_quantity(item: &ItemInstance, previous: u32) -> Self {
        Self {
            previous_quantity: previous,
            ..Self::base(OperationType::UpdateQuantity, item)
        }
    }

    /// Checks if a merge consumed its whole source stack.
    #[must_use]
    pub fn merge_consumed_source(&self) -> bool {
        self.operation_type == OperationType::MergeStack && self.quantity >= self.previous_quantity
    }

    /// Instances whose replicated state this operation changed.
    #[must_use]
    pub fn affected_instances(&self) -> Vec<InstanceId> {
        let mut ids = vec![self.instance_id];
        if let Some(other) = self.secondary_instance_id {
            ids.push(other);
        }
        ids
    }
}

impl fmt::Display for OperationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} [{}]",
            self.operation_id.raw(),
            self.operation_type,
            self.item_id,
            self.instance_id.short()
        )?;
        match (self.previous_slot, self.new_slot) {
            (Some(from), Some(to)) if from != to => write!(f, " {from}->{to}")?,
            (_, Some(to)) => write!(f, " @{to}")?,
            (Some(from), None) => write!(f, " from {from}")?,
            (None, None) => {}
        }
        if self.operation_type == OperationType::Rotate {
            write!(f, " {}->{}", self.previous_rotation, self.new_rotation)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placed(item_id: &str, quantity: u32, slot: usize) -> ItemInstance {
        let mut item = ItemInstance::new(item_id, quantity);
        item.slot_index = Some(slot);
        item
    }

    #[test]
    fn test_add_and_remove_carry_payload() {
        let item = placed("medkit", 2, 3);
        let add = OperationRecord::add(&item);
        assert_eq!(add.previous_slot, None);
        assert_eq!(add.new_slot, Some(3));
        assert_eq!(add.instance.as_ref(), Some(&item));

        let remove = OperationRecord::remove(&item);
        assert_eq!(remove.previous_slot, Some(3));
        assert_eq!(remove.new_slot, None);
        assert!(remove.operation_id > add.operation_id);
    }

    #[test]
    fn test_merge_consumption() {
        let source = placed("ammo", 10, 0);
        let target = InstanceId::new();

        let full = OperationRecord::merge(&source, target, 10);
        assert!(full.merge_consumed_source());
        assert_eq!(full.new_slot, None);

        let partial = OperationRecord::merge(&source, target, 4);
        assert!(!partial.merge_consumed_source());
        assert_eq!(partial.affected_instances(), vec![source.instance_id, target]);
    }

    #[test]
    fn test_display() {
        let item = placed("rifle", 1, 0);
        let record = OperationRecord::moved(&item, 0, 4);
        let text = record.to_string();
        assert!(text.contains("Move rifle"));
        assert!(text.ends_with("0->4"));
    }
}
