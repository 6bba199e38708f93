//! The inventory component: owns the grid and the item instances.
//!
//! Every mutation returns an [`OperationRecord`] on success. The component
//! itself does not validate against rule sets or log history; callers wrap
//! these methods in validate, mutate, and log steps (see
//! [`InventoryManager`](crate::manager::InventoryManager)).

use std::fmt::Write as _;
use std::sync::Arc;

use suspense_common::{
    GridSize, InstanceId, InventoryId, InventoryResultCode, ItemId, Rotation, Tag,
};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::events::{EventBus, InventoryEvent};
use crate::item::{ItemInstance, WeaponState};
use crate::item_data::{ItemData, ItemDataProvider};
use crate::operation::OperationRecord;
use crate::snapshot::{InventorySaveData, InventorySnapshot};
use crate::storage::InventoryStorage;

/// Inventory error types.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InventoryError {
    /// Instance is malformed
    #[error("Invalid item: {0}")]
    InvalidItem(String),

    /// No item data for this type
    #[error("Unknown item type: {0}")]
    UnknownItem(ItemId),

    /// Instance is not in this inventory
    #[error("Item instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// Nothing at the given slot
    #[error("No item at slot {0}")]
    SlotEmpty(usize),

    /// Slot outside the grid
    #[error("Invalid slot index {0}")]
    InvalidSlot(usize),

    /// Target cells are taken
    #[error("Slot {0} is occupied or the item does not fit there")]
    SlotOccupied(usize),

    /// No space anywhere in the grid
    #[error("No space for {0}")]
    InsufficientSpace(ItemId),

    /// Weight limit reached
    #[error("Weight limit exceeded: {current:.2} + {adding:.2} > {max:.2}")]
    WeightLimitExceeded {
        /// Weight carried now
        current: f32,
        /// Weight that would be added
        adding: f32,
        /// Limit
        max: f32,
    },

    /// Not enough items
    #[error("Not enough items: need {needed}, have {have}")]
    NotEnough {
        /// Amount needed
        needed: u32,
        /// Amount available
        have: u32,
    },

    /// Quantity is zero or otherwise unusable
    #[error("Invalid quantity {0}")]
    InvalidQuantity(u32),

    /// Stack would exceed its limit
    #[error("Stack limit of {max_stack} exceeded for {item_id}")]
    StackLimitExceeded {
        /// Item type
        item_id: ItemId,
        /// Limit per stack
        max_stack: u32,
    },

    /// Instance ID already present
    #[error("Instance {0} is already in the inventory")]
    DuplicateInstance(InstanceId),

    /// Stacks hold different items or unique state
    #[error("Items cannot be stacked together")]
    NotStackable,

    /// Both operands resolve to the same instance
    #[error("Operation needs two different items")]
    SameInstance,

    /// Bulk restore left some items unplaced
    #[error("Restore failed: {0}")]
    RestoreFailed(String),
}

impl InventoryError {
    /// Maps the error to its wire/result code.
    #[must_use]
    pub const fn code(&self) -> InventoryResultCode {
        match self {
            Self::InvalidItem(_)
            | Self::UnknownItem(_)
            | Self::NotStackable
            | Self::SameInstance => InventoryResultCode::InvalidItem,
            Self::InstanceNotFound(_) | Self::SlotEmpty(_) => InventoryResultCode::ItemNotFound,
            Self::InvalidSlot(_) => InventoryResultCode::InvalidSlot,
            Self::SlotOccupied(_) | Self::DuplicateInstance(_) => InventoryResultCode::SlotOccupied,
            Self::InsufficientSpace(_) => InventoryResultCode::InsufficientSpace,
            Self::WeightLimitExceeded { .. } => InventoryResultCode::WeightLimitExceeded,
            Self::NotEnough { .. } | Self::InvalidQuantity(_) => {
                InventoryResultCode::InsufficientQuantity
            }
            Self::StackLimitExceeded { .. } => InventoryResultCode::StackLimitExceeded,
            Self::RestoreFailed(_) => InventoryResultCode::TransactionFailed,
        }
    }
}

/// Result type for inventory operations.
pub type InventoryResult<T> = Result<T, InventoryError>;

#[derive(Debug, Clone, Copy)]
struct ItemProfile {
    size: GridSize,
    unit_weight: f32,
    max_stack: u32,
}

/// A grid inventory.
pub struct InventoryComponent {
    id: InventoryId,
    storage: InventoryStorage,
    items: Vec<ItemInstance>,
    max_weight: f32,
    current_weight: f32,
    auto_rotate: bool,
    item_data: Arc<dyn ItemDataProvider>,
    events: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for InventoryComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryComponent")
            .field("id", &self.id)
            .field("grid", &(self.storage.width(), self.storage.height()))
            .field("items", &self.items.len())
            .field("weight", &self.current_weight)
            .field("max_weight", &self.max_weight)
            .finish()
    }
}

impl InventoryComponent {
    /// Creates an empty inventory. A `max_weight` of 0 disables the weight limit.
    #[must_use]
    pub fn new(
        width: i32,
        height: i32,
        max_weight: f32,
        item_data: Arc<dyn ItemDataProvider>,
    ) -> Self {
        Self {
            id: InventoryId::UNASSIGNED,
            storage: InventoryStorage::new(width, height),
            items: Vec::new(),
            max_weight: max_weight.max(0.0),
            current_weight: 0.0,
            auto_rotate: true,
            item_data,
            events: None,
        }
    }

    /// Attaches an event bus for notifications.
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Resets the grid and removes every item.
    pub fn initialize(&mut self, width: i32, height: i32, max_weight: f32) {
        self.storage.initialize(width, height);
        self.items.clear();
        self.max_weight = max_weight.max(0.0);
        self.current_weight = 0.0;
        debug!(
            "{} initialized {}x{} max weight {:.1}",
            self.id,
            self.storage.width(),
            self.storage.height(),
            self.max_weight
        );
    }

    pub(crate) fn set_id(&mut self, id: InventoryId) {
        self.id = id;
    }

    /// Registry handle of this inventory.
    #[must_use]
    pub const fn id(&self) -> InventoryId {
        self.id
    }

    /// The slot grid.
    #[must_use]
    pub const fn storage(&self) -> &InventoryStorage {
        &self.storage
    }

    /// Grid width.
    #[must_use]
    pub const fn grid_width(&self) -> i32 {
        self.storage.width()
    }

    /// Grid height.
    #[must_use]
    pub const fn grid_height(&self) -> i32 {
        self.storage.height()
    }

    /// All instances, in insertion order.
    #[must_use]
    pub fn items(&self) -> &[ItemInstance] {
        &self.items
    }

    /// Looks up an instance.
    #[must_use]
    pub fn item(&self, instance_id: InstanceId) -> Option<&ItemInstance> {
        self.items.iter().find(|i| i.instance_id == instance_id)
    }

    /// Checks if the instance lives here.
    #[must_use]
    pub fn contains(&self, instance_id: InstanceId) -> bool {
        self.index_of(instance_id).is_some()
    }

    /// Instance covering `slot`, resolved through its anchor.
    #[must_use]
    pub fn item_at_slot(&self, slot: usize) -> Option<&ItemInstance> {
        self.storage
            .instance_at_slot(slot)
            .and_then(|id| self.item(id))
    }

    /// Total quantity of an item type across stacks.
    #[must_use]
    pub fn item_count(&self, item_id: &ItemId) -> u32 {
        self.items
            .iter()
            .filter(|i| &i.item_id == item_id)
            .fold(0, |total: u32, i| total.saturating_add(i.quantity))
    }

    /// Checks if at least `quantity` units of an item type are present.
    #[must_use]
    pub fn has_item(&self, item_id: &ItemId, quantity: u32) -> bool {
        self.item_count(item_id) >= quantity
    }

    /// Number of distinct item types.
    #[must_use]
    pub fn unique_item_count(&self) -> usize {
        let mut ids: Vec<&ItemId> = self.items.iter().map(|i| &i.item_id).collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    /// Sum of all stack sizes.
    #[must_use]
    pub fn total_quantity(&self) -> u32 {
        self.items.iter().fold(0, |total: u32, i| total.saturating_add(i.quantity))
    }

    /// Instances whose item data carries `tag` (hierarchically).
    #[must_use]
    pub fn find_items_by_tag(&self, tag: &Tag) -> Vec<&ItemInstance> {
        self.items
            .iter()
            .filter(|i| {
                self.item_data
                    .item_data(&i.item_id)
                    .is_some_and(|d| d.tags.has_tag(tag))
            })
            .collect()
    }

    /// Carried weight.
    #[must_use]
    pub const fn current_weight(&self) -> f32 {
        self.current_weight
    }

    /// Weight limit, 0 when unlimited.
    #[must_use]
    pub const fn max_weight(&self) -> f32 {
        self.max_weight
    }

    /// Weight still available, infinite when unlimited.
    #[must_use]
    pub fn remaining_weight(&self) -> f32 {
        if self.max_weight > 0.0 {
            (self.max_weight - self.current_weight).max(0.0)
        } else {
            f32::INFINITY
        }
    }

    /// Changes the weight limit. Existing items are kept even if now over the limit.
    pub fn set_max_weight(&mut self, max_weight: f32) {
        self.max_weight = max_weight.max(0.0);
    }

    /// Whether auto-placement may rotate items to fit.
    pub fn set_auto_rotate(&mut self, enabled: bool) {
        self.auto_rotate = enabled;
    }

    /// Static data for an item type.
    #[must_use]
    pub fn item_data(&self, item_id: &ItemId) -> Option<&ItemData> {
        self.item_data.item_data(item_id)
    }

    /// The item data provider shared with this inventory.
    #[must_use]
    pub fn item_data_provider(&self) -> &Arc<dyn ItemDataProvider> {
        &self.item_data
    }

    /// The attached event bus, if any.
    #[must_use]
    pub fn event_bus(&self) -> Option<&Arc<EventBus>> {
        self.events.as_ref()
    }

    /// Base footprint of an item type.
    #[must_use]
    pub fn item_size(&self, item_id: &ItemId) -> Option<GridSize> {
        self.item_data(item_id).map(|d| d.grid_size)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Builds a fresh, unplaced instance of `item_id`. Weapons start with a full magazine.
    #[must_use]
    pub fn create_instance(&self, item_id: &ItemId, quantity: u32) -> ItemInstance {
        let mut instance = ItemInstance::new(item_id.clone(), quantity);
        if let Some(weapon) = self.item_data(item_id).and_then(|d| d.weapon.as_ref()) {
            instance.weapon_state = Some(WeaponState::new(weapon.magazine_size as f32, 0.0));
        }
        instance
    }

    /// Creates and auto-places a new stack of `item_id`.
    pub fn add_item(
        &mut self,
        item_id: &ItemId,
        quantity: u32,
    ) -> InventoryResult<OperationRecord> {
        let instance = self.create_instance(item_id, quantity);
        self.add_instance(instance, None)
    }

    /// Adds an instance at `slot`, or at the first free position when `None`.
    pub fn add_instance(
        &mut self,
        instance: ItemInstance,
        slot: Option<usize>,
    ) -> InventoryResult<OperationRecord> {
        let index = self.insert_instance(instance, slot, true)?;
        let added = &self.items[index];
        let record = OperationRecord::add(added);

        debug!("{} added {}", self.id, added);
        self.publish(InventoryEvent::ItemAdded {
            inventory: self.id,
            instance_id: added.instance_id,
            item_id: added.item_id.clone(),
            slot: added.slot_index.unwrap_or_default(),
            quantity: added.quantity,
        });
        Ok(record)
    }

    /// Removes an instance entirely.
    pub fn remove_instance(&mut self, instance_id: InstanceId) -> InventoryResult<OperationRecord> {
        let index = self
            .index_of(instance_id)
            .ok_or(InventoryError::InstanceNotFound(instance_id))?;
        self.storage.remove_item(instance_id);
        let removed = self.items.remove(index);
        self.recalculate_weight();

        let record = OperationRecord::remove(&removed);
        debug!("{} removed {}", self.id, removed);
        self.publish(InventoryEvent::ItemRemoved {
            inventory: self.id,
            instance_id,
            item_id: removed.item_id,
            slot: removed.slot_index,
            quantity: removed.quantity,
        });
        Ok(record)
    }

    /// Removes whatever item covers `slot`.
    pub fn remove_item_at_slot(&mut self, slot: usize) -> InventoryResult<OperationRecord> {
        let id = self.occupant(slot)?;
        self.remove_instance(id)
    }

    /// Removes `quantity` units of an item type, emptying stacks in order.
    pub fn remove_item_by_id(
        &mut self,
        item_id: &ItemId,
        quantity: u32,
    ) -> InventoryResult<Vec<OperationRecord>> {
        if quantity == 0 {
            return Err(InventoryError::InvalidQuantity(0));
        }
        let have = self.item_count(item_id);
        if have < quantity {
            return Err(InventoryError::NotEnough {
                needed: quantity,
                have,
            });
        }

        let stacks: Vec<(InstanceId, u32)> = self
            .items
            .iter()
            .filter(|i| &i.item_id == item_id)
            .map(|i| (i.instance_id, i.quantity))
            .collect();

        let mut remaining = quantity;
        let mut records = Vec::new();
        for (id, stack) in stacks {
            if remaining == 0 {
                break;
            }
            if stack <= remaining {
                records.push(self.remove_instance(id)?);
                remaining -= stack;
            } else {
                records.push(self.set_quantity(id, stack - remaining)?);
                remaining = 0;
            }
        }
        Ok(records)
    }

    /// Moves the item covering `from_slot` so its anchor lands on `to_slot`.
    pub fn move_item(
        &mut self,
        from_slot: usize,
        to_slot: usize,
    ) -> InventoryResult<OperationRecord> {
        let id = self.occupant(from_slot)?;
        self.move_instance(id, to_slot)
    }

    /// Moves an instance so its anchor lands on `to_slot`.
    pub fn move_instance(
        &mut self,
        instance_id: InstanceId,
        to_slot: usize,
    ) -> InventoryResult<OperationRecord> {
        if !self.storage.is_valid_slot(to_slot) {
            return Err(InventoryError::InvalidSlot(to_slot));
        }
        let index = self
            .index_of(instance_id)
            .ok_or(InventoryError::InstanceNotFound(instance_id))?;
        let profile = self.profile(&self.items[index].item_id)?;
        let item = &self.items[index];
        let from_slot = item
            .slot_index
            .ok_or_else(|| InventoryError::InvalidItem(format!("{item} is not placed")))?;
        let rotated = item.rotation.is_transposed();

        if !self
            .storage
            .move_item(instance_id, profile.size, to_slot, rotated)
        {
            return Err(InventoryError::SlotOccupied(to_slot));
        }
        self.set_placement(index, to_slot);

        let record = OperationRecord::moved(&self.items[index], from_slot, to_slot);
        debug!("{} moved {} {} -> {}", self.id, instance_id.short(), from_slot, to_slot);
        self.publish(InventoryEvent::ItemMoved {
            inventory: self.id,
            instance_id,
            from_slot,
            to_slot,
        });
        Ok(record)
    }

    /// Exchanges the items covering two slots.
    ///
    /// Each item moves to the other's anchor; if one slot is empty the single
    /// item simply moves there.
    pub fn swap_items(&mut self, slot_a: usize, slot_b: usize) -> InventoryResult<OperationRecord> {
        for slot in [slot_a, slot_b] {
            if !self.storage.is_valid_slot(slot) {
                return Err(InventoryError::InvalidSlot(slot));
            }
        }
        let first = self.storage.instance_at_slot(slot_a);
        let second = self.storage.instance_at_slot(slot_b);
        if first.is_some() && first == second {
            return Err(InventoryError::SameInstance);
        }

        let anchor_a = first
            .and_then(|id| self.storage.anchor_of_instance(id))
            .unwrap_or(slot_a);
        let anchor_b = second
            .and_then(|id| self.storage.anchor_of_instance(id))
            .unwrap_or(slot_b);

        let (primary, other, from, to) = match (first, second) {
            (Some(a), b) => (a, b, anchor_a, anchor_b),
            (None, Some(b)) => (b, None, anchor_b, anchor_a),
            (None, None) => return Err(InventoryError::SlotEmpty(slot_a)),
        };

        let mut moves = vec![(primary, to)];
        if let Some(other) = other {
            moves.push((other, from));
        }
        self.reposition(&moves)?;

        let index = self
            .index_of(primary)
            .ok_or(InventoryError::InstanceNotFound(primary))?;
        let record = OperationRecord::swap(&self.items[index], other, from, to);
        debug!("{} swapped slots {} <-> {}", self.id, from, to);
        self.publish(InventoryEvent::ItemsSwapped {
            inventory: self.id,
            first: primary,
            second: other,
        });
        Ok(record)
    }

    /// Places several instances at new anchors as one all-or-nothing step.
    ///
    /// On failure every listed instance goes back to where it was.
    pub fn reposition(&mut self, moves: &[(InstanceId, usize)]) -> InventoryResult<()> {
        let mut plan = Vec::with_capacity(moves.len());
        for &(id, target) in moves {
            if !self.storage.is_valid_slot(target) {
                return Err(InventoryError::InvalidSlot(target));
            }
            let index = self.index_of(id).ok_or(InventoryError::InstanceNotFound(id))?;
            let item = &self.items[index];
            let old = item
                .slot_index
                .ok_or_else(|| InventoryError::InvalidItem(format!("{item} is not placed")))?;
            let size = self.profile(&item.item_id)?.size;
            plan.push((index, id, size, item.rotation.is_transposed(), old, target));
        }

        for &(_, id, ..) in &plan {
            self.storage.remove_item(id);
        }

        let placed_all = plan.iter().all(|&(_, id, size, rotated, _, target)| {
            self.storage.place_item(id, size, target, rotated)
        });

        if !placed_all {
            for &(_, id, ..) in &plan {
                self.storage.remove_item(id);
            }
            for &(_, id, size, rotated, old, _) in &plan {
                if !self.storage.place_item(id, size, old, rotated) {
                    warn!("{} could not restore {} at slot {}", self.id, id.short(), old);
                }
            }
            let blocked = plan.iter().map(|p| p.5).next().unwrap_or_default();
            return Err(InventoryError::SlotOccupied(blocked));
        }

        for &(index, _, _, _, _, target) in &plan {
            self.set_placement(index, target);
        }
        Ok(())
    }

    /// Rotates the item covering `slot` a quarter turn clockwise.
    pub fn rotate_item(&mut self, slot: usize) -> InventoryResult<OperationRecord> {
        let id = self.occupant(slot)?;
        let next = self
            .item(id)
            .map(|i| i.rotation.next())
            .ok_or(InventoryError::InstanceNotFound(id))?;
        self.set_rotation(id, next)
    }

    /// Sets an instance's rotation in place, re-checking its footprint.
    pub fn set_rotation(
        &mut self,
        instance_id: InstanceId,
        rotation: Rotation,
    ) -> InventoryResult<OperationRecord> {
        let index = self
            .index_of(instance_id)
            .ok_or(InventoryError::InstanceNotFound(instance_id))?;
        let profile = self.profile(&self.items[index].item_id)?;
        let item = &self.items[index];
        let anchor = item
            .slot_index
            .ok_or_else(|| InventoryError::InvalidItem(format!("{item} is not placed")))?;
        let previous = item.rotation;

        if previous.is_transposed() != rotation.is_transposed()
            && !self
                .storage
                .move_item(instance_id, profile.size, anchor, rotation.is_transposed())
        {
            return Err(InventoryError::SlotOccupied(anchor));
        }
        self.items[index].rotation = rotation;

        let record = OperationRecord::rotate(&self.items[index], previous, rotation);
        debug!("{} rotated {} {} -> {}", self.id, instance_id.short(), previous, rotation);
        self.publish(InventoryEvent::ItemRotated {
            inventory: self.id,
            instance_id,
            rotation,
        });
        Ok(record)
    }

    /// Splits `quantity` units off the stack at `slot` into a new stack.
    pub fn split_stack(
        &mut self,
        slot: usize,
        quantity: u32,
        target_slot: Option<usize>,
    ) -> InventoryResult<OperationRecord> {
        let source_id = self.occupant(slot)?;
        let source = self
            .item(source_id)
            .ok_or(InventoryError::InstanceNotFound(source_id))?;
        let mut new_stack = ItemInstance::new(source.item_id.clone(), quantity);
        new_stack.properties = source.properties.clone();
        self.split_into(source_id, new_stack, target_slot)
    }

    /// Moves `new_stack.quantity` units from `source_id` into the given new instance.
    pub fn split_into(
        &mut self,
        source_id: InstanceId,
        new_stack: ItemInstance,
        target_slot: Option<usize>,
    ) -> InventoryResult<OperationRecord> {
        let source_index = self
            .index_of(source_id)
            .ok_or(InventoryError::InstanceNotFound(source_id))?;
        let have = self.items[source_index].quantity;
        let quantity = new_stack.quantity;
        if quantity == 0 {
            return Err(InventoryError::InvalidQuantity(0));
        }
        if quantity >= have {
            return Err(InventoryError::NotEnough {
                needed: quantity + 1,
                have,
            });
        }
        if new_stack.item_id != self.items[source_index].item_id {
            return Err(InventoryError::NotStackable);
        }

        // Weight is unchanged by a split, so the limit is not re-checked.
        let new_index = self.insert_instance(new_stack, target_slot, false)?;
        let new_stack = self.items[new_index].clone();
        if let Some(source) = self.items.iter_mut().find(|i| i.instance_id == source_id) {
            source.quantity -= quantity;
        }
        self.recalculate_weight();

        let record = OperationRecord::split(source_id, &new_stack, quantity);
        debug!(
            "{} split {} units of {} into {}",
            self.id,
            quantity,
            source_id.short(),
            new_stack.instance_id.short()
        );
        self.publish(InventoryEvent::StackSplit {
            inventory: self.id,
            source: source_id,
            new_stack: new_stack.instance_id,
            quantity,
        });
        Ok(record)
    }

    /// Merges the stack at `source_slot` into the stack at `target_slot`.
    pub fn merge_stacks(
        &mut self,
        source_slot: usize,
        target_slot: usize,
    ) -> InventoryResult<OperationRecord> {
        let source = self.occupant(source_slot)?;
        let target = self.occupant(target_slot)?;
        self.merge_instances(source, target)
    }

    /// Moves as many units as fit from `source` into `target`.
    ///
    /// The source is removed when it empties.
    pub fn merge_instances(
        &mut self,
        source: InstanceId,
        target: InstanceId,
    ) -> InventoryResult<OperationRecord> {
        if source == target {
            return Err(InventoryError::SameInstance);
        }
        let source_index = self
            .index_of(source)
            .ok_or(InventoryError::InstanceNotFound(source))?;
        let target_index = self
            .index_of(target)
            .ok_or(InventoryError::InstanceNotFound(target))?;
        let source_item = self.items[source_index].clone();
        let target_item = &self.items[target_index];
        if !source_item.can_stack_with(target_item) {
            return Err(InventoryError::NotStackable);
        }

        let max_stack = self.profile(&source_item.item_id)?.max_stack;
        let space = max_stack.saturating_sub(target_item.quantity);
        if space == 0 {
            return Err(InventoryError::StackLimitExceeded {
                item_id: source_item.item_id.clone(),
                max_stack,
            });
        }
        let moved = space.min(source_item.quantity);

        self.items[target_index].quantity += moved;
        if moved == source_item.quantity {
            self.storage.remove_item(source);
            self.items.remove(source_index);
        } else {
            self.items[source_index].quantity -= moved;
        }
        self.recalculate_weight();

        let record = OperationRecord::merge(&source_item, target, moved);
        debug!(
            "{} merged {} units {} -> {}",
            self.id,
            moved,
            source.short(),
            target.short()
        );
        self.publish(InventoryEvent::StacksMerged {
            inventory: self.id,
            source,
            target,
            quantity: moved,
        });
        Ok(record)
    }

    /// Sets a stack's quantity, enforcing the stack and weight limits.
    pub fn set_quantity(
        &mut self,
        instance_id: InstanceId,
        quantity: u32,
    ) -> InventoryResult<OperationRecord> {
        if quantity == 0 {
            return Err(InventoryError::InvalidQuantity(0));
        }
        let index = self
            .index_of(instance_id)
            .ok_or(InventoryError::InstanceNotFound(instance_id))?;
        let item_id = self.items[index].item_id.clone();
        let profile = self.profile(&item_id)?;
        if quantity > profile.max_stack {
            return Err(InventoryError::StackLimitExceeded {
                item_id,
                max_stack: profile.max_stack,
            });
        }
        let previous = self.items[index].quantity;
        if quantity > previous {
            self.check_weight(profile.unit_weight * (quantity - previous) as f32)?;
        }

        self.items[index].quantity = quantity;
        self.recalculate_weight();

        let record = OperationRecord::update_quantity(&self.items[index], previous);
        trace!("{} quantity of {} {} -> {}", self.id, instance_id.short(), previous, quantity);
        self.publish(InventoryEvent::QuantityChanged {
            inventory: self.id,
            instance_id,
            old_quantity: previous,
            new_quantity: quantity,
        });
        Ok(record)
    }

    /// Merges every partial stack of `item_id` into as few stacks as possible.
    pub fn consolidate_stacks(
        &mut self,
        item_id: &ItemId,
    ) -> InventoryResult<Vec<OperationRecord>> {
        let mut stacks: Vec<(usize, InstanceId)> = self
            .items
            .iter()
            .filter(|i| &i.item_id == item_id)
            .map(|i| (i.slot_index.unwrap_or(usize::MAX), i.instance_id))
            .collect();
        stacks.sort_unstable();
        let ids: Vec<InstanceId> = stacks.into_iter().map(|(_, id)| id).collect();

        let mut records = Vec::new();
        for (i, &target) in ids.iter().enumerate() {
            for &source in &ids[i + 1..] {
                if !self.contains(target) || !self.contains(source) {
                    continue;
                }
                match self.merge_instances(source, target) {
                    Ok(record) => records.push(record),
                    Err(InventoryError::StackLimitExceeded { .. }) => break,
                    Err(InventoryError::NotStackable) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(records)
    }

    /// Repacks every item, largest footprint first, rotating where it helps.
    ///
    /// Returns the number of items that changed position or rotation. If the
    /// repacked layout does not fit, the previous layout is kept.
    pub fn defragment(&mut self) -> InventoryResult<usize> {
        let mut order: Vec<(usize, GridSize)> = Vec::with_capacity(self.items.len());
        for (index, item) in self.items.iter().enumerate() {
            order.push((index, self.profile(&item.item_id)?.size));
        }
        order.sort_by_key(|&(index, size)| {
            (
                std::cmp::Reverse(size.area()),
                self.items[index].slot_index.unwrap_or(usize::MAX),
            )
        });

        let previous: Vec<(Option<usize>, Rotation)> =
            self.items.iter().map(|i| (i.slot_index, i.rotation)).collect();

        self.storage.clear();
        let mut layout = Vec::with_capacity(order.len());
        for &(index, size) in &order {
            let id = self.items[index].instance_id;
            let Some((slot, rotated)) = self.storage.find_free_slot(size, true) else {
                warn!("{} defragment could not fit {}, keeping layout", self.id, id.short());
                self.restore_layout(&previous)?;
                return Err(InventoryError::InsufficientSpace(self.items[index].item_id.clone()));
            };
            self.storage.place_item(id, size, slot, rotated);
            layout.push((index, slot, rotated));
        }

        let mut changed = 0;
        for (index, slot, rotated) in layout {
            let item = &mut self.items[index];
            let rotation = if rotated == item.rotation.is_transposed() {
                item.rotation
            } else if rotated {
                Rotation::Deg90
            } else {
                Rotation::Deg0
            };
            if item.slot_index != Some(slot) || item.rotation != rotation {
                changed += 1;
            }
            item.rotation = rotation;
            self.set_placement(index, slot);
        }

        debug!(
            "{} defragmented: {} items moved, fragmentation {:.2}",
            self.id,
            changed,
            self.storage.fragmentation_ratio()
        );
        self.publish(InventoryEvent::InventoryUpdated { inventory: self.id });
        Ok(changed)
    }

    /// Removes every item.
    pub fn clear(&mut self) {
        self.storage.clear();
        self.items.clear();
        self.current_weight = 0.0;
        self.publish(InventoryEvent::InventoryUpdated { inventory: self.id });
    }

    // ------------------------------------------------------------------
    // Snapshots and bulk state
    // ------------------------------------------------------------------

    /// Captures items and weight.
    #[must_use]
    pub fn snapshot(&self) -> InventorySnapshot {
        InventorySnapshot::capture(&self.items, self.current_weight)
    }

    /// Replaces the contents with a snapshot.
    pub fn restore_snapshot(&mut self, snapshot: &InventorySnapshot) -> InventoryResult<()> {
        self.replace_all(snapshot.items.clone())
    }

    /// Replaces the contents with `items`, each placed at its own slot and rotation.
    ///
    /// Limits are not enforced: the list is trusted state. Items that cannot
    /// be placed are dropped and reported in the error.
    pub fn replace_all(&mut self, items: Vec<ItemInstance>) -> InventoryResult<()> {
        self.storage.clear();
        self.items.clear();

        let mut failed = Vec::new();
        for item in items {
            let Some(slot) = item.slot_index else {
                failed.push(item.to_string());
                continue;
            };
            let label = item.to_string();
            if let Err(e) = self.insert_instance(item, Some(slot), false) {
                failed.push(format!("{label}: {e}"));
            }
        }
        self.recalculate_weight();
        self.publish(InventoryEvent::InventoryUpdated { inventory: self.id });

        if failed.is_empty() {
            Ok(())
        } else {
            Err(InventoryError::RestoreFailed(failed.join("; ")))
        }
    }

    /// Applies server state for one instance: inserts it or updates it in place.
    pub fn upsert_replicated(&mut self, instance: ItemInstance) -> InventoryResult<()> {
        let Some(index) = self.index_of(instance.instance_id) else {
            let slot = instance.slot_index;
            self.insert_instance(instance, slot, false)?;
            return Ok(());
        };

        let target = instance
            .slot_index
            .ok_or_else(|| InventoryError::InvalidItem(format!("{instance} has no slot")))?;
        let current = &self.items[index];
        if current.slot_index != Some(target)
            || current.rotation.is_transposed() != instance.rotation.is_transposed()
        {
            let size = self.profile(&instance.item_id)?.size;
            if !self.storage.move_item(
                instance.instance_id,
                size,
                target,
                instance.rotation.is_transposed(),
            ) {
                return Err(InventoryError::SlotOccupied(target));
            }
        }

        let item = &mut self.items[index];
        item.quantity = instance.quantity;
        item.rotation = instance.rotation;
        item.weapon_state = instance.weapon_state;
        item.properties = instance.properties;
        self.set_placement(index, target);
        self.recalculate_weight();
        Ok(())
    }

    /// Persisted shape of this inventory.
    #[must_use]
    pub fn to_save_data(&self) -> InventorySaveData {
        InventorySaveData::new(
            self.storage.width(),
            self.storage.height(),
            self.max_weight,
            self.items.clone(),
        )
    }

    /// Rebuilds this inventory from persisted data.
    pub fn load_save_data(&mut self, save: &InventorySaveData) -> InventoryResult<()> {
        self.initialize(save.grid_width, save.grid_height, save.max_weight);
        self.replace_all(save.items.clone())
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Cross-checks items, grid cells and weight. Empty when consistent.
    #[must_use]
    pub fn validate_integrity(&self) -> Vec<String> {
        let mut problems = self.storage.validate_integrity();

        for item in &self.items {
            let anchor = self.storage.anchor_of_instance(item.instance_id);
            if anchor.is_none() || anchor != item.slot_index {
                problems.push(format!(
                    "{item} records slot {:?} but grid anchor is {anchor:?}",
                    item.slot_index
                ));
            }
            if let Some(size) = self.item_size(&item.item_id) {
                let cells = self.storage.occupied_slots(item.instance_id).len();
                let expected = item.rotation.apply(size).area() as usize;
                if cells != expected {
                    problems.push(format!("{item} covers {cells} cells, expected {expected}"));
                }
            }
        }

        for slot in self.storage.slots() {
            if let Some(id) = slot.instance_id {
                if slot.is_anchor && !self.contains(id) {
                    problems.push(format!("Grid holds orphaned instance {}", id.short()));
                }
            }
        }

        let expected_weight = self.compute_weight();
        if (expected_weight - self.current_weight).abs() > 0.001 {
            problems.push(format!(
                "Cached weight {:.3} differs from computed {:.3}",
                self.current_weight, expected_weight
            ));
        }
        problems
    }

    /// Multi-line summary for logs and the debug console.
    #[must_use]
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {}x{} items={} weight={:.2}/{:.2} free={} frag={:.2}",
            self.id,
            self.storage.width(),
            self.storage.height(),
            self.items.len(),
            self.current_weight,
            self.max_weight,
            self.storage.free_slot_count(),
            self.storage.fragmentation_ratio()
        );
        for item in &self.items {
            let _ = writeln!(out, "  {item}");
        }
        out
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn index_of(&self, instance_id: InstanceId) -> Option<usize> {
        self.items.iter().position(|i| i.instance_id == instance_id)
    }

    fn occupant(&self, slot: usize) -> InventoryResult<InstanceId> {
        if !self.storage.is_valid_slot(slot) {
            return Err(InventoryError::InvalidSlot(slot));
        }
        self.storage
            .instance_at_slot(slot)
            .ok_or(InventoryError::SlotEmpty(slot))
    }

    fn profile(&self, item_id: &ItemId) -> InventoryResult<ItemProfile> {
        self.item_data
            .item_data(item_id)
            .map(|d| ItemProfile {
                size: d.grid_size,
                unit_weight: d.weight,
                max_stack: d.max_stack.max(1),
            })
            .ok_or_else(|| InventoryError::UnknownItem(item_id.clone()))
    }

    fn check_weight(&self, adding: f32) -> InventoryResult<()> {
        if self.max_weight > 0.0 && self.current_weight + adding > self.max_weight + 1e-4 {
            return Err(InventoryError::WeightLimitExceeded {
                current: self.current_weight,
                adding,
                max: self.max_weight,
            });
        }
        Ok(())
    }

    fn compute_weight(&self) -> f32 {
        self.items
            .iter()
            .map(|i| {
                self.item_data
                    .item_data(&i.item_id)
                    .map_or(0.0, |d| d.weight * i.quantity as f32)
            })
            .sum()
    }

    fn recalculate_weight(&mut self) {
        self.current_weight = self.compute_weight();
    }

    fn set_placement(&mut self, index: usize, slot: usize) {
        let pos = self.storage.slot_to_coords(slot);
        let item = &mut self.items[index];
        item.slot_index = Some(slot);
        item.grid_position = pos;
    }

    /// Places and stores an instance, returning its index.
    fn insert_instance(
        &mut self,
        mut instance: ItemInstance,
        slot: Option<usize>,
        enforce_limits: bool,
    ) -> InventoryResult<usize> {
        if !instance.is_valid() {
            return Err(InventoryError::InvalidItem(instance.to_string()));
        }
        if self.contains(instance.instance_id) {
            return Err(InventoryError::DuplicateInstance(instance.instance_id));
        }
        let profile = self.profile(&instance.item_id)?;
        if enforce_limits {
            if instance.quantity > profile.max_stack {
                return Err(InventoryError::StackLimitExceeded {
                    item_id: instance.item_id,
                    max_stack: profile.max_stack,
                });
            }
            self.check_weight(profile.unit_weight * instance.quantity as f32)?;
        }

        let anchor = match slot {
            Some(slot) => {
                if !self.storage.is_valid_slot(slot) {
                    return Err(InventoryError::InvalidSlot(slot));
                }
                if !self.storage.place_item(
                    instance.instance_id,
                    profile.size,
                    slot,
                    instance.rotation.is_transposed(),
                ) {
                    return Err(InventoryError::SlotOccupied(slot));
                }
                slot
            }
            None => {
                let Some((slot, rotated)) =
                    self.storage.find_free_slot(profile.size, self.auto_rotate)
                else {
                    return Err(InventoryError::InsufficientSpace(instance.item_id));
                };
                if rotated != instance.rotation.is_transposed() {
                    instance.rotation = if rotated { Rotation::Deg90 } else { Rotation::Deg0 };
                }
                if !self
                    .storage
                    .place_item(instance.instance_id, profile.size, slot, rotated)
                {
                    return Err(InventoryError::InsufficientSpace(instance.item_id));
                }
                slot
            }
        };

        instance.clear_placement();
        self.items.push(instance);
        let index = self.items.len() - 1;
        self.set_placement(index, anchor);
        self.recalculate_weight();
        Ok(index)
    }

    fn restore_layout(&mut self, layout: &[(Option<usize>, Rotation)]) -> InventoryResult<()> {
        self.storage.clear();
        for (index, &(slot, rotation)) in layout.iter().enumerate() {
            let item = &self.items[index];
            let size = self.profile(&item.item_id)?.size;
            if let Some(slot) = slot {
                self.storage
                    .place_item(item.instance_id, size, slot, rotation.is_transposed());
            }
            self.items[index].rotation = rotation;
        }
        Ok(())
    }

    fn publish(&self, event: InventoryEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}
