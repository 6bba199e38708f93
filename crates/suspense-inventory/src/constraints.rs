//! Rule-based validation of inventory operations.
//!
//! Validation never mutates anything and never fails with an error: every
//! problem becomes a [`ConstraintViolation`] inside a [`ValidationResult`] so
//! callers can show all reasons at once. Checks run in a fixed order:
//! reference checks (short-circuit), item type, target slot, weight,
//! quantity caps, then custom validators.

use std::fmt;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use suspense_common::{ActorId, GridSize, InstanceId, InventoryId, ItemId, Rotation, TagSet};
use tracing::{debug, trace};

use crate::component::InventoryComponent;
use crate::item::ItemInstance;
use crate::item_data::{ItemData, ItemDataProvider};
use crate::registry::InventoryRegistry;

/// Overall outcome of a validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConstraintResult {
    /// No violations
    #[default]
    Allowed,
    /// At least one blocking violation
    Denied,
    /// Only advisory (severity 0) violations
    Conditional,
}

/// Reason an operation was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    /// Inventory handle does not resolve
    NullInventory,
    /// Item is malformed or missing
    InvalidItem,
    /// Item type is on the block list
    BlockedItemType,
    /// Item type is not on the allow list
    ItemTypeNotAllowed,
    /// Item lacks tags required on add
    MissingRequiredTags,
    /// Target slot is locked
    SlotLocked,
    /// Slot does not accept this item type
    SlotTypeRestriction,
    /// Footprint exceeds the slot's limit
    ItemTooLarge,
    /// Slot outside the grid
    InvalidSlot,
    /// Target cells are taken
    SlotOccupied,
    /// Weight limit would be exceeded
    WeightExceeded,
    /// Too many distinct item types
    MaxUniqueItemsReached,
    /// Total quantity cap would be exceeded
    MaxQuantityExceeded,
    /// Fewer units owned than requested
    InsufficientQuantity,
    /// Rules forbid stacking
    StackingDisabled,
    /// Rules forbid rotation
    RotationDisabled,
    /// Rules forbid dropping
    DropDisabled,
    /// Raised by a custom validator
    Custom(String),
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(name) => write!(f, "Custom({name})"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// One reason an operation cannot (or should not) proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    /// Machine-readable reason
    pub kind: ViolationKind,
    /// Human-readable explanation
    pub message: String,
    /// 0 = advisory, anything higher blocks the operation
    pub severity: u8,
}

impl ConstraintViolation {
    /// Creates a blocking violation.
    #[must_use]
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            severity: 1,
        }
    }

    /// Sets the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = severity;
        self
    }
}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of validating one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Overall verdict
    pub result: ConstraintResult,
    /// Every violation found
    pub violations: Vec<ConstraintViolation>,
    /// Whether the operation may go ahead
    pub can_proceed: bool,
    /// Alternative anchor when the target was occupied
    pub suggested_slot: Option<usize>,
    /// Largest quantity that would pass weight and quantity caps
    pub max_allowed_quantity: Option<u32>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::allowed()
    }
}

impl ValidationResult {
    /// A result with no violations.
    #[must_use]
    pub fn allowed() -> Self {
        Self {
            result: ConstraintResult::Allowed,
            violations: Vec::new(),
            can_proceed: true,
            suggested_slot: None,
            max_allowed_quantity: None,
        }
    }

    /// Records a violation and updates the verdict.
    pub fn push(&mut self, violation: ConstraintViolation) {
        if violation.severity > 0 {
            self.result = ConstraintResult::Denied;
            self.can_proceed = false;
        } else if self.result == ConstraintResult::Allowed {
            self.result = ConstraintResult::Conditional;
        }
        self.violations.push(violation);
    }

    /// Records a blocking violation.
    pub fn deny(&mut self, kind: ViolationKind, message: impl Into<String>) {
        self.push(ConstraintViolation::new(kind, message));
    }

    /// Checks if the operation may go ahead.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.can_proceed
    }

    /// Checks if a violation of `kind` was recorded.
    #[must_use]
    pub fn has_violation(&self, kind: &ViolationKind) -> bool {
        self.violations.iter().any(|v| &v.kind == kind)
    }

    fn cap_quantity(&mut self, quantity: u32) {
        self.max_allowed_quantity = Some(
            self.max_allowed_quantity
                .map_or(quantity, |current| current.min(quantity)),
        );
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.violations.is_empty() {
            return write!(f, "{:?}", self.result);
        }
        let messages: Vec<String> = self.violations.iter().map(ToString::to_string).collect();
        write!(f, "{:?} [{}]", self.result, messages.join("; "))
    }
}

/// Restrictions attached to one slot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotConstraint {
    /// Slot the constraint applies to
    pub slot_index: usize,
    /// Accepted item types (empty = all)
    pub allowed_types: TagSet,
    /// Rejected item types
    pub blocked_types: TagSet,
    /// Largest footprint accepted
    pub max_item_size: Option<GridSize>,
    /// Slot rejects every item
    pub is_locked: bool,
    /// Name for custom validators to key on
    pub custom_constraint_id: Option<String>,
}

impl SlotConstraint {
    /// Creates an unrestricted constraint for `slot_index`.
    #[must_use]
    pub fn new(slot_index: usize) -> Self {
        Self {
            slot_index,
            ..Self::default()
        }
    }

    /// Checks an item's tags against the allow and block lists.
    #[must_use]
    pub fn allows_item_type(&self, tags: &TagSet) -> bool {
        if tags.has_any(&self.blocked_types) {
            return false;
        }
        self.allowed_types.is_empty() || tags.has_any(&self.allowed_types)
    }
}

/// Rule set bound to one inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryRules {
    /// Accepted item types (empty = all)
    pub allowed_item_types: TagSet,
    /// Rejected item types, checked before the allow list
    pub blocked_item_types: TagSet,
    /// Per-slot restrictions
    pub slot_constraints: Vec<SlotConstraint>,
    /// Whether stacks may be merged
    pub allow_stacking: bool,
    /// Whether items may be rotated
    pub allow_rotation: bool,
    /// Whether items may be dropped
    pub allow_drop: bool,
    /// Cap on distinct item types (0 = unlimited)
    pub max_unique_items: u32,
    /// Cap on total units (0 = unlimited)
    pub max_total_quantity: u32,
    /// Tags an item must carry to be added
    pub required_tags_for_add: TagSet,
}

impl Default for InventoryRules {
    fn default() -> Self {
        Self {
            allowed_item_types: TagSet::new(),
            blocked_item_types: TagSet::new(),
            slot_constraints: Vec::new(),
            allow_stacking: true,
            allow_rotation: true,
            allow_drop: true,
            max_unique_items: 0,
            max_total_quantity: 0,
            required_tags_for_add: TagSet::new(),
        }
    }
}

impl InventoryRules {
    /// Constraint for a slot, if any.
    #[must_use]
    pub fn slot_constraint(&self, slot: usize) -> Option<&SlotConstraint> {
        self.slot_constraints.iter().find(|c| c.slot_index == slot)
    }

    /// Adds or replaces a slot constraint.
    #[must_use]
    pub fn with_slot_constraint(mut self, constraint: SlotConstraint) -> Self {
        self.slot_constraints
            .retain(|c| c.slot_index != constraint.slot_index);
        self.slot_constraints.push(constraint);
        self
    }

    /// Sets the distinct item type cap.
    #[must_use]
    pub fn with_max_unique_items(mut self, max: u32) -> Self {
        self.max_unique_items = max;
        self
    }

    /// Sets the total quantity cap.
    #[must_use]
    pub fn with_max_total_quantity(mut self, max: u32) -> Self {
        self.max_total_quantity = max;
        self
    }

    /// Weapons only, no stacking.
    #[must_use]
    pub fn weapons_only() -> Self {
        Self {
            allowed_item_types: TagSet::new().with("Item.Type.Weapon"),
            allow_stacking: false,
            ..Self::default()
        }
    }

    /// Armor only, no stacking.
    #[must_use]
    pub fn armor_only() -> Self {
        Self {
            allowed_item_types: TagSet::new().with("Item.Type.Armor"),
            allow_stacking: false,
            ..Self::default()
        }
    }

    /// Consumables only, stackable, fixed orientation.
    #[must_use]
    pub fn consumables_only() -> Self {
        Self {
            allowed_item_types: TagSet::new().with("Item.Type.Consumable"),
            allow_rotation: false,
            ..Self::default()
        }
    }

    /// Quest items: fixed orientation, cannot be dropped.
    #[must_use]
    pub fn quest_items() -> Self {
        Self {
            allowed_item_types: TagSet::new().with("Item.Type.Quest"),
            allow_rotation: false,
            allow_drop: false,
            ..Self::default()
        }
    }

    /// Storage containers accept anything but items cannot be dropped from them.
    #[must_use]
    pub fn storage() -> Self {
        Self {
            allow_drop: false,
            ..Self::default()
        }
    }
}

/// Operation kinds understood by validation and authority checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidatedOperation {
    /// Add an item
    Add,
    /// Remove an item
    Remove,
    /// Move within the grid
    Move,
    /// Exchange two items
    Swap,
    /// Rotate in place
    Rotate,
    /// Merge stacks
    Stack,
    /// Move to another inventory
    Transfer,
    /// Drop out of the inventory
    Drop,
}

/// Everything a validator needs to know about an operation.
#[derive(Debug, Clone)]
pub struct ConstraintContext {
    /// Operation being validated
    pub operation: ValidatedOperation,
    /// Inventory the item is in (or is being added to)
    pub source: InventoryId,
    /// Destination inventory for transfers
    pub target: Option<InventoryId>,
    /// Item involved
    pub item: ItemInstance,
    /// Second item (stack target, swap partner)
    pub secondary: Option<InstanceId>,
    /// Target anchor, if any
    pub target_slot: Option<usize>,
    /// Units involved
    pub quantity: u32,
    /// Who is asking
    pub actor: ActorId,
}

impl ConstraintContext {
    /// Creates a context for `operation` on `item` in `source`.
    #[must_use]
    pub fn new(operation: ValidatedOperation, source: InventoryId, item: ItemInstance) -> Self {
        let quantity = item.quantity;
        Self {
            operation,
            source,
            target: None,
            item,
            secondary: None,
            target_slot: None,
            quantity,
            actor: ActorId::SERVER,
        }
    }

    /// Sets the destination inventory.
    #[must_use]
    pub fn with_target(mut self, target: InventoryId) -> Self {
        self.target = Some(target);
        self
    }

    /// Sets the target anchor.
    #[must_use]
    pub fn with_slot(mut self, slot: Option<usize>) -> Self {
        self.target_slot = slot;
        self
    }

    /// Sets the quantity.
    #[must_use]
    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    /// Sets the second item.
    #[must_use]
    pub fn with_secondary(mut self, secondary: InstanceId) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Sets the requesting actor.
    #[must_use]
    pub fn with_actor(mut self, actor: ActorId) -> Self {
        self.actor = actor;
        self
    }
}

/// Extra validation run after the built-in checks.
pub trait CustomValidator: Send + Sync {
    /// Returns violations for this operation, if any.
    fn validate(
        &self,
        context: &ConstraintContext,
        inventory: &InventoryComponent,
    ) -> Vec<ConstraintViolation>;
}

impl<F> CustomValidator for F
where
    F: Fn(&ConstraintContext, &InventoryComponent) -> Vec<ConstraintViolation> + Send + Sync,
{
    fn validate(
        &self,
        context: &ConstraintContext,
        inventory: &InventoryComponent,
    ) -> Vec<ConstraintViolation> {
        self(context, inventory)
    }
}

/// Validation engine holding the rules of every inventory.
pub struct InventoryConstraints {
    rules: AHashMap<InventoryId, InventoryRules>,
    locked_slots: AHashMap<InventoryId, AHashSet<usize>>,
    validators: Vec<Box<dyn CustomValidator>>,
    item_data: Arc<dyn ItemDataProvider>,
}

impl fmt::Debug for InventoryConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InventoryConstraints")
            .field("rules", &self.rules.len())
            .field("locked_slots", &self.locked_slots)
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl InventoryConstraints {
    /// Creates an engine with no rules.
    #[must_use]
    pub fn new(item_data: Arc<dyn ItemDataProvider>) -> Self {
        Self {
            rules: AHashMap::new(),
            locked_slots: AHashMap::new(),
            validators: Vec::new(),
            item_data,
        }
    }

    // ------------------------------------------------------------------
    // Rule management
    // ------------------------------------------------------------------

    /// Binds a rule set to an inventory.
    pub fn set_rules(&mut self, inventory: InventoryId, rules: InventoryRules) {
        self.rules.insert(inventory, rules);
    }

    /// Rule set bound to an inventory, if any.
    #[must_use]
    pub fn rules(&self, inventory: InventoryId) -> Option<&InventoryRules> {
        self.rules.get(&inventory)
    }

    /// Removes an inventory's rule set.
    pub fn clear_rules(&mut self, inventory: InventoryId) {
        self.rules.remove(&inventory);
    }

    /// Forgets everything about an inventory.
    pub fn remove_inventory(&mut self, inventory: InventoryId) {
        self.rules.remove(&inventory);
        self.locked_slots.remove(&inventory);
    }

    /// Locks a slot at runtime.
    pub fn lock_slot(&mut self, inventory: InventoryId, slot: usize) {
        self.locked_slots.entry(inventory).or_default().insert(slot);
    }

    /// Releases a runtime lock.
    pub fn unlock_slot(&mut self, inventory: InventoryId, slot: usize) {
        if let Some(locked) = self.locked_slots.get_mut(&inventory) {
            locked.remove(&slot);
        }
    }

    /// Checks runtime locks and rule-defined locks.
    #[must_use]
    pub fn is_slot_locked(&self, inventory: InventoryId, slot: usize) -> bool {
        self.locked_slots
            .get(&inventory)
            .is_some_and(|locked| locked.contains(&slot))
            || self
                .rules
                .get(&inventory)
                .and_then(|r| r.slot_constraint(slot))
                .is_some_and(|c| c.is_locked)
    }

    /// Registers a validator that runs after the built-in checks.
    pub fn add_validator(&mut self, validator: impl CustomValidator + 'static) {
        self.validators.push(Box::new(validator));
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Validates adding `item`, optionally at `target_slot`.
    #[must_use]
    pub fn validate_add_item(
        &self,
        registry: &InventoryRegistry,
        inventory: InventoryId,
        item: &ItemInstance,
        target_slot: Option<usize>,
    ) -> ValidationResult {
        let context = ConstraintContext::new(ValidatedOperation::Add, inventory, item.clone())
            .with_slot(target_slot);
        self.validate_operation(registry, &context)
    }

    /// Validates removing `quantity` units of an instance.
    #[must_use]
    pub fn validate_remove_item(
        &self,
        registry: &InventoryRegistry,
        inventory: InventoryId,
        instance_id: InstanceId,
        quantity: u32,
    ) -> ValidationResult {
        self.validate_existing(registry, inventory, instance_id, |item| {
            ConstraintContext::new(ValidatedOperation::Remove, inventory, item)
                .with_quantity(quantity)
        })
    }

    /// Validates moving an instance so its anchor lands on `target_slot`.
    #[must_use]
    pub fn validate_move_item(
        &self,
        registry: &InventoryRegistry,
        inventory: InventoryId,
        instance_id: InstanceId,
        target_slot: usize,
    ) -> ValidationResult {
        self.validate_existing(registry, inventory, instance_id, |item| {
            ConstraintContext::new(ValidatedOperation::Move, inventory, item)
                .with_slot(Some(target_slot))
        })
    }

    /// Validates swapping an instance with whatever occupies `target_slot`.
    #[must_use]
    pub fn validate_swap_items(
        &self,
        registry: &InventoryRegistry,
        inventory: InventoryId,
        instance_id: InstanceId,
        target_slot: usize,
    ) -> ValidationResult {
        self.validate_existing(registry, inventory, instance_id, |item| {
            ConstraintContext::new(ValidatedOperation::Swap, inventory, item)
                .with_slot(Some(target_slot))
        })
    }

    /// Validates rotating an instance in place.
    #[must_use]
    pub fn validate_rotate_item(
        &self,
        registry: &InventoryRegistry,
        inventory: InventoryId,
        instance_id: InstanceId,
    ) -> ValidationResult {
        self.validate_existing(registry, inventory, instance_id, |item| {
            ConstraintContext::new(ValidatedOperation::Rotate, inventory, item)
        })
    }

    /// Validates merging `source` into `target`.
    #[must_use]
    pub fn validate_stack(
        &self,
        registry: &InventoryRegistry,
        inventory: InventoryId,
        source: InstanceId,
        target: InstanceId,
    ) -> ValidationResult {
        self.validate_existing(registry, inventory, source, |item| {
            ConstraintContext::new(ValidatedOperation::Stack, inventory, item)
                .with_secondary(target)
        })
    }

    /// Validates dropping an instance out of the inventory.
    #[must_use]
    pub fn validate_drop(
        &self,
        registry: &InventoryRegistry,
        inventory: InventoryId,
        instance_id: InstanceId,
    ) -> ValidationResult {
        self.validate_existing(registry, inventory, instance_id, |item| {
            ConstraintContext::new(ValidatedOperation::Drop, inventory, item)
        })
    }

    /// Validates moving an instance from `source` into `target`.
    #[must_use]
    pub fn validate_transfer(
        &self,
        registry: &InventoryRegistry,
        source: InventoryId,
        target: InventoryId,
        instance_id: InstanceId,
        target_slot: Option<usize>,
    ) -> ValidationResult {
        self.validate_existing(registry, source, instance_id, |item| {
            ConstraintContext::new(ValidatedOperation::Transfer, source, item)
                .with_target(target)
                .with_slot(target_slot)
        })
    }

    /// Runs every check that applies to `context.operation`.
    #[must_use]
    pub fn validate_operation(
        &self,
        registry: &InventoryRegistry,
        context: &ConstraintContext,
    ) -> ValidationResult {
        let mut result = ValidationResult::allowed();

        let Some(inventory) = registry.get(context.source) else {
            result.deny(
                ViolationKind::NullInventory,
                format!("{} does not exist", context.source),
            );
            return result;
        };
        if !context.item.is_valid() {
            result.deny(
                ViolationKind::InvalidItem,
                format!("Item {} is invalid", context.item),
            );
            return result;
        }

        let data = self.item_data.item_data(&context.item.item_id);
        if data.is_none() {
            debug!(
                "No item data for {}, skipping type, weight and size checks",
                context.item.item_id
            );
        }
        let fallback = InventoryRules::default();
        let rules = self.rules.get(&context.source).unwrap_or(&fallback);

        match context.operation {
            ValidatedOperation::Add => {
                self.check_add(inventory, rules, context, data, &mut result);
            }
            ValidatedOperation::Remove => {
                self.check_owned(inventory, context, &mut result);
                self.check_source_unlocked(inventory, context, &mut result);
            }
            ValidatedOperation::Move => {
                self.check_owned(inventory, context, &mut result);
                match context.target_slot {
                    Some(slot) => self.check_slot(
                        inventory,
                        rules,
                        slot,
                        &context.item,
                        data,
                        Some(context.item.instance_id),
                        &mut result,
                    ),
                    None => result.deny(ViolationKind::InvalidSlot, "Move needs a target slot"),
                }
            }
            ValidatedOperation::Swap => {
                self.check_owned(inventory, context, &mut result);
                self.check_source_unlocked(inventory, context, &mut result);
                match context.target_slot {
                    Some(slot) if !inventory.storage().is_valid_slot(slot) => {
                        result.deny(
                            ViolationKind::InvalidSlot,
                            format!("Slot {slot} is outside the grid"),
                        );
                    }
                    Some(slot) if self.is_slot_locked(inventory.id(), slot) => {
                        result.deny(ViolationKind::SlotLocked, format!("Slot {slot} is locked"));
                    }
                    Some(_) => {}
                    None => result.deny(ViolationKind::InvalidSlot, "Swap needs a target slot"),
                }
            }
            ValidatedOperation::Rotate => {
                if !rules.allow_rotation {
                    result.deny(ViolationKind::RotationDisabled, "Rotation is not allowed");
                }
                self.check_rotation_fit(inventory, context, data, &mut result);
            }
            ValidatedOperation::Stack => {
                if !rules.allow_stacking {
                    result.deny(ViolationKind::StackingDisabled, "Stacking is not allowed");
                }
                self.check_owned(inventory, context, &mut result);
                let target = context.secondary.and_then(|id| inventory.item(id));
                match target {
                    Some(target) if !context.item.can_stack_with(target) => {
                        result.deny(ViolationKind::InvalidItem, "Items cannot be stacked together");
                    }
                    Some(_) => {}
                    None => result.deny(ViolationKind::InvalidItem, "Stack target not found"),
                }
            }
            ValidatedOperation::Drop => {
                if !rules.allow_drop {
                    result.deny(ViolationKind::DropDisabled, "Dropping is not allowed");
                }
                self.check_owned(inventory, context, &mut result);
                self.check_source_unlocked(inventory, context, &mut result);
            }
            ValidatedOperation::Transfer => {
                self.check_owned(inventory, context, &mut result);
                self.check_source_unlocked(inventory, context, &mut result);
                match context.target.and_then(|id| registry.get(id).map(|inv| (id, inv))) {
                    Some((target_id, target)) => {
                        let target_rules = self.rules.get(&target_id).unwrap_or(&fallback);
                        self.check_add(target, target_rules, context, data, &mut result);
                    }
                    None => {
                        result.deny(ViolationKind::NullInventory, "Transfer target does not exist");
                    }
                }
            }
        }

        for validator in &self.validators {
            for violation in validator.validate(context, inventory) {
                result.push(violation);
            }
        }

        trace!("{:?} {} -> {}", context.operation, context.item, result);
        result
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Checks an item type against an inventory's allow and block lists.
    ///
    /// Unknown item types are accepted.
    #[must_use]
    pub fn can_accept_item_type(&self, inventory: InventoryId, item_id: &ItemId) -> bool {
        let (Some(rules), Some(data)) =
            (self.rules.get(&inventory), self.item_data.item_data(item_id))
        else {
            return true;
        };
        type_allowed(rules, &data.tags)
    }

    /// Checks locks, slot type restrictions and slot size limits for `item` at `slot`.
    #[must_use]
    pub fn can_slot_accept_item(
        &self,
        inventory: InventoryId,
        slot: usize,
        item: &ItemInstance,
    ) -> bool {
        if self.is_slot_locked(inventory, slot) {
            return false;
        }
        let Some(constraint) = self
            .rules
            .get(&inventory)
            .and_then(|r| r.slot_constraint(slot))
        else {
            return true;
        };
        let Some(data) = self.item_data.item_data(&item.item_id) else {
            return true;
        };
        constraint.allows_item_type(&data.tags)
            && constraint
                .max_item_size
                .map_or(true, |max| item.rotation.apply(data.grid_size).fits_within(max))
    }

    /// First anchor where `item` fits and whose slot constraints accept it.
    #[must_use]
    pub fn find_best_slot(
        &self,
        inventory: &InventoryComponent,
        item: &ItemInstance,
    ) -> Option<usize> {
        self.find_best_placement(inventory, item).map(|(slot, _)| slot)
    }

    /// Like [`find_best_slot`](Self::find_best_slot), falling back to the
    /// turned orientation of a non-square item when the rules allow rotation.
    #[must_use]
    pub fn find_best_placement(
        &self,
        inventory: &InventoryComponent,
        item: &ItemInstance,
    ) -> Option<(usize, Rotation)> {
        let size = self
            .item_data
            .item_data(&item.item_id)
            .map_or(GridSize::ONE, |d| d.grid_size);
        let allow_rotation = self
            .rules(inventory.id())
            .map_or(true, |rules| rules.allow_rotation);

        let mut orientations = vec![item.rotation];
        if allow_rotation && !size.is_square() {
            orientations.push(item.rotation.next());
        }
        orientations.into_iter().find_map(|rotation| {
            let mut candidate = item.clone();
            candidate.rotation = rotation;
            self.first_fitting_slot(inventory, size, &candidate)
                .map(|slot| (slot, rotation))
        })
    }

    fn first_fitting_slot(
        &self,
        inventory: &InventoryComponent,
        size: GridSize,
        item: &ItemInstance,
    ) -> Option<usize> {
        let storage = inventory.storage();
        (0..storage.slot_count()).find(|&slot| {
            storage.can_place_item(
                size,
                slot,
                item.rotation.is_transposed(),
                Some(item.instance_id),
            ) && self.can_slot_accept_item(inventory.id(), slot, item)
        })
    }

    /// Largest quantity of `item_id` that weight, quantity caps and the stack limit allow.
    #[must_use]
    pub fn max_addable_quantity(&self, inventory: &InventoryComponent, item_id: &ItemId) -> u32 {
        let Some(data) = self.item_data.item_data(item_id) else {
            return u32::MAX;
        };
        let mut max = data.max_stack.max(1);
        if let Some(by_weight) = weight_bound(inventory, data) {
            max = max.min(by_weight);
        }
        if let Some(rules) = self.rules.get(&inventory.id()) {
            if rules.max_total_quantity > 0 {
                max = max.min(rules.max_total_quantity.saturating_sub(inventory.total_quantity()));
            }
        }
        max
    }

    // ------------------------------------------------------------------
    // Individual checks
    // ------------------------------------------------------------------

    fn validate_existing(
        &self,
        registry: &InventoryRegistry,
        inventory: InventoryId,
        instance_id: InstanceId,
        build: impl FnOnce(ItemInstance) -> ConstraintContext,
    ) -> ValidationResult {
        let Some(component) = registry.get(inventory) else {
            let mut result = ValidationResult::allowed();
            result.deny(ViolationKind::NullInventory, format!("{inventory} does not exist"));
            return result;
        };
        let Some(item) = component.item(instance_id).cloned() else {
            let mut result = ValidationResult::allowed();
            result.deny(
                ViolationKind::InvalidItem,
                format!("Item {} is not in {inventory}", instance_id.short()),
            );
            return result;
        };
        self.validate_operation(registry, &build(item))
    }

    fn check_add(
        &self,
        inventory: &InventoryComponent,
        rules: &InventoryRules,
        context: &ConstraintContext,
        data: Option<&ItemData>,
        result: &mut ValidationResult,
    ) {
        if let Some(data) = data {
            if data.tags.has_any(&rules.blocked_item_types) {
                result.deny(
                    ViolationKind::BlockedItemType,
                    format!("Item type {} is blocked", data.item_id),
                );
            } else if !rules.allowed_item_types.is_empty()
                && !data.tags.has_any(&rules.allowed_item_types)
            {
                result.deny(
                    ViolationKind::ItemTypeNotAllowed,
                    format!("Item type {} is not allowed", data.item_id),
                );
            }
            if !data.tags.has_all(&rules.required_tags_for_add) {
                result.deny(
                    ViolationKind::MissingRequiredTags,
                    format!("Item needs tags {}", rules.required_tags_for_add),
                );
            }
        }

        if let Some(slot) = context.target_slot {
            self.check_slot(inventory, rules, slot, &context.item, data, None, result);
        }

        if let Some(data) = data {
            self.check_weight(inventory, context.quantity, data, result);
        }
        check_caps(inventory, rules, &context.item.item_id, context.quantity, result);
    }

    #[allow(clippy::too_many_arguments)]
    fn check_slot(
        &self,
        inventory: &InventoryComponent,
        rules: &InventoryRules,
        slot: usize,
        item: &ItemInstance,
        data: Option<&ItemData>,
        ignore: Option<InstanceId>,
        result: &mut ValidationResult,
    ) {
        let storage = inventory.storage();
        if !storage.is_valid_slot(slot) {
            result.deny(ViolationKind::InvalidSlot, format!("Slot {slot} is outside the grid"));
            return;
        }
        if self.is_slot_locked(inventory.id(), slot) {
            result.deny(ViolationKind::SlotLocked, format!("Slot {slot} is locked"));
        }

        let Some(data) = data else {
            return;
        };
        let footprint = item.rotation.apply(data.grid_size);
        if let Some(constraint) = rules.slot_constraint(slot) {
            if !constraint.allows_item_type(&data.tags) {
                result.deny(
                    ViolationKind::SlotTypeRestriction,
                    format!("Slot {slot} does not accept {}", data.item_id),
                );
            }
            if let Some(max) = constraint.max_item_size {
                if !footprint.fits_within(max) {
                    result.deny(
                        ViolationKind::ItemTooLarge,
                        format!("Item {footprint} exceeds slot {slot} limit {max}"),
                    );
                }
            }
        }

        if !storage.can_place_item(data.grid_size, slot, item.rotation.is_transposed(), ignore) {
            result.deny(
                ViolationKind::SlotOccupied,
                format!("Item {footprint} does not fit at slot {slot}"),
            );
            result.suggested_slot = self.find_best_slot(inventory, item);
        }
    }

    fn check_weight(
        &self,
        inventory: &InventoryComponent,
        quantity: u32,
        data: &ItemData,
        result: &mut ValidationResult,
    ) {
        let max = inventory.max_weight();
        if max <= 0.0 {
            return;
        }
        let adding = data.weight * quantity as f32;
        if inventory.current_weight() + adding > max + 1e-4 {
            result.deny(
                ViolationKind::WeightExceeded,
                format!(
                    "{} x{} would weigh {:.2} of {:.2}",
                    data.item_id,
                    quantity,
                    inventory.current_weight() + adding,
                    max
                ),
            );
            if let Some(bound) = weight_bound(inventory, data) {
                result.cap_quantity(bound);
            }
        }
    }

    fn check_owned(
        &self,
        inventory: &InventoryComponent,
        context: &ConstraintContext,
        result: &mut ValidationResult,
    ) {
        let Some(owned) = inventory.item(context.item.instance_id) else {
            result.deny(
                ViolationKind::InvalidItem,
                format!("Item {} is not in {}", context.item.instance_id.short(), inventory.id()),
            );
            return;
        };
        let removing = context.operation == ValidatedOperation::Remove;
        if removing && context.quantity == 0 {
            result.deny(ViolationKind::InvalidItem, "Cannot remove zero units");
        } else if removing && context.quantity > owned.quantity {
            result.deny(
                ViolationKind::InsufficientQuantity,
                format!("Cannot remove {}, only {} owned", context.quantity, owned.quantity),
            );
        }
    }

    fn check_source_unlocked(
        &self,
        inventory: &InventoryComponent,
        context: &ConstraintContext,
        result: &mut ValidationResult,
    ) {
        if let Some(slot) = inventory
            .item(context.item.instance_id)
            .and_then(|i| i.slot_index)
        {
            if self.is_slot_locked(inventory.id(), slot) {
                result.deny(ViolationKind::SlotLocked, format!("Slot {slot} is locked"));
            }
        }
    }

    fn check_rotation_fit(
        &self,
        inventory: &InventoryComponent,
        context: &ConstraintContext,
        data: Option<&ItemData>,
        result: &mut ValidationResult,
    ) {
        let (Some(data), Some(anchor)) = (data, context.item.slot_index) else {
            return;
        };
        let rotated = context.item.rotation.next().is_transposed();
        if !inventory
            .storage()
            .can_place_item(data.grid_size, anchor, rotated, Some(context.item.instance_id))
        {
            result.deny(
                ViolationKind::SlotOccupied,
                format!("No room to rotate {} at slot {anchor}", data.item_id),
            );
        }
    }
}

fn type_allowed(rules: &InventoryRules, tags: &TagSet) -> bool {
    if tags.has_any(&rules.blocked_item_types) {
        return false;
    }
    rules.allowed_item_types.is_empty() || tags.has_any(&rules.allowed_item_types)
}

/// Units that still fit under the weight limit, `None` when unbounded.
fn weight_bound(inventory: &InventoryComponent, data: &ItemData) -> Option<u32> {
    let max = inventory.max_weight();
    if max <= 0.0 || data.weight <= 0.0 {
        return None;
    }
    let remaining = (max - inventory.current_weight()).max(0.0);
    Some((remaining / data.weight + 1e-4).floor() as u32)
}

fn check_caps(
    inventory: &InventoryComponent,
    rules: &InventoryRules,
    item_id: &ItemId,
    quantity: u32,
    result: &mut ValidationResult,
) {
    if rules.max_unique_items > 0 && inventory.item_count(item_id) == 0 {
        let unique = inventory.unique_item_count() as u32;
        if unique >= rules.max_unique_items {
            result.deny(
                ViolationKind::MaxUniqueItemsReached,
                format!("Maximum unique item types ({}) reached", rules.max_unique_items),
            );
        }
    }

    if rules.max_total_quantity > 0 {
        let current = inventory.total_quantity();
        let total = current.saturating_add(quantity);
        if total > rules.max_total_quantity {
            result.deny(
                ViolationKind::MaxQuantityExceeded,
                format!(
                    "Total quantity ({total}) would exceed limit ({})",
                    rules.max_total_quantity
                ),
            );
            result.cap_quantity(rules.max_total_quantity.saturating_sub(current));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{component, item_table};
    use suspense_common::Rotation;

    struct Fixture {
        registry: InventoryRegistry,
        inventory: InventoryId,
        constraints: InventoryConstraints,
    }

    fn fixture(width: i32, height: i32, max_weight: f32) -> Fixture {
        let mut registry = InventoryRegistry::new();
        let inventory =
            registry.insert(InventoryComponent::new(width, height, max_weight, item_table()));
        Fixture {
            registry,
            inventory,
            constraints: InventoryConstraints::new(item_table()),
        }
    }

    impl Fixture {
        fn add(&mut self, item_id: &str, quantity: u32) -> InstanceId {
            self.registry
                .get_mut(self.inventory)
                .expect("inventory")
                .add_item(&ItemId::new(item_id), quantity)
                .expect("add")
                .instance_id
        }

        fn validate_add(
            &self,
            item_id: &str,
            quantity: u32,
            slot: Option<usize>,
        ) -> ValidationResult {
            self.constraints.validate_add_item(
                &self.registry,
                self.inventory,
                &ItemInstance::new(item_id, quantity),
                slot,
            )
        }
    }

    #[test]
    fn test_max_unique_items() {
        let mut f = fixture(5, 5, 0.0);
        f.constraints
            .set_rules(f.inventory, InventoryRules::default().with_max_unique_items(2));
        f.add("medkit", 1);
        assert!(f.validate_add("pistol", 1, None).is_allowed());
        f.add("pistol", 1);

        // Another of an existing type is fine.
        assert!(f.validate_add("medkit", 1, None).is_allowed());

        let result = f.validate_add("keycard", 1, None);
        assert_eq!(result.result, ConstraintResult::Denied);
        assert!(result.has_violation(&ViolationKind::MaxUniqueItemsReached));
    }

    #[test]
    fn test_weight_partial_quantity() {
        let mut f = fixture(5, 5, 10.0);
        f.add("medkit", 3); // 6.0 of 10.0
        let result = f.validate_add("ammo_9mm", 20, None); // 0.5 each
        assert!(result.has_violation(&ViolationKind::WeightExceeded));
        assert_eq!(result.max_allowed_quantity, Some(8));
        assert!(f.validate_add("ammo_9mm", 8, None).is_allowed());

        assert_eq!(
            f.constraints.max_addable_quantity(
                f.registry.get(f.inventory).expect("inv"),
                &ItemId::new("ammo_9mm")
            ),
            8
        );
    }

    #[test]
    fn test_total_quantity_cap_combines_with_weight() {
        let mut f = fixture(5, 5, 10.0);
        f.constraints
            .set_rules(f.inventory, InventoryRules::default().with_max_total_quantity(10));
        f.add("ammo_9mm", 6); // 3.0 weight
        let result = f.validate_add("ammo_9mm", 20, None);
        assert!(result.has_violation(&ViolationKind::WeightExceeded));
        assert!(result.has_violation(&ViolationKind::MaxQuantityExceeded));
        assert_eq!(result.max_allowed_quantity, Some(4));
    }

    #[test]
    fn test_total_quantity_cap_saturates() {
        let mut f = fixture(5, 5, 0.0);
        f.constraints
            .set_rules(f.inventory, InventoryRules::default().with_max_total_quantity(100));
        f.add("ammo_9mm", 5);
        let result = f.validate_add("ammo_9mm", u32::MAX, None);
        assert!(result.has_violation(&ViolationKind::MaxQuantityExceeded));
        assert_eq!(result.max_allowed_quantity, Some(95));
    }

    #[test]
    fn test_blocked_wins_over_allowed() {
        let f = {
            let mut f = fixture(5, 5, 0.0);
            let mut rules = InventoryRules::weapons_only();
            rules.blocked_item_types.insert("Item.Type.Weapon.Rifle");
            f.constraints.set_rules(f.inventory, rules);
            f
        };
        assert!(f.validate_add("pistol", 1, None).is_allowed());
        assert!(f
            .validate_add("rifle", 1, None)
            .has_violation(&ViolationKind::BlockedItemType));
        assert!(f
            .validate_add("medkit", 1, None)
            .has_violation(&ViolationKind::ItemTypeNotAllowed));
        assert!(!f.constraints.can_accept_item_type(f.inventory, &ItemId::new("rifle")));
        assert!(f.constraints.can_accept_item_type(f.inventory, &ItemId::new("pistol")));
    }

    #[test]
    fn test_required_tags() {
        let mut f = fixture(5, 5, 0.0);
        let rules = InventoryRules {
            required_tags_for_add: TagSet::new().with("Item.Type.Consumable"),
            ..InventoryRules::default()
        };
        f.constraints.set_rules(f.inventory, rules);
        assert!(f.validate_add("medkit", 1, None).is_allowed());
        assert!(f
            .validate_add("pistol", 1, None)
            .has_violation(&ViolationKind::MissingRequiredTags));
    }

    #[test]
    fn test_slot_constraints_collect_all_violations() {
        let mut f = fixture(5, 5, 0.0);
        let mut slot = SlotConstraint::new(0);
        slot.allowed_types.insert("Item.Type.Ammo");
        slot.max_item_size = Some(GridSize::ONE);
        f.constraints
            .set_rules(f.inventory, InventoryRules::default().with_slot_constraint(slot));
        f.constraints.lock_slot(f.inventory, 0);

        let result = f.validate_add("vest", 1, Some(0));
        assert!(result.has_violation(&ViolationKind::SlotLocked));
        assert!(result.has_violation(&ViolationKind::SlotTypeRestriction));
        assert!(result.has_violation(&ViolationKind::ItemTooLarge));
        assert_eq!(result.violations.len(), 3);

        f.constraints.unlock_slot(f.inventory, 0);
        assert!(f.validate_add("ammo_9mm", 5, Some(0)).is_allowed());
    }

    #[test]
    fn test_occupied_target_suggests_slot() {
        let mut f = fixture(4, 4, 0.0);
        f.add("vest", 1); // slots 0,1,4,5
        let result = f.validate_add("medkit", 1, Some(5));
        assert!(result.has_violation(&ViolationKind::SlotOccupied));
        assert_eq!(result.suggested_slot, Some(2));

        assert!(f
            .validate_add("medkit", 1, Some(16))
            .has_violation(&ViolationKind::InvalidSlot));
    }

    #[test]
    fn test_move_ignores_own_cells() {
        let mut f = fixture(4, 4, 0.0);
        let vest = f.add("vest", 1);
        let result = f
            .constraints
            .validate_move_item(&f.registry, f.inventory, vest, 1);
        assert!(result.is_allowed(), "{result}");
        let result = f
            .constraints
            .validate_move_item(&f.registry, f.inventory, vest, 3);
        assert!(result.has_violation(&ViolationKind::SlotOccupied));
    }

    #[test]
    fn test_remove_checks() {
        let mut f = fixture(4, 4, 0.0);
        let ammo = f.add("ammo_9mm", 10);
        assert!(f
            .constraints
            .validate_remove_item(&f.registry, f.inventory, ammo, 10)
            .is_allowed());
        assert!(f
            .constraints
            .validate_remove_item(&f.registry, f.inventory, ammo, 11)
            .has_violation(&ViolationKind::InsufficientQuantity));
        assert!(f
            .constraints
            .validate_remove_item(&f.registry, f.inventory, ammo, 0)
            .has_violation(&ViolationKind::InvalidItem));

        f.constraints.lock_slot(f.inventory, 0);
        assert!(f
            .constraints
            .validate_remove_item(&f.registry, f.inventory, ammo, 1)
            .has_violation(&ViolationKind::SlotLocked));
        assert!(f
            .constraints
            .validate_remove_item(&f.registry, f.inventory, InstanceId::new(), 1)
            .has_violation(&ViolationKind::InvalidItem));
    }

    #[test]
    fn test_rule_flags() {
        let mut f = fixture(4, 4, 0.0);
        let card = f.add("keycard", 1);
        let a = f.add("ammo_9mm", 5);
        let b = f.add("ammo_9mm", 5);
        f.constraints.set_rules(f.inventory, InventoryRules::quest_items());

        assert!(f
            .constraints
            .validate_rotate_item(&f.registry, f.inventory, card)
            .has_violation(&ViolationKind::RotationDisabled));
        assert!(f
            .constraints
            .validate_drop(&f.registry, f.inventory, card)
            .has_violation(&ViolationKind::DropDisabled));
        assert!(f
            .constraints
            .validate_stack(&f.registry, f.inventory, a, b)
            .is_allowed());

        f.constraints.set_rules(f.inventory, InventoryRules::weapons_only());
        assert!(f
            .constraints
            .validate_stack(&f.registry, f.inventory, a, b)
            .has_violation(&ViolationKind::StackingDisabled));
        assert!(f
            .constraints
            .validate_stack(&f.registry, f.inventory, a, card)
            .has_violation(&ViolationKind::InvalidItem));
    }

    #[test]
    fn test_rotation_needs_room() {
        let mut f = fixture(3, 3, 0.0);
        let pistol = f.add("pistol", 1); // slots 0,1
        let inv = f.registry.get_mut(f.inventory).expect("inv");
        inv.add_instance(ItemInstance::new("keycard", 1), Some(3))
            .expect("blocker");
        let result = f
            .constraints
            .validate_rotate_item(&f.registry, f.inventory, pistol);
        assert!(result.has_violation(&ViolationKind::SlotOccupied));
    }

    #[test]
    fn test_transfer_uses_target_rules() {
        let mut f = fixture(4, 4, 0.0);
        let target = f.registry.insert(component(4, 4));
        f.constraints.set_rules(target, InventoryRules::armor_only());
        let pistol = f.add("pistol", 1);
        let vest = f.add("vest", 1);

        assert!(f
            .constraints
            .validate_transfer(&f.registry, f.inventory, target, pistol, None)
            .has_violation(&ViolationKind::ItemTypeNotAllowed));
        assert!(f
            .constraints
            .validate_transfer(&f.registry, f.inventory, target, vest, Some(0))
            .is_allowed());
        assert!(f
            .constraints
            .validate_transfer(&f.registry, f.inventory, InventoryId::new(99), vest, None)
            .has_violation(&ViolationKind::NullInventory));
    }

    #[test]
    fn test_null_and_invalid_short_circuit() {
        let f = fixture(3, 3, 0.0);
        let result = f.constraints.validate_add_item(
            &f.registry,
            InventoryId::new(42),
            &ItemInstance::new("medkit", 1),
            None,
        );
        assert_eq!(result.violations.len(), 1);
        assert!(result.has_violation(&ViolationKind::NullInventory));

        let result = f.validate_add("medkit", 0, Some(99));
        assert_eq!(result.violations.len(), 1);
        assert!(result.has_violation(&ViolationKind::InvalidItem));
    }

    #[test]
    fn test_missing_item_data_is_allowed() {
        let f = fixture(3, 3, 1.0);
        assert!(f.validate_add("mystery_box", 50, None).is_allowed());
    }

    #[test]
    fn test_custom_validator_and_advisories() {
        let mut f = fixture(3, 3, 0.0);
        f.constraints.add_validator(
            |ctx: &ConstraintContext, _: &InventoryComponent| -> Vec<ConstraintViolation> {
                if ctx.item.item_id.as_str() == "medkit" {
                    vec![ConstraintViolation::new(
                        ViolationKind::Custom("Heavy".into()),
                        "Medkits are bulky",
                    )
                    .with_severity(0)]
                } else if ctx.item.item_id.as_str() == "vest" {
                    vec![ConstraintViolation::new(
                        ViolationKind::Custom("NoArmor".into()),
                        "Armor is banned here",
                    )]
                } else {
                    Vec::new()
                }
            },
        );

        let advisory = f.validate_add("medkit", 1, None);
        assert_eq!(advisory.result, ConstraintResult::Conditional);
        assert!(advisory.is_allowed());

        let denied = f.validate_add("vest", 1, None);
        assert_eq!(denied.result, ConstraintResult::Denied);
        assert!(denied.has_violation(&ViolationKind::Custom("NoArmor".into())));
    }

    #[test]
    fn test_find_best_slot_respects_slot_rules() {
        let mut f = fixture(3, 1, 0.0);
        let mut slot0 = SlotConstraint::new(0);
        slot0.blocked_types.insert("Item.Type.Consumable");
        f.constraints
            .set_rules(f.inventory, InventoryRules::default().with_slot_constraint(slot0));
        f.constraints.lock_slot(f.inventory, 1);

        let inv = f.registry.get(f.inventory).expect("inv");
        let medkit = ItemInstance::new("medkit", 1);
        assert_eq!(f.constraints.find_best_slot(inv, &medkit), Some(2));
        let card = ItemInstance::new("keycard", 1).with_rotation(Rotation::Deg90);
        assert_eq!(f.constraints.find_best_slot(inv, &card), Some(0));
        assert!(!f.constraints.can_slot_accept_item(f.inventory, 1, &card));
    }

    #[test]
    fn test_find_best_placement_turns_item() {
        let mut f = fixture(1, 2, 0.0);
        let inv = f.registry.get(f.inventory).expect("inv");
        let pistol = ItemInstance::new("pistol", 1);
        assert_eq!(f.constraints.find_best_placement(inv, &pistol), Some((0, Rotation::Deg90)));
        assert_eq!(f.constraints.find_best_slot(inv, &pistol), Some(0));

        f.constraints.set_rules(
            f.inventory,
            InventoryRules {
                allow_rotation: false,
                ..InventoryRules::default()
            },
        );
        let inv = f.registry.get(f.inventory).expect("inv");
        assert_eq!(f.constraints.find_best_placement(inv, &pistol), None);
    }
}
