//! Runtime item instances.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use suspense_common::{GridPos, InstanceId, ItemId, Rotation};

/// Well-known runtime property names.
pub mod property {
    /// Current durability
    pub const DURABILITY: &str = "Durability";
    /// Maximum durability
    pub const MAX_DURABILITY: &str = "MaxDurability";
    /// Current fire mode index
    pub const FIRE_MODE: &str = "FireMode";
}

/// Ammunition state carried by weapon instances.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WeaponState {
    /// Rounds in the magazine
    pub current_ammo: f32,
    /// Rounds in reserve
    pub reserve_ammo: f32,
}

impl WeaponState {
    /// Creates a new weapon state.
    #[must_use]
    pub const fn new(current_ammo: f32, reserve_ammo: f32) -> Self {
        Self {
            current_ammo,
            reserve_ammo,
        }
    }
}

/// A uniquely identified item living in an inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemInstance {
    /// Globally unique instance ID
    pub instance_id: InstanceId,
    /// Item type key
    pub item_id: ItemId,
    /// Stack size (at least 1 for a live instance)
    pub quantity: u32,
    /// Anchor slot when placed in a grid
    pub slot_index: Option<usize>,
    /// Anchor cell coordinates when placed in a grid
    pub grid_position: Option<GridPos>,
    /// Rotation of the footprint
    pub rotation: Rotation,
    /// Ammunition state for weapons
    pub weapon_state: Option<WeaponState>,
    /// Named float properties (durability, modifiers, ...)
    pub properties: BTreeMap<String, f32>,
}

impl ItemInstance {
    /// Creates a new unplaced instance with a fresh ID.
    #[must_use]
    pub fn new(item_id: impl Into<ItemId>, quantity: u32) -> Self {
        Self::with_id(InstanceId::new(), item_id, quantity)
    }

    /// Creates an unplaced instance with a caller-provided ID.
    #[must_use]
    pub fn with_id(instance_id: InstanceId, item_id: impl Into<ItemId>, quantity: u32) -> Self {
        Self {
            instance_id,
            item_id: item_id.into(),
            quantity,
            slot_index: None,
            grid_position: None,
            rotation: Rotation::Deg0,
            weapon_state: None,
            properties: BTreeMap::new(),
        }
    }

    /// Sets the rotation.
    #[must_use]
    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Sets the weapon state.
    #[must_use]
    pub fn with_weapon_state(mut self, state: WeaponState) -> Self {
        self.weapon_state = Some(state);
        self
    }

    /// Sets a runtime property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: f32) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Checks the instance has an ID, an item type, and a positive quantity.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.instance_id.is_valid() && !self.item_id.is_none() && self.quantity > 0
    }

    /// Checks if the instance currently sits in a grid.
    #[must_use]
    pub fn is_placed(&self) -> bool {
        self.slot_index.is_some()
    }

    /// Reads a property, falling back to `default`.
    #[must_use]
    pub fn property(&self, name: &str, default: f32) -> f32 {
        self.properties.get(name).copied().unwrap_or(default)
    }

    /// Writes a property.
    pub fn set_property(&mut self, name: impl Into<String>, value: f32) {
        self.properties.insert(name.into(), value);
    }

    /// Removes a property. Returns whether it existed.
    pub fn remove_property(&mut self, name: &str) -> bool {
        self.properties.remove(name).is_some()
    }

    /// Checks if two instances may share a stack.
    #[must_use]
    pub fn can_stack_with(&self, other: &Self) -> bool {
        self.item_id == other.item_id
            && self.instance_id != other.instance_id
            && self.weapon_state.is_none()
            && other.weapon_state.is_none()
            && self.properties == other.properties
    }

    pub(crate) fn clear_placement(&mut self) {
        self.slot_index = None;
        self.grid_position = None;
    }
}

impl fmt::Display for ItemInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} [{}]", self.item_id, self.quantity, self.instance_id.short())?;
        if let Some(slot) = self.slot_index {
            write!(f, " @{slot}")?;
        }
        if self.rotation != Rotation::Deg0 {
            write!(f, " {}", self.rotation)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_instance_is_unplaced() {
        let item = ItemInstance::new("medkit", 3);
        assert!(item.is_valid());
        assert!(!item.is_placed());
        assert_eq!(item.rotation, Rotation::Deg0);
    }

    #[test]
    fn test_invalid_instances() {
        assert!(!ItemInstance::new("medkit", 0).is_valid());
        assert!(!ItemInstance::new("", 1).is_valid());
        assert!(!ItemInstance::with_id(InstanceId::NIL, "medkit", 1).is_valid());
    }

    #[test]
    fn test_properties() {
        let mut item = ItemInstance::new("helmet", 1).with_property(property::DURABILITY, 80.0);
        assert!((item.property(property::DURABILITY, 0.0) - 80.0).abs() < f32::EPSILON);
        assert!((item.property(property::MAX_DURABILITY, 100.0) - 100.0).abs() < f32::EPSILON);
        item.set_property(property::DURABILITY, 10.0);
        assert!(item.remove_property(property::DURABILITY));
        assert!(!item.remove_property(property::DURABILITY));
    }

    #[test]
    fn test_stacking_rules() {
        let a = ItemInstance::new("ammo_9mm", 10);
        let b = ItemInstance::new("ammo_9mm", 20);
        let c = ItemInstance::new("ammo_556", 20);
        let rifle_a = ItemInstance::new("rifle", 1).with_weapon_state(WeaponState::new(30.0, 90.0));
        let rifle_b = ItemInstance::new("rifle", 1);

        assert!(a.can_stack_with(&b));
        assert!(!a.can_stack_with(&a));
        assert!(!a.can_stack_with(&c));
        assert!(!rifle_a.can_stack_with(&rifle_b));
    }
}
