//! Shared fixtures for unit tests.

use std::sync::Arc;

use crate::component::InventoryComponent;
use crate::item_data::{ItemData, ItemDataTable, WeaponConfig};

/// Small item catalogue covering every footprint and stacking case the tests need.
pub(crate) fn item_table() -> Arc<ItemDataTable> {
    Arc::new(
        ItemDataTable::new()
            .with(
                ItemData::new("rifle")
                    .with_size(4, 2)
                    .with_weight(3.5)
                    .with_tag("Item.Type.Weapon.Rifle")
                    .with_weapon(WeaponConfig {
                        magazine_size: 30,
                        ammo_type: None,
                    }),
            )
            .with(
                ItemData::new("pistol")
                    .with_size(2, 1)
                    .with_weight(1.0)
                    .with_tag("Item.Type.Weapon.Pistol"),
            )
            .with(
                ItemData::new("ammo_9mm")
                    .with_weight(0.5)
                    .with_max_stack(60)
                    .with_tag("Item.Type.Ammo"),
            )
            .with(
                ItemData::new("medkit")
                    .with_weight(2.0)
                    .with_max_stack(5)
                    .with_tag("Item.Type.Consumable.Medical"),
            )
            .with(
                ItemData::new("vest")
                    .with_size(2, 2)
                    .with_weight(5.0)
                    .with_tag("Item.Type.Armor.Vest"),
            )
            .with(ItemData::new("keycard").with_tag("Item.Type.Quest")),
    )
}

/// Empty component backed by [`item_table`].
pub(crate) fn component(width: i32, height: i32) -> InventoryComponent {
    InventoryComponent::new(width, height, 0.0, item_table())
}
