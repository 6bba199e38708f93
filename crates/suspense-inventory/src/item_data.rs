//! Static item data lookup.
//!
//! The inventory never owns item definitions. It asks an [`ItemDataProvider`]
//! for weight, footprint, tags, and stack limits by [`ItemId`]. The default
//! provider is [`ItemDataTable`], loadable from a RON list of definitions:
//!
//! ```ron
//! [
//!     (item_id: "rifle_ak", weight: 3.5, grid_size: (width: 4, height: 2),
//!      tags: ["Item.Type.Weapon.Rifle"], weapon: Some((magazine_size: 30))),
//!     (item_id: "ammo_762", weight: 0.01, tags: ["Item.Type.Ammo"], max_stack: 120),
//! ]
//! ```

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use suspense_common::{GridSize, ItemId, TagSet};
use thiserror::Error;
use tracing::info;

/// Errors from loading item data.
#[derive(Debug, Error)]
pub enum ItemDataError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// RON parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Two definitions share an item ID
    #[error("Duplicate item definition: {0}")]
    Duplicate(ItemId),

    /// A definition has an unusable footprint
    #[error("Item {item_id} has invalid grid size {size}")]
    InvalidSize {
        /// Offending item
        item_id: ItemId,
        /// Declared size
        size: GridSize,
    },
}

/// Result type for item data loading.
pub type ItemDataResult<T> = Result<T, ItemDataError>;

/// Weapon-specific static configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeaponConfig {
    /// Magazine capacity
    pub magazine_size: u32,
    /// Ammunition item type, if the weapon uses one
    #[serde(default)]
    pub ammo_type: Option<ItemId>,
}

/// Static definition of an item type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemData {
    /// Item type key
    pub item_id: ItemId,
    /// Human-readable name
    #[serde(default)]
    pub display_name: String,
    /// Weight of a single unit
    #[serde(default)]
    pub weight: f32,
    /// Footprint in grid cells
    #[serde(default)]
    pub grid_size: GridSize,
    /// Classification tags (`Item.Type.*`, `Item.Rarity.*`, ...)
    #[serde(default)]
    pub tags: TagSet,
    /// Maximum units per stack
    #[serde(default = "default_max_stack")]
    pub max_stack: u32,
    /// Weapon configuration, for weapons
    #[serde(default)]
    pub weapon: Option<WeaponConfig>,
}

fn default_max_stack() -> u32 {
    1
}

impl ItemData {
    /// Creates item data with a 1x1 footprint, no weight, and stack size 1.
    #[must_use]
    pub fn new(item_id: impl Into<ItemId>) -> Self {
        let item_id = item_id.into();
        Self {
            display_name: item_id.as_str().to_string(),
            item_id,
            weight: 0.0,
            grid_size: GridSize::ONE,
            tags: TagSet::new(),
            max_stack: default_max_stack(),
            weapon: None,
        }
    }

    /// Sets the unit weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the footprint.
    #[must_use]
    pub fn with_size(mut self, width: i32, height: i32) -> Self {
        self.grid_size = GridSize::new(width, height);
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag);
        self
    }

    /// Sets the stack limit.
    #[must_use]
    pub fn with_max_stack(mut self, max_stack: u32) -> Self {
        self.max_stack = max_stack;
        self
    }

    /// Marks the item as a weapon.
    #[must_use]
    pub fn with_weapon(mut self, config: WeaponConfig) -> Self {
        self.weapon = Some(config);
        self
    }

    /// Checks if several units can share one stack.
    #[must_use]
    pub fn is_stackable(&self) -> bool {
        self.max_stack > 1
    }
}

/// Read-only lookup of static item definitions.
pub trait ItemDataProvider: Send + Sync {
    /// Returns the definition of `item_id`, if known.
    fn item_data(&self, item_id: &ItemId) -> Option<&ItemData>;
}

/// In-memory item definition table.
#[derive(Debug, Clone, Default)]
pub struct ItemDataTable {
    items: AHashMap<ItemId, ItemData>,
}

impl ItemDataTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a definition.
    pub fn insert(&mut self, data: ItemData) {
        self.items.insert(data.item_id.clone(), data);
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, data: ItemData) -> Self {
        self.insert(data);
        self
    }

    /// Number of definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Checks if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Parses a RON list of definitions.
    pub fn from_ron_str(source: &str) -> ItemDataResult<Self> {
        let defs: Vec<ItemData> =
            ron::from_str(source).map_err(|e| ItemDataError::Parse(e.to_string()))?;

        let mut table = Self::new();
        for data in defs {
            if !data.grid_size.is_valid() {
                return Err(ItemDataError::InvalidSize {
                    item_id: data.item_id,
                    size: data.grid_size,
                });
            }
            if table.items.contains_key(&data.item_id) {
                return Err(ItemDataError::Duplicate(data.item_id));
            }
            table.insert(data);
        }
        Ok(table)
    }

    /// Loads a RON definition file.
    pub fn load_from(path: &Path) -> ItemDataResult<Self> {
        let source = fs::read_to_string(path)?;
        let table = Self::from_ron_str(&source)?;
        info!("Loaded {} item definitions from {:?}", table.len(), path);
        Ok(table)
    }

    /// Iterates over all definitions.
    pub fn iter(&self) -> impl Iterator<Item = &ItemData> {
        self.items.values()
    }
}

impl ItemDataProvider for ItemDataTable {
    fn item_data(&self, item_id: &ItemId) -> Option<&ItemData> {
        self.items.get(item_id)
    }
}
