//! Inventory snapshots and the persisted inventory layout.

use serde::{Deserialize, Serialize};
use suspense_common::{unix_millis, InstanceId, MagicBytes, SchemaVersion};
use thiserror::Error;

use crate::item::ItemInstance;

/// Current persisted layout version.
pub const SAVE_VERSION: SchemaVersion = SchemaVersion::INVENTORY_SAVE;

/// Errors that can occur while saving or loading inventory data.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid magic bytes
    #[error("Invalid inventory save format")]
    InvalidFormat,

    /// Version mismatch
    #[error("Incompatible inventory save version: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected version
        expected: SchemaVersion,
        /// Found version
        found: SchemaVersion,
    },

    /// Data decoded but is unusable
    #[error("Inventory save corrupted: {0}")]
    Corrupted(String),
}

/// Result type for snapshot persistence.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Point-in-time copy of an inventory's items and weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    /// Every instance with its slot and rotation
    pub items: Vec<ItemInstance>,
    /// Total weight at capture time
    pub current_weight: f32,
    /// Capture time (Unix milliseconds)
    pub timestamp: u64,
}

impl InventorySnapshot {
    /// Captures the given items.
    #[must_use]
    pub fn capture(items: &[ItemInstance], current_weight: f32) -> Self {
        Self {
            items: items.to_vec(),
            current_weight,
            timestamp: unix_millis(),
        }
    }

    /// Number of captured instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Checks if the snapshot holds no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Looks up a captured instance.
    #[must_use]
    pub fn find(&self, instance_id: InstanceId) -> Option<&ItemInstance> {
        self.items.iter().find(|i| i.instance_id == instance_id)
    }

    /// Compares item state (ids, slots, quantities, rotations, payload), ignoring time.
    #[must_use]
    pub fn same_items(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .all(|item| other.find(item.instance_id) == Some(item))
    }
}

/// Persisted shape of one inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySaveData {
    /// Layout version
    pub version: SchemaVersion,
    /// Save time (Unix milliseconds)
    pub timestamp: u64,
    /// Grid width
    pub grid_width: i32,
    /// Grid height
    pub grid_height: i32,
    /// Weight limit (0 = unlimited)
    pub max_weight: f32,
    /// Every instance with its slot, rotation and properties
    pub items: Vec<ItemInstance>,
}

impl InventorySaveData {
    /// Creates save data for a grid with the given items.
    #[must_use]
    pub fn new(
        grid_width: i32,
        grid_height: i32,
        max_weight: f32,
        items: Vec<ItemInstance>,
    ) -> Self {
        Self {
            version: SAVE_VERSION,
            timestamp: unix_millis(),
            grid_width,
            grid_height,
            max_weight,
            items,
        }
    }

    /// Serializes to binary format.
    pub fn to_bytes(&self) -> SnapshotResult<Vec<u8>> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&MagicBytes::INVENTORY_SAVE.0);

        let data =
            bincode::serialize(self).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        buffer.extend(data);

        Ok(buffer)
    }

    /// Deserializes from binary format.
    pub fn from_bytes(bytes: &[u8]) -> SnapshotResult<Self> {
        if MagicBytes::INVENTORY_SAVE.check(bytes).is_err() {
            return Err(SnapshotError::InvalidFormat);
        }

        let save: Self =
            bincode::deserialize(&bytes[4..]).map_err(|e| SnapshotError::Corrupted(e.to_string()))?;

        if !SAVE_VERSION.can_read(&save.version) {
            return Err(SnapshotError::VersionMismatch {
                expected: SAVE_VERSION,
                found: save.version,
            });
        }

        Ok(save)
    }

    /// Pretty JSON for debugging dumps.
    pub fn to_json_pretty(&self) -> SnapshotResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| SnapshotError::Serialization(e.to_string()))
    }

    /// Writes binary save data to a file.
    pub fn save_to(&self, path: &std::path::Path) -> SnapshotResult<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Reads binary save data from a file.
    pub fn load_from(path: &std::path::Path) -> SnapshotResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}
