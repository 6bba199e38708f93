//! Grid slot storage with multi-cell placement.
//!
//! Slots are addressed linearly (`index = y * width + x`). A placed item
//! covers a rectangle of cells; the top-left cell is its anchor and every
//! other covered cell records its offset from the anchor so any cell can be
//! resolved back to the anchor in O(1).

use serde::{Deserialize, Serialize};
use suspense_common::{GridPos, GridSize, InstanceId};
use tracing::trace;

/// Largest supported grid dimension.
pub const MAX_GRID_DIMENSION: i32 = 50;

/// One cell of the inventory grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Slot {
    /// Instance covering this cell
    pub instance_id: Option<InstanceId>,
    /// Whether this is the instance's anchor (top-left) cell
    pub is_anchor: bool,
    /// Offset of this cell from the anchor cell
    pub offset_from_anchor: GridPos,
}

impl Slot {
    /// Checks if no item covers this cell.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.instance_id.is_none()
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Spatial grid of slots owned by one inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryStorage {
    width: i32,
    height: i32,
    slots: Vec<Slot>,
}

impl Default for InventoryStorage {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl InventoryStorage {
    /// Creates an empty grid; dimensions are clamped to `1..=MAX_GRID_DIMENSION`.
    #[must_use]
    pub fn new(width: i32, height: i32) -> Self {
        let mut storage = Self {
            width: 1,
            height: 1,
            slots: Vec::new(),
        };
        storage.initialize(width, height);
        storage
    }

    /// Resets to an all-empty grid of the clamped size.
    pub fn initialize(&mut self, width: i32, height: i32) {
        self.width = width.clamp(1, MAX_GRID_DIMENSION);
        self.height = height.clamp(1, MAX_GRID_DIMENSION);
        self.slots = vec![Slot::default(); (self.width * self.height) as usize];
        trace!("Storage initialized to {}x{}", self.width, self.height);
    }

    /// Grid width in cells.
    #[must_use]
    pub const fn width(&self) -> i32 {
        self.width
    }

    /// Grid height in cells.
    #[must_use]
    pub const fn height(&self) -> i32 {
        self.height
    }

    /// Total number of slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Checks if `slot` lies inside the grid.
    #[must_use]
    pub fn is_valid_slot(&self, slot: usize) -> bool {
        slot < self.slots.len()
    }

    /// Converts a slot index to grid coordinates.
    #[must_use]
    pub fn slot_to_coords(&self, slot: usize) -> Option<GridPos> {
        if !self.is_valid_slot(slot) {
            return None;
        }
        let slot = slot as i32;
        Some(GridPos::new(slot % self.width, slot / self.width))
    }

    /// Converts grid coordinates to a slot index.
    #[must_use]
    pub fn coords_to_slot(&self, pos: GridPos) -> Option<usize> {
        if pos.x < 0 || pos.y < 0 || pos.x >= self.width || pos.y >= self.height {
            return None;
        }
        Some((pos.y * self.width + pos.x) as usize)
    }

    /// Returns the slot at `slot`.
    #[must_use]
    pub fn slot(&self, slot: usize) -> Option<&Slot> {
        self.slots.get(slot)
    }

    /// All slots in index order.
    #[must_use]
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Checks if any item covers `slot`.
    #[must_use]
    pub fn is_slot_occupied(&self, slot: usize) -> bool {
        self.slots.get(slot).is_some_and(|s| !s.is_empty())
    }

    /// Returns the instance covering `slot`.
    #[must_use]
    pub fn instance_at_slot(&self, slot: usize) -> Option<InstanceId> {
        self.slots.get(slot).and_then(|s| s.instance_id)
    }

    /// Resolves any covered cell to the anchor slot of its item.
    #[must_use]
    pub fn anchor_slot_of(&self, slot: usize) -> Option<usize> {
        let cell = self.slots.get(slot)?;
        cell.instance_id?;
        let pos = self.slot_to_coords(slot)?;
        self.coords_to_slot(pos.minus(cell.offset_from_anchor))
    }

    /// Finds the anchor slot of an instance.
    #[must_use]
    pub fn anchor_of_instance(&self, instance_id: InstanceId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.is_anchor && s.instance_id == Some(instance_id))
    }

    /// All slots covered by an instance, in index order.
    #[must_use]
    pub fn occupied_slots(&self, instance_id: InstanceId) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.instance_id == Some(instance_id))
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of empty cells.
    #[must_use]
    pub fn free_slot_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_empty()).count()
    }

    /// Checks if an item of `size` can be anchored at `anchor`.
    ///
    /// Cells covered by `ignore` count as free, so an item can be checked
    /// against a position overlapping its current one.
    #[must_use]
    pub fn can_place_item(
        &self,
        size: GridSize,
        anchor: usize,
        rotated: bool,
        ignore: Option<InstanceId>,
    ) -> bool {
        let footprint = size.footprint(rotated);
        if !footprint.is_valid() {
            return false;
        }
        let Some(origin) = self.slot_to_coords(anchor) else {
            return false;
        };
        if origin.x + footprint.width > self.width || origin.y + footprint.height > self.height {
            return false;
        }

        for dy in 0..footprint.height {
            for dx in 0..footprint.width {
                let index = ((origin.y + dy) * self.width + origin.x + dx) as usize;
                match self.slots[index].instance_id {
                    None => {}
                    Some(id) if Some(id) == ignore => {}
                    Some(_) => return false,
                }
            }
        }
        true
    }

    /// Writes an item into every cell of its footprint.
    ///
    /// Nothing is written unless the whole footprint is free.
    pub fn place_item(
        &mut self,
        instance_id: InstanceId,
        size: GridSize,
        anchor: usize,
        rotated: bool,
    ) -> bool {
        if !instance_id.is_valid() || !self.can_place_item(size, anchor, rotated, None) {
            return false;
        }
        let footprint = size.footprint(rotated);
        let Some(origin) = self.slot_to_coords(anchor) else {
            return false;
        };

        for dy in 0..footprint.height {
            for dx in 0..footprint.width {
                let index = ((origin.y + dy) * self.width + origin.x + dx) as usize;
                self.slots[index] = Slot {
                    instance_id: Some(instance_id),
                    is_anchor: dx == 0 && dy == 0,
                    offset_from_anchor: GridPos::new(dx, dy),
                };
            }
        }
        trace!(
            "Placed {} ({}) at slot {}",
            instance_id.short(),
            footprint,
            anchor
        );
        true
    }

    /// Clears every cell referencing `instance_id`.
    pub fn remove_item(&mut self, instance_id: InstanceId) -> bool {
        let mut found = false;
        for slot in &mut self.slots {
            if slot.instance_id == Some(instance_id) {
                slot.clear();
                found = true;
            }
        }
        found
    }

    /// Moves an item to a new anchor, possibly overlapping its old cells.
    pub fn move_item(
        &mut self,
        instance_id: InstanceId,
        size: GridSize,
        new_anchor: usize,
        rotated: bool,
    ) -> bool {
        if !self.can_place_item(size, new_anchor, rotated, Some(instance_id)) {
            return false;
        }
        self.remove_item(instance_id);
        self.place_item(instance_id, size, new_anchor, rotated)
    }

    /// Finds the first anchor where `size` fits.
    ///
    /// Tries the unrotated footprint over the whole grid first, then the
    /// rotated one for non-square items when `allow_rotation` is set.
    #[must_use]
    pub fn find_free_slot(&self, size: GridSize, allow_rotation: bool) -> Option<(usize, bool)> {
        if let Some(slot) =
            (0..self.slots.len()).find(|&s| self.can_place_item(size, s, false, None))
        {
            return Some((slot, false));
        }
        if allow_rotation && !size.is_square() {
            if let Some(slot) =
                (0..self.slots.len()).find(|&s| self.can_place_item(size, s, true, None))
            {
                return Some((slot, true));
            }
        }
        None
    }

    /// Ratio of horizontal free/occupied transitions to possible transitions.
    ///
    /// 0 means every row is one solid run; 1 means every neighbour pair differs.
    #[must_use]
    pub fn fragmentation_ratio(&self) -> f32 {
        if self.width <= 1 {
            return 0.0;
        }
        let mut transitions = 0u32;
        for row in self.slots.chunks(self.width as usize) {
            for pair in row.windows(2) {
                if pair[0].is_empty() != pair[1].is_empty() {
                    transitions += 1;
                }
            }
        }
        let possible = ((self.width - 1) * self.height) as f32;
        transitions as f32 / possible
    }

    /// Empties every cell.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
    }

    /// Checks the anchor/offset bookkeeping and reports every inconsistency.
    #[must_use]
    pub fn validate_integrity(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut anchors: ahash::AHashMap<InstanceId, usize> = ahash::AHashMap::new();

        for (index, cell) in self.slots.iter().enumerate() {
            let Some(id) = cell.instance_id else {
                if cell.is_anchor || cell.offset_from_anchor != GridPos::ZERO {
                    problems.push(format!("Slot {index} is empty but carries anchor data"));
                }
                continue;
            };

            if cell.is_anchor {
                if cell.offset_from_anchor != GridPos::ZERO {
                    problems.push(format!("Anchor slot {index} has non-zero offset"));
                }
                if let Some(previous) = anchors.insert(id, index) {
                    problems.push(format!(
                        "Instance {} has two anchors ({previous} and {index})",
                        id.short()
                    ));
                }
                continue;
            }

            match self.anchor_slot_of(index) {
                None => problems.push(format!("Slot {index} offset points outside the grid")),
                Some(anchor) => {
                    let target = &self.slots[anchor];
                    if !target.is_anchor || target.instance_id != Some(id) {
                        problems.push(format!(
                            "Slot {index} resolves to slot {anchor} which is not the anchor of {}",
                            id.short()
                        ));
                    }
                }
            }
        }

        for cell in &self.slots {
            if let Some(id) = cell.instance_id {
                if !anchors.contains_key(&id) {
                    problems.push(format!("Instance {} has no anchor cell", id.short()));
                    anchors.insert(id, usize::MAX);
                }
            }
        }
        problems
    }
}
