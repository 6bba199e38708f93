//! Inventory inspection: text grid rendering, reports, integrity checks.

use std::fmt::{self, Write as _};

use serde::Serialize;
use suspense_common::{InstanceId, InventoryId};
use suspense_inventory::InventoryComponent;

/// Glyphs assigned to instances, in item order.
const GLYPHS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// One item line of a report.
#[derive(Debug, Clone, Serialize)]
pub struct ItemLine {
    /// Grid glyph
    pub glyph: char,
    /// Instance
    pub instance_id: InstanceId,
    /// Item type
    pub item_id: String,
    /// Units
    pub quantity: u32,
    /// Anchor slot
    pub slot: Option<usize>,
    /// Rotation in degrees
    pub rotation: i32,
}

/// Summary of one inventory.
#[derive(Debug, Clone, Serialize)]
pub struct InventoryReport {
    /// Inventory
    pub inventory: InventoryId,
    /// Grid width
    pub grid_width: i32,
    /// Grid height
    pub grid_height: i32,
    /// Distinct item types
    pub unique_items: usize,
    /// Units across all stacks
    pub total_quantity: u32,
    /// Carried weight
    pub current_weight: f32,
    /// Weight limit (0 = unlimited)
    pub max_weight: f32,
    /// Empty cells
    pub free_slots: usize,
    /// Fragmentation ratio in [0, 1]
    pub fragmentation: f32,
    /// Every instance
    pub items: Vec<ItemLine>,
}

impl fmt::Display for InventoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {}x{} | {} stacks, {} types, {} units",
            self.inventory,
            self.grid_width,
            self.grid_height,
            self.items.len(),
            self.unique_items,
            self.total_quantity
        )?;
        if self.max_weight > 0.0 {
            writeln!(f, "weight {:.2} / {:.2}", self.current_weight, self.max_weight)?;
        } else {
            writeln!(f, "weight {:.2} (unlimited)", self.current_weight)?;
        }
        writeln!(
            f,
            "free {} | fragmentation {:.0}%",
            self.free_slots,
            self.fragmentation * 100.0
        )?;
        for item in &self.items {
            write!(f, "  {} {} x{}", item.glyph, item.item_id, item.quantity)?;
            if let Some(slot) = item.slot {
                write!(f, " @{slot}")?;
            }
            if item.rotation != 0 {
                write!(f, " {}deg", item.rotation)?;
            }
            writeln!(f, " [{}]", item.instance_id.short())?;
        }
        Ok(())
    }
}

/// Result of an integrity check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    /// Inventory checked
    pub inventory: Option<InventoryId>,
    /// Problems found, empty when consistent
    pub problems: Vec<String>,
}

impl IntegrityReport {
    /// Checks if no problems were found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Inspector for inventories.
#[derive(Debug, Default)]
pub struct InventoryDebugger {
    /// Currently selected inventory (if any)
    selected: Option<InventoryId>,
    /// Print axis labels around the grid
    show_axes: bool,
}

impl InventoryDebugger {
    /// Creates a new debugger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables row and column labels in [`render_grid`](Self::render_grid).
    #[must_use]
    pub fn with_axes(mut self) -> Self {
        self.show_axes = true;
        self
    }

    /// Selects an inventory.
    pub fn select(&mut self, inventory: InventoryId) {
        self.selected = Some(inventory);
    }

    /// Clears the selection.
    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    /// Returns the selected inventory.
    #[must_use]
    pub fn selected(&self) -> Option<InventoryId> {
        self.selected
    }

    /// Draws the grid. Anchors are upper case, covered cells lower case, empty cells `.`.
    #[must_use]
    pub fn render_grid(&self, inventory: &InventoryComponent) -> String {
        let storage = inventory.storage();
        let width = storage.width() as usize;
        let mut out = String::new();

        if self.show_axes {
            out.push_str("   ");
            for x in 0..width {
                let _ = write!(out, "{}", x % 10);
            }
            out.push('\n');
        }
        for (index, slot) in storage.slots().iter().enumerate() {
            if index % width == 0 && self.show_axes {
                let _ = write!(out, "{:>2} ", index / width);
            }
            let cell = match slot.instance_id {
                Some(id) => {
                    let glyph = glyph_for(inventory, id);
                    if slot.is_anchor {
                        glyph
                    } else {
                        glyph.to_ascii_lowercase()
                    }
                }
                None => '.',
            };
            out.push(cell);
            if index % width == width - 1 {
                out.push('\n');
            }
        }
        out
    }

    /// Builds a summary report.
    #[must_use]
    pub fn report(&self, inventory: &InventoryComponent) -> InventoryReport {
        let storage = inventory.storage();
        InventoryReport {
            inventory: inventory.id(),
            grid_width: inventory.grid_width(),
            grid_height: inventory.grid_height(),
            unique_items: inventory.unique_item_count(),
            total_quantity: inventory.total_quantity(),
            current_weight: inventory.current_weight(),
            max_weight: inventory.max_weight(),
            free_slots: storage.free_slot_count(),
            fragmentation: storage.fragmentation_ratio(),
            items: inventory
                .items()
                .iter()
                .map(|item| ItemLine {
                    glyph: glyph_for(inventory, item.instance_id),
                    instance_id: item.instance_id,
                    item_id: item.item_id.to_string(),
                    quantity: item.quantity,
                    slot: item.slot_index,
                    rotation: item.rotation.degrees(),
                })
                .collect(),
        }
    }

    /// Cross-checks grid cells, item records and weight.
    #[must_use]
    pub fn check_integrity(&self, inventory: &InventoryComponent) -> IntegrityReport {
        IntegrityReport {
            inventory: Some(inventory.id()),
            problems: inventory.validate_integrity(),
        }
    }
}

fn glyph_for(inventory: &InventoryComponent, id: InstanceId) -> char {
    inventory
        .items()
        .iter()
        .position(|i| i.instance_id == id)
        .map_or('?', |index| GLYPHS[index % GLYPHS.len()] as char)
}
