//! # SuspenseCore Inventory
//!
//! Grid inventory engine:
//! - Slot storage with multi-cell footprints and rotation
//! - Constraint-based validation (item types, slots, weight, caps, custom hooks)
//! - Snapshot transactions with commit and rollback
//! - Bounded undo/redo history
//! - Server-authoritative replication with client-side prediction
//! - Binary wire framing, save data, and an event bus for notifications
//!
//! [`InventoryManager`] ties these together; the individual parts can also be
//! driven directly through an [`InventoryRegistry`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod authority;
pub mod component;
pub mod config;
pub mod constraints;
pub mod events;
pub mod history;
pub mod item;
pub mod item_data;
pub mod manager;
pub mod operation;
pub mod registry;
pub mod replicator;
pub mod snapshot;
pub mod storage;
pub mod transaction;
pub mod wire;

#[cfg(test)]
mod test_support;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::authority::*;
    pub use crate::component::*;
    pub use crate::config::*;
    pub use crate::constraints::*;
    pub use crate::events::*;
    pub use crate::history::*;
    pub use crate::item::*;
    pub use crate::item_data::*;
    pub use crate::manager::*;
    pub use crate::operation::*;
    pub use crate::registry::*;
    pub use crate::replicator::*;
    pub use crate::snapshot::*;
    pub use crate::storage::*;
    pub use crate::transaction::*;
    pub use crate::wire::*;
}

pub use prelude::*;
