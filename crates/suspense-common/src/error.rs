//! Result codes and shared error types for SuspenseCore.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Outcome code attached to operation records and network acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InventoryResultCode {
    /// Operation succeeded
    #[default]
    Success,
    /// Unclassified failure
    Unknown,
    /// Inventory handle does not resolve or inventory is not set up
    NotInitialized,
    /// Item reference or item data is invalid
    InvalidItem,
    /// Instance or slot content does not exist
    ItemNotFound,
    /// Slot index is outside the grid
    InvalidSlot,
    /// Target cells are taken by another item
    SlotOccupied,
    /// No free space anywhere for the item
    InsufficientSpace,
    /// Adding the item would exceed the weight limit
    WeightLimitExceeded,
    /// Not enough items to satisfy the request
    InsufficientQuantity,
    /// Quantity exceeds the item's stack limit
    StackLimitExceeded,
    /// Rejected by constraint validation
    ValidationFailed,
    /// Rejected by the authority gate
    PermissionDenied,
    /// A transaction could not begin, commit, or roll back
    TransactionFailed,
}

impl InventoryResultCode {
    /// Checks if this is the success code.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for InventoryResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors shared by persisted and wire formats.
#[derive(Debug, Error)]
pub enum FormatError {
    /// Data does not start with the expected magic bytes
    #[error("Invalid magic bytes: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        /// Expected magic
        expected: [u8; 4],
        /// Magic found in the data
        actual: [u8; 4],
    },

    /// Schema version mismatch
    #[error("Schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Expected version
        expected: String,
        /// Actual version found
        actual: String,
    },

    /// Input ended before a complete header or body
    #[error("Truncated data: needed {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for format operations.
pub type FormatResult<T> = Result<T, FormatError>;
