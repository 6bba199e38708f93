//! # SuspenseCore Common
//!
//! Shared types for the SuspenseCore inventory engine:
//! - ID types (InstanceId, InventoryId, OperationId, PredictionId, ...)
//! - Grid coordinates, item footprints, and rotation
//! - Hierarchical tags and tag sets
//! - Result codes and format errors
//! - Version information for persisted and wire schemas

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod clock;
pub mod error;
pub mod grid;
pub mod ids;
pub mod tags;
pub mod version;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::clock::*;
    pub use crate::error::*;
    pub use crate::grid::*;
    pub use crate::ids::*;
    pub use crate::tags::*;
    pub use crate::version::*;
}

pub use prelude::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_generation() {
        let id1 = InstanceId::new();
        let id2 = InstanceId::new();
        assert_ne!(id1, id2);
        assert!(id1.is_valid());
        assert!(!InstanceId::NIL.is_valid());
        assert_eq!(id1.short().len(), 8);
    }

    #[test]
    fn test_operation_ids_increase() {
        let a = OperationId::new();
        let b = OperationId::new();
        assert!(b > a);
    }

    #[test]
    fn test_instance_id_survives_bincode() {
        let id = InstanceId::new();
        let bytes = bincode::serialize(&id).expect("serialize");
        let back: InstanceId = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(id, back);
    }

    #[test]
    fn test_version_compatibility() {
        let v1 = SchemaVersion::new(1, 0, 0);
        let v2 = SchemaVersion::new(1, 1, 0);
        let v3 = SchemaVersion::new(2, 0, 0);

        assert!(v2.is_compatible_with(&v1));
        assert!(!v1.is_compatible_with(&v3));
    }

    #[test]
    fn test_magic_check() {
        assert!(MagicBytes::REPLICATION.check(b"SCRP\x01").is_ok());
        assert!(matches!(
            MagicBytes::REPLICATION.check(b"SCIS"),
            Err(FormatError::InvalidMagic { .. })
        ));
        assert!(matches!(
            MagicBytes::REPLICATION.check(b"SC"),
            Err(FormatError::Truncated { needed: 4, available: 2 })
        ));
    }

    mod proptests {
        use crate::grid::{GridSize, Rotation};
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn rotation_four_turns_is_identity(turns in 0u8..4) {
                let start = Rotation::from_quarter_turns(turns);
                prop_assert_eq!(start.next().next().next().next(), start);
            }

            #[test]
            fn rotation_preserves_area(w in 1i32..10, h in 1i32..10, turns in 0u8..4) {
                let size = GridSize::new(w, h);
                let rotated = Rotation::from_quarter_turns(turns).apply(size);
                prop_assert_eq!(rotated.area(), size.area());
            }
        }
    }
}
