//! Version types for schema compatibility.

use serde::{Deserialize, Serialize};

use crate::error::{FormatError, FormatResult};

/// Schema version using semantic versioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Major version (breaking changes)
    pub major: u16,
    /// Minor version (backwards-compatible additions)
    pub minor: u16,
    /// Patch version (bug fixes)
    pub patch: u16,
}

impl SchemaVersion {
    /// Creates a new schema version.
    #[must_use]
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Persisted inventory layout version.
    pub const INVENTORY_SAVE: Self = Self::new(1, 0, 0);

    /// Replication wire protocol version.
    pub const REPLICATION: Self = Self::new(1, 0, 0);

    /// Checks if this version is compatible with another version.
    /// Compatible means same major version and this minor >= other minor.
    #[must_use]
    pub const fn is_compatible_with(&self, other: &Self) -> bool {
        self.major == other.major && self.minor >= other.minor
    }

    /// Checks if this version can read data from another version.
    #[must_use]
    pub const fn can_read(&self, data_version: &Self) -> bool {
        self.major == data_version.major
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Magic bytes for format identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagicBytes(pub [u8; 4]);

impl MagicBytes {
    /// Persisted inventory magic bytes.
    pub const INVENTORY_SAVE: Self = Self(*b"SCIS");

    /// Replication frame magic bytes.
    pub const REPLICATION: Self = Self(*b"SCRP");

    /// Checks that `data` starts with these magic bytes.
    pub fn check(self, data: &[u8]) -> FormatResult<()> {
        if data.len() < 4 {
            return Err(FormatError::Truncated {
                needed: 4,
                available: data.len(),
            });
        }
        let mut actual = [0u8; 4];
        actual.copy_from_slice(&data[..4]);
        if actual == self.0 {
            Ok(())
        } else {
            Err(FormatError::InvalidMagic {
                expected: self.0,
                actual,
            })
        }
    }
}
