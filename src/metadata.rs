//! Container file identity and format version

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Container file format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Identity of one container file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    /// Format version the index was written with
    pub version: FormatVersion,

    /// Unique id assigned at creation; changes if the file is recreated
    pub file_id: Uuid,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last time the index was persisted
    pub modified_at: DateTime<Utc>,

    /// Library version that created the file
    pub software_version: String,
}

impl ContainerMetadata {
    /// Fresh metadata for a new file
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: FormatVersion::CURRENT,
            file_id: Uuid::new_v4(),
            created_at: now,
            modified_at: now,
            software_version: crate::DCOLLECT_VERSION.to_string(),
        }
    }

    /// Update the modification timestamp
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

impl Default for ContainerMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v1 = FormatVersion::new(1, 0);
        let v1_1 = FormatVersion::new(1, 1);
        let v2 = FormatVersion::new(2, 0);
        assert!(v1.is_compatible(&v1_1));
        assert!(!v1.is_compatible(&v2));
        assert_eq!(v1_1.to_string(), "1.1");
    }

    #[test]
    fn test_metadata_ids_are_unique() {
        let a = ContainerMetadata::new();
        let b = ContainerMetadata::new();
        assert_ne!(a.file_id, b.file_id);
        assert_eq!(a.software_version, crate::DCOLLECT_VERSION);
    }

    #[test]
    fn test_metadata_serialization() {
        let metadata = ContainerMetadata::new();
        let bytes = bincode::serialize(&metadata).unwrap();
        let decoded: ContainerMetadata = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, metadata);
    }
}
