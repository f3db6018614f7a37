//! Creation attributes passed to `open`

use crate::compression::CompressionMethod;
use crate::dims::Dimensions;
use crate::error::{DcError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a collector opens its files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAccessType {
    /// Truncate or create
    #[default]
    Create,
    /// One physical file at the configured writer position
    Read,
    /// All files of a file-set
    ReadMerged,
    /// Append to existing files, creating them if missing
    Write,
}

impl FileAccessType {
    pub fn is_read(&self) -> bool {
        matches!(self, FileAccessType::Read | FileAccessType::ReadMerged)
    }
}

/// Configuration of a collector `open`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCreationAttr {
    pub file_acc_type: FileAccessType,
    /// Writer topology
    pub mpi_size: Dimensions,
    /// This writer's slot in the topology
    pub mpi_position: Dimensions,
    pub enable_compression: bool,
    /// Codec used when compression is enabled
    pub compression: CompressionMethod,
    /// Bound on concurrently open files; 0 selects the default
    pub max_file_handles: usize,
}

impl Default for FileCreationAttr {
    fn default() -> Self {
        Self {
            file_acc_type: FileAccessType::Create,
            mpi_size: Dimensions::ONE,
            mpi_position: Dimensions::ZERO,
            enable_compression: false,
            compression: CompressionMethod::Deflate,
            max_file_handles: 0,
        }
    }
}

impl FileCreationAttr {
    pub fn new(file_acc_type: FileAccessType) -> Self {
        Self {
            file_acc_type,
            ..Self::default()
        }
    }

    pub fn with_access(mut self, file_acc_type: FileAccessType) -> Self {
        self.file_acc_type = file_acc_type;
        self
    }

    pub fn with_topology(mut self, mpi_size: Dimensions, mpi_position: Dimensions) -> Self {
        self.mpi_size = mpi_size;
        self.mpi_position = mpi_position;
        self
    }

    pub fn with_compression(mut self, enable: bool) -> Self {
        self.enable_compression = enable;
        self
    }

    pub fn with_compression_method(mut self, method: CompressionMethod) -> Self {
        self.compression = method;
        self
    }

    pub fn with_max_file_handles(mut self, max: usize) -> Self {
        self.max_file_handles = max;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let attr: Self = serde_json::from_str(json)
            .map_err(|e| DcError::Configuration(format!("Invalid creation attributes: {}", e)))?;
        attr.validate()?;
        Ok(attr)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mpi_size.any_zero() {
            return Err(DcError::Configuration(format!(
                "Topology {} has a zero extent",
                self.mpi_size
            )));
        }
        if (0..3).any(|i| self.mpi_position.get(i) >= self.mpi_size.get(i)) {
            return Err(DcError::Configuration(format!(
                "Position {} lies outside topology {}",
                self.mpi_position, self.mpi_size
            )));
        }
        Ok(())
    }

    /// Number of writers in the topology
    pub fn num_writers(&self) -> u64 {
        self.mpi_size.scalar_size()
    }
}
