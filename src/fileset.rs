//! Mapping of user paths onto physical container files
//!
//! A path ending in `.dcol` names one file. Anything else is a base name:
//! serial writers use `<base>_<x>_<y>_<z>.dcol` per topology position and
//! parallel writers share `<base>_<id>.dcol` per iteration.

use crate::container::Container;
use crate::dims::Dimensions;
use crate::error::{DcError, Result};
use crate::io::IOManager;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Extension of container files
pub const CONTAINER_EXTENSION: &str = "dcol";

/// Root attribute holding the writer topology
pub const ATTR_MPI_SIZE: &str = "mpi_size";
/// Root attribute holding the writer's position
pub const ATTR_MPI_POSITION: &str = "mpi_position";
/// Root attribute holding the library version
pub const ATTR_SOFTWARE_VERSION: &str = "software_version";
/// Root attribute holding the format version
pub const ATTR_FORMAT_VERSION: &str = "format_version";
/// Root attribute recording whether compression was enabled
pub const ATTR_COMPRESSION: &str = "compression";

/// Root attributes managed by the library
pub const RESERVED_ROOT_ATTRIBUTES: [&str; 5] = [
    ATTR_MPI_SIZE,
    ATTR_MPI_POSITION,
    ATTR_SOFTWARE_VERSION,
    ATTR_FORMAT_VERSION,
    ATTR_COMPRESSION,
];

/// A resolved user path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSet {
    dir: PathBuf,
    /// File name for a single file, base name otherwise
    stem: String,
    single: bool,
}

impl FileSet {
    /// Resolve a user path
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                DcError::InvalidArgument(format!("{} does not name a file", path.display()))
            })?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let double = format!(".{0}.{0}", CONTAINER_EXTENSION);
        if file_name.ends_with(&double) {
            warn!(path = %path.display(), "file name carries the container extension twice");
        }

        let single = Path::new(file_name)
            .extension()
            .is_some_and(|ext| ext == CONTAINER_EXTENSION);
        Ok(Self {
            dir,
            stem: file_name.to_string(),
            single,
        })
    }

    /// True if the path names exactly one physical file
    pub fn is_single(&self) -> bool {
        self.single
    }

    /// Directory holding the file-set
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Base name (or full file name for a single file)
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// File name of the writer at `pos`
    pub fn writer_file(&self, pos: Dimensions) -> String {
        if self.single {
            return self.stem.clone();
        }
        format!(
            "{}_{}_{}_{}.{}",
            self.stem,
            pos.x(),
            pos.y(),
            pos.z(),
            CONTAINER_EXTENSION
        )
    }

    /// File name of the shared file of iteration `id`
    pub fn iteration_file(&self, id: i32) -> String {
        format!("{}_{}.{}", self.stem, id, CONTAINER_EXTENSION)
    }

    /// Parse an iteration id back out of a shared file name
    pub fn iteration_of(&self, file_name: &str) -> Option<i32> {
        file_name
            .strip_prefix(&self.stem)?
            .strip_prefix('_')?
            .strip_suffix(CONTAINER_EXTENSION)?
            .strip_suffix('.')?
            .parse()
            .ok()
    }

    /// Ascending ids of all shared iteration files present
    pub async fn iteration_ids(&self, io: &dyn IOManager) -> Result<Vec<i32>> {
        let mut ids: Vec<i32> = io
            .list("")
            .await?
            .iter()
            .filter_map(|name| self.iteration_of(name))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Read the writer topology recorded in the first writer's file
    pub async fn discover_topology(&self, io: &dyn IOManager) -> Result<Dimensions> {
        let container = Container::open(io, &self.writer_file(Dimensions::ZERO), false).await?;
        container.attribute("/", ATTR_MPI_SIZE)?.as_dims()
    }
}
