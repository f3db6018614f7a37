//! Self-describing container files
//!
//! A container holds a tree of groups, chunked datasets and references,
//! each carrying typed attributes. On disk:
//!
//! ```text
//! header  | "DCOL" | major u16 | minor u16 |
//! data    | chunk blobs and preallocated chunk slots ...        |
//! index   | bincode(ContainerIndex)                             |
//! footer  | index offset u64 | index len u64 | crc32 u32 | "DCOL" |
//! ```
//!
//! The index is rewritten on every flush and the file truncated after the
//! footer, so the footer always sits at the end of the file.

mod dataset;
pub mod node;

pub use dataset::{DatasetInfo, DatasetSpec, StorageLayout, APPEND_CHUNK_ELEMENTS};
pub use node::{Node, NodeKind};

use crate::attribute::Attribute;
use crate::dims::Dimensions;
use crate::error::{DcError, Result};
use crate::io::{IOManager, OpenMode, StorageFile};
use crate::metadata::{ContainerMetadata, FormatVersion};
use crate::utils::{calculate_checksum, verify_checksum};
use node::{split_path, GroupNode, ReferenceNode, RegionSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Magic bytes opening and closing every container file
pub const CONTAINER_MAGIC: &[u8; 4] = b"DCOL";

const HEADER_LEN: u64 = 8;
const FOOTER_LEN: u64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContainerIndex {
    metadata: ContainerMetadata,
    root: Node,
}

/// An open container file
pub struct Container {
    file: Box<dyn StorageFile>,
    name: String,
    index: ContainerIndex,
    /// First free byte after the data region
    end: u64,
    writable: bool,
    dirty: bool,
    owns_index: bool,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("file_id", &self.index.metadata.file_id)
            .field("writable", &self.writable)
            .finish()
    }
}

fn header_bytes() -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN as usize);
    header.extend_from_slice(CONTAINER_MAGIC);
    header.extend_from_slice(&FormatVersion::CURRENT.major.to_le_bytes());
    header.extend_from_slice(&FormatVersion::CURRENT.minor.to_le_bytes());
    header
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn split_parent(path: &str) -> Result<(String, String)> {
    let mut components = split_path(path);
    let leaf = components
        .pop()
        .ok_or_else(|| DcError::InvalidArgument("The root group has no parent".to_string()))?;
    Ok((format!("/{}", components.join("/")), leaf.to_string()))
}

impl Container {
    /// Create (or truncate) a container file
    pub async fn create(io: &dyn IOManager, name: &str) -> Result<Self> {
        let mut file = io.open(name, OpenMode::Create).await?;
        file.write_at(0, &header_bytes()).await?;
        debug!(file = name, "created container");
        Ok(Self {
            file,
            name: name.to_string(),
            index: ContainerIndex {
                metadata: ContainerMetadata::new(),
                root: Node::Group(GroupNode::default()),
            },
            end: HEADER_LEN,
            writable: true,
            dirty: true,
            owns_index: true,
        })
    }

    /// Open an existing container file
    pub async fn open(io: &dyn IOManager, name: &str, writable: bool) -> Result<Self> {
        let mode = if writable {
            OpenMode::ReadWrite
        } else {
            OpenMode::Read
        };
        let mut file = io.open(name, mode).await?;
        let len = file.len().await?;
        if len < HEADER_LEN + FOOTER_LEN {
            return Err(DcError::InvalidFormat(format!(
                "{} is too short to be a container ({} bytes)",
                name, len
            )));
        }

        let header = file.read_at(0, HEADER_LEN as usize).await?;
        if &header[..4] != CONTAINER_MAGIC {
            return Err(DcError::InvalidFormat(format!("{} has no container header", name)));
        }
        let version = FormatVersion::new(
            u16::from_le_bytes([header[4], header[5]]),
            u16::from_le_bytes([header[6], header[7]]),
        );
        if !FormatVersion::CURRENT.is_compatible(&version) {
            return Err(DcError::UnsupportedVersion(version.major, version.minor));
        }

        let footer = file.read_at(len - FOOTER_LEN, FOOTER_LEN as usize).await?;
        if &footer[20..24] != CONTAINER_MAGIC {
            return Err(DcError::InvalidFormat(format!(
                "{} has no footer; it was not closed cleanly",
                name
            )));
        }
        let index_offset = le_u64(&footer[0..8]);
        let index_len = le_u64(&footer[8..16]);
        let checksum = u32::from_le_bytes([footer[16], footer[17], footer[18], footer[19]]);
        let index_end = index_offset
            .checked_add(index_len)
            .and_then(|end| end.checked_add(FOOTER_LEN));
        if index_offset < HEADER_LEN || index_end.map_or(true, |end| end > len) {
            return Err(DcError::InvalidFormat(format!(
                "{} has an index outside the file",
                name
            )));
        }

        let index_bytes = file.read_at(index_offset, index_len as usize).await?;
        if !verify_checksum(&index_bytes, checksum) {
            return Err(DcError::InvalidFormat(format!("{} index checksum mismatch", name)));
        }
        let index: ContainerIndex = bincode::deserialize(&index_bytes)?;
        debug!(file = name, writable, file_id = %index.metadata.file_id, "opened container");

        Ok(Self {
            file,
            name: name.to_string(),
            index,
            end: index_offset,
            writable,
            dirty: false,
            owns_index: true,
        })
    }

    /// Whether flushing this handle persists the index
    ///
    /// Several processes may hold the same file open; exactly one of them
    /// owns the index.
    pub fn set_owns_index(&mut self, owns: bool) {
        self.owns_index = owns;
    }

    pub fn owns_index(&self) -> bool {
        self.owns_index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_id(&self) -> Uuid {
        self.index.metadata.file_id
    }

    pub fn metadata(&self) -> &ContainerMetadata {
        &self.index.metadata
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Offset where the next data allocation starts
    pub fn next_offset(&self) -> u64 {
        self.end
    }

    /// Align the allocation cursor with another handle of the same file
    pub fn set_next_offset(&mut self, offset: u64) {
        self.end = offset.max(HEADER_LEN);
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(DcError::NotPermitted(format!("{} is open read-only", self.name)))
        }
    }

    pub fn node(&self, path: &str) -> Option<&Node> {
        let mut current = &self.index.root;
        for component in split_path(path) {
            match current {
                Node::Group(group) => current = group.children.get(component)?,
                _ => return None,
            }
        }
        Some(current)
    }

    fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut current = &mut self.index.root;
        for component in split_path(path) {
            match current {
                Node::Group(group) => current = group.children.get_mut(component)?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    pub fn kind(&self, path: &str) -> Option<NodeKind> {
        self.node(path).map(Node::kind)
    }

    /// Child names and kinds of a group, in name order
    pub fn children(&self, path: &str) -> Result<Vec<(String, NodeKind)>> {
        match self.node(path) {
            Some(Node::Group(group)) => Ok(group
                .children
                .iter()
                .map(|(name, child)| (name.clone(), child.kind()))
                .collect()),
            Some(_) => Err(DcError::InvalidArgument(format!("{} is not a group", path))),
            None => Err(DcError::NotFound(format!("Group {}", path))),
        }
    }

    /// Create a group and any missing parents
    pub fn create_group(&mut self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let mut current = &mut self.index.root;
        for component in split_path(path) {
            let Node::Group(group) = current else {
                return Err(DcError::InvalidArgument(format!(
                    "{} crosses a non-group node",
                    path
                )));
            };
            current = group
                .children
                .entry(component.to_string())
                .or_insert_with(|| Node::Group(GroupNode::default()));
        }
        match current {
            Node::Group(_) => {
                self.dirty = true;
                Ok(())
            }
            _ => Err(DcError::InvalidArgument(format!("{} is not a group", path))),
        }
    }

    /// Insert a new node, creating parent groups
    fn insert_node(&mut self, path: &str, node: Node) -> Result<()> {
        let (parent, leaf) = split_parent(path)?;
        self.create_group(&parent)?;
        match self.node_mut(&parent) {
            Some(Node::Group(group)) => {
                if group.children.contains_key(&leaf) {
                    return Err(DcError::InvalidArgument(format!("{} already exists", path)));
                }
                group.children.insert(leaf, node);
                self.dirty = true;
                Ok(())
            }
            _ => Err(DcError::InvalidArgument(format!("{} has no parent group", path))),
        }
    }

    /// Remove a node and its whole subtree
    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let (parent, leaf) = split_parent(path)?;
        let removed = match self.node_mut(&parent) {
            Some(Node::Group(group)) => group.children.remove(&leaf),
            _ => None,
        };
        match removed {
            Some(_) => {
                self.dirty = true;
                debug!(file = %self.name, path, "removed node");
                Ok(())
            }
            None => Err(DcError::NotFound(path.to_string())),
        }
    }

    pub fn set_attribute(&mut self, path: &str, name: &str, value: Attribute) -> Result<()> {
        self.ensure_writable()?;
        let node = self
            .node_mut(path)
            .ok_or_else(|| DcError::NotFound(path.to_string()))?;
        node.attributes_mut().insert(name.to_string(), value);
        self.dirty = true;
        Ok(())
    }

    pub fn attribute(&self, path: &str, name: &str) -> Result<&Attribute> {
        self.attributes(path)?
            .get(name)
            .ok_or_else(|| DcError::NotFound(format!("Attribute {} on {}", name, path)))
    }

    pub fn attributes(&self, path: &str) -> Result<&BTreeMap<String, Attribute>> {
        self.node(path)
            .map(Node::attributes)
            .ok_or_else(|| DcError::NotFound(path.to_string()))
    }

    /// Create a reference to `target`, optionally restricted to a region
    ///
    /// The region is given in logical order as `(offset, count, stride)`.
    pub fn create_reference(
        &mut self,
        path: &str,
        target: &str,
        region: Option<(Dimensions, Dimensions, Dimensions)>,
    ) -> Result<()> {
        self.ensure_writable()?;
        if split_path(path) == split_path(target) {
            return Err(DcError::InvalidArgument(format!(
                "{} cannot reference itself",
                path
            )));
        }
        let target_node = match self.node(target) {
            Some(Node::Dataset(dataset)) => dataset,
            Some(_) => {
                return Err(DcError::InvalidArgument(format!(
                    "Reference target {} is not a dataset",
                    target
                )))
            }
            None => return Err(DcError::NotFound(format!("Dataset {}", target))),
        };
        let rank = target_node.rank();
        let region = match region {
            Some((offset, count, stride)) => {
                let spec = RegionSpec {
                    offset: offset.to_physical(rank),
                    count: count.to_physical(rank),
                    stride: stride.to_physical(rank),
                };
                crate::dims::Hyperslab::new(spec.offset.clone(), spec.stride.clone(), spec.count.clone())
                    .check_within(&target_node.shape)?;
                Some(spec)
            }
            None => None,
        };
        let canonical = format!("/{}", split_path(target).join("/"));
        self.insert_node(
            path,
            Node::Reference(ReferenceNode {
                target: canonical,
                region,
                attributes: BTreeMap::new(),
            }),
        )
    }

    /// Target path and region of a reference node
    pub fn reference(&self, path: &str) -> Result<(String, Option<node::RegionSpec>)> {
        match self.node(path) {
            Some(Node::Reference(reference)) => {
                Ok((reference.target.clone(), reference.region.clone()))
            }
            Some(_) => Err(DcError::InvalidArgument(format!("{} is not a reference", path))),
            None => Err(DcError::NotFound(path.to_string())),
        }
    }

    /// Persist pending changes
    pub async fn flush(&mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        if self.dirty && self.owns_index {
            self.index.metadata.touch();
            let index_bytes = bincode::serialize(&self.index)?;
            let mut tail = index_bytes.clone();
            tail.extend_from_slice(&self.end.to_le_bytes());
            tail.extend_from_slice(&(index_bytes.len() as u64).to_le_bytes());
            tail.extend_from_slice(&calculate_checksum(&index_bytes).to_le_bytes());
            tail.extend_from_slice(CONTAINER_MAGIC);
            self.file.write_at(self.end, &tail).await?;
            self.file.set_len(self.end + tail.len() as u64).await?;
            debug!(file = %self.name, index_bytes = index_bytes.len(), "persisted index");
        }
        self.file.sync().await?;
        self.dirty = false;
        Ok(())
    }

    /// Make written data durable without touching the index
    pub async fn sync(&mut self) -> Result<()> {
        if self.writable {
            self.file.sync().await?;
        }
        Ok(())
    }

    /// Flush and release the file
    pub async fn close(mut self) -> Result<()> {
        self.flush().await?;
        debug!(file = %self.name, "closed container");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::io::FileSystemIOManager;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());

        let mut container = Container::create(&io, "a.dcol").await.unwrap();
        let file_id = container.file_id();
        container.create_group("/1/fields").unwrap();
        container
            .set_attribute("/", "mpi_size", Attribute::dims_u32(Dimensions::ONE))
            .unwrap();
        container.close().await.unwrap();

        let container = Container::open(&io, "a.dcol", false).await.unwrap();
        assert_eq!(container.file_id(), file_id);
        assert_eq!(container.kind("/1/fields"), Some(NodeKind::Group));
        assert_eq!(
            container.attribute("/", "mpi_size").unwrap().as_dims().unwrap(),
            Dimensions::ONE
        );
        assert_eq!(
            container.children("/1").unwrap(),
            vec![("fields".to_string(), NodeKind::Group)]
        );
    }

    #[tokio::test]
    async fn test_read_only_rejects_changes() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());
        Container::create(&io, "a.dcol").await.unwrap().close().await.unwrap();

        let mut container = Container::open(&io, "a.dcol", false).await.unwrap();
        let err = container.create_group("/2").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_corrupt_index_detected() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());
        let mut container = Container::create(&io, "a.dcol").await.unwrap();
        container.create_group("/7").unwrap();
        container.close().await.unwrap();

        let mut file = io.open("a.dcol", OpenMode::ReadWrite).await.unwrap();
        file.write_at(HEADER_LEN, b"garbage").await.unwrap();
        drop(file);

        let err = Container::open(&io, "a.dcol", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn test_footer_with_huge_index_len() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());
        Container::create(&io, "a.dcol").await.unwrap().close().await.unwrap();

        let mut file = io.open("a.dcol", OpenMode::ReadWrite).await.unwrap();
        let footer = file.len().await.unwrap() - FOOTER_LEN;
        file.write_at(footer + 8, &(u64::MAX - 4).to_le_bytes()).await.unwrap();
        drop(file);

        let err = Container::open(&io, "a.dcol", false).await.unwrap_err();
        assert!(matches!(err, DcError::InvalidFormat(_)));
    }

    #[tokio::test]
    async fn test_unclosed_file_is_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());
        let container = Container::create(&io, "a.dcol").await.unwrap();
        drop(container);
        assert!(Container::open(&io, "a.dcol", false).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());
        let mut container = Container::create(&io, "a.dcol").await.unwrap();
        container.create_group("/1/a/b").unwrap();
        container.create_group("/1/c").unwrap();
        container.remove("/1/a").unwrap();
        assert!(!container.exists("/1/a/b"));
        assert!(container.exists("/1/c"));
        assert_eq!(container.remove("/1/a").unwrap_err().kind(), ErrorKind::NotFound);
    }
}
