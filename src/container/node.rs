//! Index tree of a container file

use crate::attribute::Attribute;
use crate::compression::FilterPipeline;
use crate::types::DataType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node kinds visible to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Group,
    Dataset,
    Reference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    Group(GroupNode),
    Dataset(DatasetNode),
    Reference(ReferenceNode),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Group(_) => NodeKind::Group,
            Node::Dataset(_) => NodeKind::Dataset,
            Node::Reference(_) => NodeKind::Reference,
        }
    }

    pub fn attributes(&self) -> &BTreeMap<String, Attribute> {
        match self {
            Node::Group(g) => &g.attributes,
            Node::Dataset(d) => &d.attributes,
            Node::Reference(r) => &r.attributes,
        }
    }

    pub fn attributes_mut(&mut self) -> &mut BTreeMap<String, Attribute> {
        match self {
            Node::Group(g) => &mut g.attributes,
            Node::Dataset(d) => &mut d.attributes,
            Node::Reference(r) => &mut r.attributes,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupNode {
    pub attributes: BTreeMap<String, Attribute>,
    pub children: BTreeMap<String, Node>,
}

/// Location of one encoded chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub offset: u64,
    pub stored_len: u64,
    /// Bytes reserved at `offset`; rewrites up to this length stay in place
    pub capacity: u64,
}

/// Where chunk bytes live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChunkStorage {
    /// Each written chunk is an independently encoded blob
    Blobs(BTreeMap<Vec<u64>, BlobRef>),
    /// Raw fixed-size slots preallocated at `base`, one per chunk
    Slots { base: u64, slot_len: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetNode {
    pub data_type: DataType,
    /// Back-end shape, slowest axis first
    pub shape: Vec<u64>,
    pub chunk: Vec<u64>,
    pub filters: FilterPipeline,
    pub extensible: bool,
    pub storage: ChunkStorage,
    pub attributes: BTreeMap<String, Attribute>,
}

impl DatasetNode {
    pub fn rank(&self) -> u32 {
        self.shape.len() as u32
    }
}

/// Back-end hyperslab of a region reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSpec {
    pub offset: Vec<u64>,
    pub count: Vec<u64>,
    pub stride: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceNode {
    /// Absolute path of the referenced dataset
    pub target: String,
    pub region: Option<RegionSpec>,
    pub attributes: BTreeMap<String, Attribute>,
}

/// Split an absolute or relative node path into components
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/1/fields/rho"), vec!["1", "fields", "rho"]);
        assert!(split_path("/").is_empty());
    }
}
