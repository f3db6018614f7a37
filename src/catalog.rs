//! Iteration and dataset catalog
//!
//! Iterations live at `/<id>` in every container. A dataset named `a/b`
//! lives in the group `/<id>/a/b` under the leaf name `b`, next to its
//! domain attributes.

use crate::container::{Container, NodeKind};
use crate::dims::Dimensions;
use crate::domain::ATTR_DATACLASS;
use crate::error::{DcError, Result};
use crate::types::DataType;
use std::collections::{BTreeMap, HashMap};

/// Group path of an iteration
pub fn iteration_path(id: i32) -> String {
    format!("/{}", id)
}

/// Group path holding dataset `name` and its annotations
pub fn dataset_group_path(id: i32, name: &str) -> String {
    format!("/{}/{}", id, name)
}

/// Path of the array of dataset `name`
pub fn dataset_path(id: i32, name: &str) -> String {
    let leaf = name.rsplit('/').next().unwrap_or(name);
    format!("/{}/{}/{}", id, name, leaf)
}

/// Check a user-supplied dataset name
pub fn validate_name(name: &str) -> Result<()> {
    let bad = |reason: &str| Err(DcError::InvalidArgument(format!("Dataset name '{}' {}", name, reason)));
    if name.is_empty() {
        return bad("is empty");
    }
    if name.starts_with('/') || name.ends_with('/') {
        return bad("must not start or end with '/'");
    }
    if name.split('/').any(str::is_empty) {
        return bad("contains an empty component");
    }
    if name.split('/').any(|c| c.starts_with('_')) {
        return bad("uses the reserved '_' prefix");
    }
    // the array of `a/a` would sit where the array of `a` lives
    let mut components = name.rsplit('/');
    if components.next() == components.next() {
        return bad("repeats its last component");
    }
    Ok(())
}

/// One dataset of an iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcEntry {
    pub name: String,
    pub data_type: DataType,
    pub rank: u32,
    pub size: Dimensions,
    /// The dataset group carries a domain annotation
    pub has_domain: bool,
}

/// Lazily populated view of the iterations and datasets of one container
#[derive(Debug, Default)]
pub struct Catalog {
    ids: Option<Vec<i32>>,
    entries: HashMap<i32, Vec<DcEntry>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ascending iteration ids
    pub fn ids(&mut self, container: &Container) -> Result<&[i32]> {
        if self.ids.is_none() {
            let mut ids: Vec<i32> = container
                .children("/")?
                .into_iter()
                .filter(|(_, kind)| *kind == NodeKind::Group)
                .filter_map(|(name, _)| name.parse().ok())
                .collect();
            ids.sort_unstable();
            self.ids = Some(ids);
        }
        Ok(self.ids.as_deref().unwrap_or_default())
    }

    /// Largest iteration id, 0 for an empty container
    pub fn max_id(&mut self, container: &Container) -> Result<i32> {
        Ok(self.ids(container)?.last().copied().unwrap_or(0))
    }

    /// Datasets of iteration `id`, sorted by name
    pub fn entries(&mut self, container: &Container, id: i32) -> Result<&[DcEntry]> {
        if !self.entries.contains_key(&id) {
            let root = iteration_path(id);
            if container.kind(&root) != Some(NodeKind::Group) {
                return Err(DcError::NotFound(format!("Iteration {}", id)));
            }
            let mut found = Vec::new();
            scan(container, id, &root, "", &mut found)?;
            found.sort_by(|a, b| a.name.cmp(&b.name));
            self.entries.insert(id, found);
        }
        Ok(self.entries.get(&id).map(Vec::as_slice).unwrap_or_default())
    }

    /// Forget cached state for iteration `id`
    pub fn invalidate_id(&mut self, id: i32) {
        self.ids = None;
        self.entries.remove(&id);
    }

    pub fn invalidate(&mut self) {
        self.ids = None;
        self.entries.clear();
    }
}

fn scan(container: &Container, id: i32, group: &str, prefix: &str, out: &mut Vec<DcEntry>) -> Result<()> {
    for (child, kind) in container.children(group)? {
        if kind != NodeKind::Group {
            continue;
        }
        let name = if prefix.is_empty() {
            child.clone()
        } else {
            format!("{}/{}", prefix, child)
        };
        let child_group = format!("{}/{}", group, child);
        let leaf = format!("{}/{}", child_group, child);
        if matches!(container.kind(&leaf), Some(NodeKind::Dataset | NodeKind::Reference)) {
            let info = container.dataset_info(&dataset_path(id, &name))?;
            out.push(DcEntry {
                has_domain: container.attributes(&child_group)?.contains_key(ATTR_DATACLASS),
                name: name.clone(),
                data_type: info.data_type,
                rank: info.rank,
                size: info.size,
            });
        }
        scan(container, id, &child_group, &name, out)?;
    }
    Ok(())
}

/// Check that a topology can tile data of `rank`
pub fn check_tiling(rank: u32, topology: Dimensions) -> Result<()> {
    for axis in rank as usize..3 {
        if topology.get(axis) > 1 {
            return Err(DcError::TopologyMismatch(format!(
                "Rank {} data cannot be tiled over writer topology {}",
                rank, topology
            )));
        }
    }
    Ok(())
}

/// Logical shape of a dataset assembled from all writers
///
/// Rank-1 pieces are concatenated; higher ranks must share one local shape
/// and are tiled by the topology.
pub fn merged_shape(rank: u32, topology: Dimensions, sizes: &[Dimensions]) -> Result<Dimensions> {
    if rank == 1 {
        return Ok(Dimensions::new(sizes.iter().map(Dimensions::x).sum(), 1, 1));
    }
    check_tiling(rank, topology)?;
    let local = sizes
        .first()
        .copied()
        .ok_or_else(|| DcError::NotFound("No writer holds the dataset".to_string()))?;
    if let Some(other) = sizes.iter().find(|s| **s != local) {
        return Err(DcError::InconsistentFileset(format!(
            "Writers hold local shapes {} and {}",
            local, other
        )));
    }
    Ok(local * topology)
}

/// Merge the entries of one iteration across writer files
///
/// Entries are deduplicated by name; type and rank must agree.
pub fn merge_entries(topology: Dimensions, per_file: &[Vec<DcEntry>]) -> Result<Vec<DcEntry>> {
    let mut grouped: BTreeMap<&str, Vec<&DcEntry>> = BTreeMap::new();
    for entry in per_file.iter().flatten() {
        grouped.entry(entry.name.as_str()).or_default().push(entry);
    }
    grouped
        .into_values()
        .map(|entries| {
            let first = entries[0];
            if let Some(other) = entries
                .iter()
                .find(|e| e.data_type != first.data_type || e.rank != first.rank)
            {
                return Err(DcError::InconsistentFileset(format!(
                    "{} is {} rank {} in one file and {} rank {} in another",
                    first.name, first.data_type, first.rank, other.data_type, other.rank
                )));
            }
            let sizes: Vec<Dimensions> = entries.iter().map(|e| e.size).collect();
            Ok(DcEntry {
                name: first.name.clone(),
                data_type: first.data_type,
                rank: first.rank,
                size: merged_shape(first.rank, topology, &sizes)?,
                has_domain: entries.iter().any(|e| e.has_domain),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::DatasetSpec;
    use crate::error::ErrorKind;
    use crate::io::FileSystemIOManager;
    use tempfile::TempDir;

    fn entry(name: &str, data_type: DataType, rank: u32, size: Dimensions) -> DcEntry {
        DcEntry {
            name: name.to_string(),
            data_type,
            rank,
            size,
            has_domain: false,
        }
    }

    #[test]
    fn test_paths() {
        assert_eq!(dataset_group_path(3, "fields/e"), "/3/fields/e");
        assert_eq!(dataset_path(3, "fields/e"), "/3/fields/e/e");
        assert_eq!(dataset_path(-1, "data"), "/-1/data/data");
        assert!(validate_name("fields/e").is_ok());
        assert!(validate_name("a/b/a").is_ok());
        for bad in ["", "/a", "a/", "a//b", "_hidden", "a/_b", "a/a", "x/y/y"] {
            assert!(validate_name(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_catalog_scan() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());
        let mut container = Container::create(&io, "a.dcol").await.unwrap();
        for (id, name) in [(10, "data"), (2, "fields/e"), (2, "fields"), (2, "pos")] {
            container
                .create_dataset(
                    &dataset_path(id, name),
                    &DatasetSpec::new(DataType::F32, 1, Dimensions::new(4, 1, 1)),
                )
                .await
                .unwrap();
        }
        container.create_group("/notanid").unwrap();

        let mut catalog = Catalog::new();
        assert_eq!(catalog.ids(&container).unwrap(), &[2, 10]);
        assert_eq!(catalog.max_id(&container).unwrap(), 10);
        let names: Vec<&str> = catalog
            .entries(&container, 2)
            .unwrap()
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(names, vec!["fields", "fields/e", "pos"]);
        assert_eq!(
            catalog.entries(&container, 7).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_merge_entries() {
        let topology = Dimensions::new(2, 1, 1);
        let a = vec![
            entry("p", DataType::F32, 1, Dimensions::new(3, 1, 1)),
            entry("g", DataType::U8, 2, Dimensions::new(4, 5, 1)),
        ];
        let b = vec![
            entry("p", DataType::F32, 1, Dimensions::new(7, 1, 1)),
            entry("g", DataType::U8, 2, Dimensions::new(4, 5, 1)),
        ];
        let merged = merge_entries(topology, &[a.clone(), b]).unwrap();
        assert_eq!(merged[0].name, "g");
        assert_eq!(merged[0].size, Dimensions::new(8, 5, 1));
        assert_eq!(merged[1].size, Dimensions::new(10, 1, 1));

        let c = vec![entry("p", DataType::F64, 1, Dimensions::new(3, 1, 1))];
        let err = merge_entries(topology, &[a, c]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InconsistentFileset);
    }

    #[test]
    fn test_merged_shape_rules() {
        let sizes = [Dimensions::new(4, 5, 1), Dimensions::new(4, 6, 1)];
        assert_eq!(
            merged_shape(2, Dimensions::new(2, 1, 1), &sizes).unwrap_err().kind(),
            ErrorKind::InconsistentFileset
        );
        assert_eq!(
            merged_shape(2, Dimensions::new(1, 1, 2), &sizes[..1]).unwrap_err().kind(),
            ErrorKind::TopologyMismatch
        );
    }
}
