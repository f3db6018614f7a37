//! Chunked dataset storage
//!
//! All public entry points take logical [`Dimensions`] and convert them to
//! back-end order here, once.

use super::node::{BlobRef, ChunkStorage, DatasetNode, Node, RegionSpec};
use super::Container;
use crate::compression::FilterPipeline;
use crate::dims::{copy_hyperslab, for_each_row, pitches, Dimensions, Hyperslab};
use crate::error::{DcError, Result};
use crate::layout::{plan_chunks, ChunkGrid};
use crate::types::DataType;
use crate::utils::format_bytes;
use std::collections::BTreeMap;
use tracing::debug;

/// Chunk extent used for extensible 1-D datasets
pub const APPEND_CHUNK_ELEMENTS: u64 = 4096;

/// How chunk bytes are allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageLayout {
    /// Chunks are encoded and appended when written
    #[default]
    Chunked,
    /// Raw chunk slots are reserved up front, so several writers can fill
    /// disjoint parts of the dataset independently
    Preallocated,
}

/// Parameters of a new dataset
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSpec {
    pub data_type: DataType,
    pub rank: u32,
    pub size: Dimensions,
    pub extensible: bool,
    pub filters: FilterPipeline,
    pub layout: StorageLayout,
}

impl DatasetSpec {
    pub fn new(data_type: DataType, rank: u32, size: Dimensions) -> Self {
        Self {
            data_type,
            rank,
            size,
            extensible: false,
            filters: FilterPipeline::none(),
            layout: StorageLayout::Chunked,
        }
    }

    pub fn with_filters(mut self, filters: FilterPipeline) -> Self {
        self.filters = filters;
        self
    }

    pub fn extensible(mut self) -> Self {
        self.extensible = true;
        self
    }

    pub fn preallocated(mut self) -> Self {
        self.layout = StorageLayout::Preallocated;
        self
    }
}

/// Type and logical shape of a stored dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetInfo {
    pub data_type: DataType,
    pub rank: u32,
    pub size: Dimensions,
}

impl DatasetInfo {
    pub fn num_elements(&self) -> u64 {
        self.size.scalar_size()
    }

    pub fn byte_len(&self) -> usize {
        self.size.scalar_size() as usize * self.data_type.size_in_bytes()
    }
}

/// Chunk geometry of one dataset, detached from the index
struct Geometry {
    elem: usize,
    grid: ChunkGrid,
    filters: FilterPipeline,
    slots: Option<(u64, u64)>,
}

impl Geometry {
    fn chunk_bytes(&self) -> usize {
        self.grid.chunk_elements() as usize * self.elem
    }
}

/// Intersection of a region with one chunk
struct ChunkPart {
    coords: Vec<u64>,
    /// Position inside the caller's region buffer
    in_region: Hyperslab,
    /// Position inside the chunk buffer
    in_chunk: Hyperslab,
    /// The part covers every in-bounds element of the chunk
    whole: bool,
}

fn chunk_parts(grid: &ChunkGrid, offset: &[u64], count: &[u64]) -> Vec<ChunkPart> {
    grid.overlapping(offset, count)
        .into_iter()
        .map(|coords| {
            let origin = grid.chunk_origin(&coords);
            let clipped = grid.chunk_data_range(&coords);
            let n = coords.len();
            let mut start = vec![0u64; n];
            let mut extent = vec![0u64; n];
            let mut whole = true;
            for axis in 0..n {
                let lo = offset[axis].max(origin[axis]);
                let hi = (offset[axis] + count[axis]).min(origin[axis] + grid.chunk()[axis]);
                start[axis] = lo;
                extent[axis] = hi - lo;
                whole &= lo == clipped[axis].0 && hi == clipped[axis].1;
            }
            let in_region = Hyperslab::dense(
                start.iter().zip(offset).map(|(s, o)| s - o).collect(),
                extent.clone(),
            );
            let in_chunk = Hyperslab::dense(
                start.iter().zip(origin.iter()).map(|(s, o)| s - o).collect(),
                extent,
            );
            ChunkPart {
                coords,
                in_region,
                in_chunk,
                whole,
            }
        })
        .collect()
}

fn check_offset_rank(offset: &Dimensions, rank: u32) -> Result<()> {
    for axis in rank as usize..3 {
        if offset.get(axis) != 0 {
            return Err(DcError::InvalidArgument(format!(
                "Offset {} is non-zero on axis {} beyond rank {}",
                offset, axis, rank
            )));
        }
    }
    Ok(())
}

impl Container {
    fn dataset_node(&self, path: &str) -> Result<&DatasetNode> {
        match self.node(path) {
            Some(Node::Dataset(dataset)) => Ok(dataset),
            Some(_) => Err(DcError::InvalidArgument(format!("{} is not a dataset", path))),
            None => Err(DcError::NotFound(format!("Dataset {}", path))),
        }
    }

    fn dataset_node_mut(&mut self, path: &str) -> Result<&mut DatasetNode> {
        match self.node_mut(path) {
            Some(Node::Dataset(dataset)) => Ok(dataset),
            Some(_) => Err(DcError::InvalidArgument(format!("{} is not a dataset", path))),
            None => Err(DcError::NotFound(format!("Dataset {}", path))),
        }
    }

    fn geometry(&self, path: &str) -> Result<Geometry> {
        let dataset = self.dataset_node(path)?;
        let slots = match &dataset.storage {
            ChunkStorage::Slots { base, slot_len } => Some((*base, *slot_len)),
            ChunkStorage::Blobs(_) => None,
        };
        Ok(Geometry {
            elem: dataset.data_type.size_in_bytes(),
            grid: ChunkGrid::new(dataset.shape.clone(), dataset.chunk.clone())?,
            filters: dataset.filters,
            slots,
        })
    }

    /// Create a chunked dataset, adding parent groups as needed
    pub async fn create_dataset(&mut self, path: &str, spec: &DatasetSpec) -> Result<()> {
        self.ensure_writable()?;
        if !(1..=3).contains(&spec.rank) {
            return Err(DcError::InvalidArgument(format!(
                "Rank must be 1, 2 or 3, got {}",
                spec.rank
            )));
        }
        spec.size.check_rank(spec.rank, "Dataset size")?;
        let elem = spec.data_type.size_in_bytes();
        if elem == 0 {
            return Err(DcError::InvalidArgument(format!(
                "Element type {} has no size",
                spec.data_type
            )));
        }
        if spec.extensible && (spec.rank != 1 || spec.layout == StorageLayout::Preallocated) {
            return Err(DcError::InvalidArgument(
                "Only chunked 1-D datasets can be extended".to_string(),
            ));
        }
        if spec.layout == StorageLayout::Preallocated && !spec.filters.is_identity() {
            return Err(DcError::Unsupported(
                "Preallocated datasets cannot be compressed".to_string(),
            ));
        }
        if self.exists(path) {
            return Err(DcError::InvalidArgument(format!("{} already exists", path)));
        }

        let shape = spec.size.to_physical(spec.rank);
        let chunk = if spec.extensible {
            plan_chunks(&[shape[0].max(APPEND_CHUNK_ELEMENTS)], elem)
        } else {
            plan_chunks(&shape, elem)
        };

        let storage = match spec.layout {
            StorageLayout::Chunked => ChunkStorage::Blobs(BTreeMap::new()),
            StorageLayout::Preallocated => {
                let grid = ChunkGrid::new(shape.clone(), chunk.clone())?;
                let slot_len = grid.chunk_elements() * elem as u64;
                let base = self.end;
                self.end += grid.total_chunks() * slot_len;
                if self.owns_index {
                    // the stale index may sit inside the new slots; slots must read as zero
                    if self.file.len().await? > base {
                        self.file.set_len(base).await?;
                    }
                    self.file.set_len(self.end).await?;
                }
                ChunkStorage::Slots { base, slot_len }
            }
        };

        debug!(
            file = %self.name,
            dataset = path,
            shape = ?shape,
            chunk = ?chunk,
            chunk_size = %format_bytes(chunk.iter().product::<u64>() * elem as u64),
            "created dataset"
        );

        self.insert_node(
            path,
            Node::Dataset(DatasetNode {
                data_type: spec.data_type,
                shape,
                chunk,
                filters: spec.filters,
                extensible: spec.extensible,
                storage,
                attributes: BTreeMap::new(),
            }),
        )
    }

    /// Type and logical shape of a dataset or reference
    pub fn dataset_info(&self, path: &str) -> Result<DatasetInfo> {
        match self.node(path) {
            Some(Node::Dataset(dataset)) => Ok(DatasetInfo {
                data_type: dataset.data_type,
                rank: dataset.rank(),
                size: Dimensions::from_physical(&dataset.shape)?,
            }),
            Some(Node::Reference(reference)) => {
                let target = self.dataset_node(&reference.target)?;
                let shape = match &reference.region {
                    Some(region) => &region.count,
                    None => &target.shape,
                };
                Ok(DatasetInfo {
                    data_type: target.data_type,
                    rank: target.rank(),
                    size: Dimensions::from_physical(shape)?,
                })
            }
            Some(_) => Err(DcError::InvalidArgument(format!("{} is not a dataset", path))),
            None => Err(DcError::NotFound(format!("Dataset {}", path))),
        }
    }

    /// Grow an extensible 1-D dataset by `count` elements, returning the old length
    pub fn extend(&mut self, path: &str, count: u64) -> Result<u64> {
        self.ensure_writable()?;
        let dataset = self.dataset_node_mut(path)?;
        if !dataset.extensible {
            return Err(DcError::InvalidArgument(format!("{} is not extensible", path)));
        }
        let old = dataset.shape[0];
        dataset.shape[0] += count;
        self.dirty = true;
        Ok(old)
    }

    /// Write a dense region of `count` elements at `offset`
    pub async fn write_region(
        &mut self,
        path: &str,
        offset: Dimensions,
        count: Dimensions,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_writable()?;
        let rank = self.dataset_node(path)?.rank();
        check_offset_rank(&offset, rank)?;
        count.check_rank(rank, "Write size")?;
        self.write_physical(path, &offset.to_physical(rank), &count.to_physical(rank), data)
            .await
    }

    /// Read a dense region of `count` elements at `offset`
    ///
    /// References are followed; unwritten chunks read as zeros.
    pub async fn read_region(
        &mut self,
        path: &str,
        offset: Dimensions,
        count: Dimensions,
    ) -> Result<Vec<u8>> {
        match self.node(path) {
            Some(Node::Dataset(dataset)) => {
                let rank = dataset.rank();
                check_offset_rank(&offset, rank)?;
                count.check_rank(rank, "Read size")?;
                self.read_physical(path, &offset.to_physical(rank), &count.to_physical(rank))
                    .await
            }
            Some(Node::Reference(_)) => {
                let (target, region) = self.reference(path)?;
                let rank = self.dataset_node(&target)?.rank();
                check_offset_rank(&offset, rank)?;
                count.check_rank(rank, "Read size")?;
                let offset = offset.to_physical(rank);
                let count = count.to_physical(rank);
                match region {
                    None => self.read_physical(&target, &offset, &count).await,
                    Some(region) => self.read_through_region(&target, &region, &offset, &count).await,
                }
            }
            Some(_) => Err(DcError::InvalidArgument(format!("{} is not a dataset", path))),
            None => Err(DcError::NotFound(format!("Dataset {}", path))),
        }
    }

    /// Read a whole dataset or reference
    pub async fn read_all(&mut self, path: &str) -> Result<(DatasetInfo, Vec<u8>)> {
        let info = self.dataset_info(path)?;
        let data = self.read_region(path, Dimensions::ZERO, info.size).await?;
        Ok((info, data))
    }

    async fn read_through_region(
        &mut self,
        target: &str,
        region: &RegionSpec,
        offset: &[u64],
        count: &[u64],
    ) -> Result<Vec<u8>> {
        if offset
            .iter()
            .zip(count)
            .zip(&region.count)
            .any(|((o, c), r)| o + c > *r)
        {
            return Err(DcError::InvalidArgument(format!(
                "Region read {:?}+{:?} exceeds referenced region {:?}",
                offset, count, region.count
            )));
        }
        let elem = self.dataset_node(target)?.data_type.size_in_bytes();
        let mut out = vec![0u8; count.iter().product::<u64>() as usize * elem];
        if count.iter().any(|&c| c == 0) {
            return Ok(out);
        }
        let start: Vec<u64> = (0..count.len())
            .map(|i| region.offset[i] + offset[i] * region.stride[i])
            .collect();
        let bounds: Vec<u64> = (0..count.len())
            .map(|i| (count[i] - 1) * region.stride[i] + 1)
            .collect();
        let dense = self.read_physical(target, &start, &bounds).await?;
        copy_hyperslab(
            &dense,
            &bounds,
            &Hyperslab::new(vec![0; count.len()], region.stride.clone(), count.to_vec()),
            &mut out,
            count,
            &Hyperslab::dense(vec![0; count.len()], count.to_vec()),
            elem,
        )?;
        Ok(out)
    }

    async fn load_chunk(&mut self, path: &str, geometry: &Geometry, coords: &[u64]) -> Result<Vec<u8>> {
        let chunk_bytes = geometry.chunk_bytes();
        if let Some((base, slot_len)) = geometry.slots {
            let slot = base + geometry.grid.coords_to_index(coords) * slot_len;
            return Ok(self.file.read_at(slot, slot_len as usize).await?.to_vec());
        }
        let blob = match &self.dataset_node(path)?.storage {
            ChunkStorage::Blobs(blobs) => blobs.get(coords).copied(),
            ChunkStorage::Slots { .. } => None,
        };
        match blob {
            Some(blob) => {
                let stored = self.file.read_at(blob.offset, blob.stored_len as usize).await?;
                geometry.filters.decode(&stored, geometry.elem, chunk_bytes)
            }
            None => Ok(vec![0u8; chunk_bytes]),
        }
    }

    async fn write_physical(
        &mut self,
        path: &str,
        offset: &[u64],
        count: &[u64],
        data: &[u8],
    ) -> Result<()> {
        let geometry = self.geometry(path)?;
        if !geometry.grid.is_in_bounds(offset, count) {
            return Err(DcError::InvalidArgument(format!(
                "Write of {:?} at {:?} exceeds dataset shape {:?}",
                count,
                offset,
                geometry.grid.shape()
            )));
        }
        let expected = count.iter().product::<u64>() as usize * geometry.elem;
        if data.len() != expected {
            return Err(DcError::ShapeMismatch(format!(
                "Write of {:?} elements needs {} bytes, got {}",
                count,
                expected,
                data.len()
            )));
        }

        let chunk_shape = geometry.grid.chunk().to_vec();
        for part in chunk_parts(&geometry.grid, offset, count) {
            match geometry.slots {
                None => {
                    let mut buf = if part.whole {
                        vec![0u8; geometry.chunk_bytes()]
                    } else {
                        self.load_chunk(path, &geometry, &part.coords).await?
                    };
                    copy_hyperslab(
                        data,
                        count,
                        &part.in_region,
                        &mut buf,
                        &chunk_shape,
                        &part.in_chunk,
                        geometry.elem,
                    )?;
                    let stored = geometry.filters.encode(&buf, geometry.elem)?;
                    self.store_blob(path, part.coords, &stored).await?;
                }
                Some((base, slot_len)) => {
                    let slot = base + geometry.grid.coords_to_index(&part.coords) * slot_len;
                    if part.whole {
                        let mut buf = vec![0u8; geometry.chunk_bytes()];
                        copy_hyperslab(
                            data,
                            count,
                            &part.in_region,
                            &mut buf,
                            &chunk_shape,
                            &part.in_chunk,
                            geometry.elem,
                        )?;
                        self.file.write_at(slot, &buf).await?;
                    } else {
                        // only touch this writer's bytes; other writers may share the chunk
                        for (file_offset, range) in
                            slot_rows(&part, count, &chunk_shape, slot, geometry.elem)
                        {
                            self.file.write_at(file_offset, &data[range]).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Write an encoded chunk, reusing the space of its previous version
    async fn store_blob(&mut self, path: &str, coords: Vec<u64>, stored: &[u8]) -> Result<()> {
        let len = stored.len() as u64;
        let previous = match &self.dataset_node(path)?.storage {
            ChunkStorage::Blobs(blobs) => blobs.get(&coords).copied(),
            ChunkStorage::Slots { .. } => None,
        };
        let blob = match previous {
            Some(old) if len <= old.capacity => BlobRef {
                stored_len: len,
                ..old
            },
            // the last blob of the data region grows in place
            Some(old) if old.offset + old.capacity == self.end => {
                self.end = old.offset + len;
                BlobRef {
                    offset: old.offset,
                    stored_len: len,
                    capacity: len,
                }
            }
            previous => {
                let capacity = previous.map_or(len, |old| len.max(old.capacity * 2));
                let blob = BlobRef {
                    offset: self.end,
                    stored_len: len,
                    capacity,
                };
                self.end += capacity;
                blob
            }
        };
        self.file.write_at(blob.offset, stored).await?;
        if let ChunkStorage::Blobs(blobs) = &mut self.dataset_node_mut(path)?.storage {
            blobs.insert(coords, blob);
        }
        self.dirty = true;
        Ok(())
    }

    async fn read_physical(&mut self, path: &str, offset: &[u64], count: &[u64]) -> Result<Vec<u8>> {
        let geometry = self.geometry(path)?;
        if !geometry.grid.is_in_bounds(offset, count) {
            return Err(DcError::InvalidArgument(format!(
                "Read of {:?} at {:?} exceeds dataset shape {:?}",
                count,
                offset,
                geometry.grid.shape()
            )));
        }
        let mut out = vec![0u8; count.iter().product::<u64>() as usize * geometry.elem];
        let chunk_shape = geometry.grid.chunk().to_vec();
        for part in chunk_parts(&geometry.grid, offset, count) {
            let buf = self.load_chunk(path, &geometry, &part.coords).await?;
            copy_hyperslab(
                &buf,
                &chunk_shape,
                &part.in_chunk,
                &mut out,
                count,
                &part.in_region,
                geometry.elem,
            )?;
        }
        Ok(out)
    }
}

/// File offsets and source byte ranges of every innermost row of a chunk part
fn slot_rows(
    part: &ChunkPart,
    count: &[u64],
    chunk_shape: &[u64],
    slot: u64,
    elem: usize,
) -> Vec<(u64, std::ops::Range<usize>)> {
    let last = count.len() - 1;
    let chunk_pitch = pitches(chunk_shape);
    let region_pitch = pitches(count);
    let run = part.in_chunk.count[last] as usize * elem;
    let mut rows = Vec::new();
    for_each_row(&part.in_chunk.count, |outer| {
        let mut in_chunk = part.in_chunk.offset[last];
        let mut in_region = part.in_region.offset[last];
        for axis in 0..last {
            in_chunk += (part.in_chunk.offset[axis] + outer[axis]) * chunk_pitch[axis];
            in_region += (part.in_region.offset[axis] + outer[axis]) * region_pitch[axis];
        }
        let start = in_region as usize * elem;
        rows.push((slot + in_chunk * elem as u64, start..start + run));
    });
    rows
}
