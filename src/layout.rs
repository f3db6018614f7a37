//! Chunk planning and chunk-grid geometry
//!
//! Datasets are stored as a regular grid of chunks. Shapes here are in
//! back-end order (slowest axis first).

use crate::error::{DcError, Result};
use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// Target chunk sizes in bytes, largest first
pub const CHUNK_BANDS: [u64; 7] = [
    4 * MIB,
    2 * MIB,
    MIB,
    MIB / 2,
    MIB / 4,
    MIB / 8,
    MIB / 16,
];

/// Largest chunk band not exceeding half the dataset, or the smallest band
pub fn target_chunk_bytes(dataset_bytes: u64) -> u64 {
    let half = dataset_bytes / 2;
    CHUNK_BANDS
        .iter()
        .copied()
        .find(|&band| band <= half)
        .unwrap_or(CHUNK_BANDS[CHUNK_BANDS.len() - 1])
}

/// Compute a chunk shape for a dataset of `extents`
///
/// Starts from one element per axis and doubles along the axis with the
/// most remaining chunks until the next step would exceed the target band.
/// Every axis satisfies `1 <= chunk[i] <= max(extents[i], 1)`.
pub fn plan_chunks(extents: &[u64], elem_size: usize) -> Vec<u64> {
    let elem_size = elem_size.max(1) as u64;
    let mut chunk = vec![1u64; extents.len()];
    let total: u64 = extents.iter().product::<u64>() * elem_size;
    if total == 0 {
        return chunk;
    }
    let target = target_chunk_bytes(total);

    loop {
        let chunk_bytes: u64 = chunk.iter().product::<u64>() * elem_size;
        let mut axes: Vec<usize> = (0..extents.len()).filter(|&i| chunk[i] < extents[i]).collect();
        // most remaining chunks first; ties go to the slower axis
        axes.sort_by(|&a, &b| {
            let ra = extents[a].div_ceil(chunk[a]);
            let rb = extents[b].div_ceil(chunk[b]);
            rb.cmp(&ra).then(a.cmp(&b))
        });

        let grown = axes.into_iter().find_map(|axis| {
            let next = (chunk[axis] * 2).min(extents[axis]);
            let next_bytes = chunk_bytes / chunk[axis] * next;
            (next_bytes <= target).then_some((axis, next))
        });

        match grown {
            Some((axis, next)) => chunk[axis] = next,
            None => return chunk,
        }
    }
}

/// A dataset shape split into chunks of a fixed shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGrid {
    shape: Vec<u64>,
    chunk: Vec<u64>,
}

impl ChunkGrid {
    pub fn new(shape: Vec<u64>, chunk: Vec<u64>) -> Result<Self> {
        if shape.len() != chunk.len() || shape.is_empty() {
            return Err(DcError::InvalidArgument(format!(
                "Chunk shape {:?} does not match dataset shape {:?}",
                chunk, shape
            )));
        }
        if chunk.iter().any(|&c| c == 0) {
            return Err(DcError::InvalidArgument(format!(
                "Chunk shape {:?} has a zero extent",
                chunk
            )));
        }
        Ok(Self { shape, chunk })
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn chunk(&self) -> &[u64] {
        &self.chunk
    }

    /// Elements in one full chunk
    pub fn chunk_elements(&self) -> u64 {
        self.chunk.iter().product()
    }

    /// Number of chunks along each axis
    pub fn chunk_count(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(self.chunk.iter())
            .map(|(&s, &c)| s.div_ceil(c))
            .collect()
    }

    pub fn total_chunks(&self) -> u64 {
        self.chunk_count().iter().product()
    }

    /// Convert chunk coordinates to a linear chunk index
    pub fn coords_to_index(&self, coords: &[u64]) -> u64 {
        let counts = self.chunk_count();
        let mut index = 0;
        for (i, &coord) in coords.iter().enumerate() {
            let stride: u64 = counts.iter().skip(i + 1).product();
            index += coord * stride;
        }
        index
    }

    /// Element origin of the chunk at `coords`
    pub fn chunk_origin(&self, coords: &[u64]) -> Vec<u64> {
        coords.iter().zip(self.chunk.iter()).map(|(&c, &n)| c * n).collect()
    }

    /// Element range `[start, end)` per axis of a chunk, clipped to the shape
    pub fn chunk_data_range(&self, coords: &[u64]) -> Vec<(u64, u64)> {
        coords
            .iter()
            .enumerate()
            .map(|(i, &coord)| {
                let start = coord * self.chunk[i];
                let end = (start + self.chunk[i]).min(self.shape[i]);
                (start, end)
            })
            .collect()
    }

    /// Coordinates of all chunks that overlap the region `[offset, offset+count)`
    pub fn overlapping(&self, offset: &[u64], count: &[u64]) -> Vec<Vec<u64>> {
        if count.iter().any(|&c| c == 0) {
            return Vec::new();
        }
        let ranges: Vec<(u64, u64)> = (0..self.shape.len())
            .map(|i| {
                let first = offset[i] / self.chunk[i];
                let last = (offset[i] + count[i] - 1) / self.chunk[i];
                (first, last)
            })
            .collect();

        let mut result = Vec::new();
        let mut coords: Vec<u64> = ranges.iter().map(|r| r.0).collect();
        loop {
            result.push(coords.clone());
            let mut axis = coords.len();
            loop {
                if axis == 0 {
                    return result;
                }
                axis -= 1;
                if coords[axis] < ranges[axis].1 {
                    coords[axis] += 1;
                    break;
                }
                coords[axis] = ranges[axis].0;
            }
        }
    }

    /// Check that a region lies inside the shape
    pub fn is_in_bounds(&self, offset: &[u64], count: &[u64]) -> bool {
        offset.len() == self.shape.len()
            && count.len() == self.shape.len()
            && (0..self.shape.len()).all(|i| offset[i] + count[i] <= self.shape[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> ChunkGrid {
        ChunkGrid::new(vec![1000, 800, 500], vec![64, 64, 64]).unwrap()
    }

    #[test]
    fn test_target_band() {
        assert_eq!(target_chunk_bytes(100 * MIB), 4 * MIB);
        assert_eq!(target_chunk_bytes(3 * MIB), MIB);
        assert_eq!(target_chunk_bytes(16), MIB / 16);
    }

    #[test]
    fn test_plan_small_dataset_is_one_chunk() {
        assert_eq!(plan_chunks(&[10], 4), vec![10]);
        assert_eq!(plan_chunks(&[5, 20, 10], 4), vec![5, 20, 10]);
    }

    #[test]
    fn test_plan_bounds() {
        for extents in [vec![1_000_000u64], vec![3000, 3000], vec![512, 512, 512], vec![1, 7, 100_000]] {
            for elem in [1usize, 4, 8] {
                let chunk = plan_chunks(&extents, elem);
                assert_eq!(chunk.len(), extents.len());
                for (c, e) in chunk.iter().zip(extents.iter()) {
                    assert!(*c >= 1 && c <= e);
                }
                let bytes: u64 = chunk.iter().product::<u64>() * elem as u64;
                assert!(bytes <= 4 * MIB);
            }
        }
    }

    #[test]
    fn test_plan_empty_extent() {
        assert_eq!(plan_chunks(&[0, 10], 4), vec![1, 1]);
    }

    #[test]
    fn test_chunk_count() {
        let grid = grid();
        assert_eq!(grid.chunk_count(), vec![16, 13, 8]);
        assert_eq!(grid.total_chunks(), 16 * 13 * 8);
    }

    #[test]
    fn test_chunk_index_conversion() {
        let grid = grid();
        assert_eq!(grid.coords_to_index(&[0, 0, 0]), 0);
        assert_eq!(grid.coords_to_index(&[5, 7, 3]), 5 * 13 * 8 + 7 * 8 + 3);
    }

    #[test]
    fn test_chunk_data_range() {
        let grid = grid();
        assert_eq!(grid.chunk_data_range(&[0, 0, 0]), vec![(0, 64), (0, 64), (0, 64)]);
        assert_eq!(
            grid.chunk_data_range(&[15, 12, 7]),
            vec![(960, 1000), (768, 800), (448, 500)]
        );
    }

    #[test]
    fn test_overlapping_chunks() {
        let grid = ChunkGrid::new(vec![10, 10], vec![4, 4]).unwrap();
        let chunks = grid.overlapping(&[3, 0], &[2, 5]);
        assert_eq!(chunks, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
        assert!(grid.overlapping(&[0, 0], &[0, 5]).is_empty());
        assert!(grid.is_in_bounds(&[6, 6], &[4, 4]));
        assert!(!grid.is_in_bounds(&[7, 6], &[4, 4]));
    }
}
