//! Dimension and selection algebra
//!
//! [`Dimensions`] are logical extents with the x axis varying fastest in
//! memory. The container stores shapes slowest-axis first; [`Dimensions::swap_dims`]
//! is the only conversion between the two orders.

use crate::error::{DcError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// Up to three extents; trailing components beyond the rank are 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions(pub [u64; 3]);

impl Dimensions {
    pub const ONE: Self = Self([1, 1, 1]);
    pub const ZERO: Self = Self([0, 0, 0]);

    pub const fn new(x: u64, y: u64, z: u64) -> Self {
        Self([x, y, z])
    }

    pub fn x(&self) -> u64 {
        self.0[0]
    }

    pub fn y(&self) -> u64 {
        self.0[1]
    }

    pub fn z(&self) -> u64 {
        self.0[2]
    }

    /// Component `i`; out-of-range axes read as 1
    pub fn get(&self, i: usize) -> u64 {
        self.0.get(i).copied().unwrap_or(1)
    }

    pub fn set(&mut self, i: usize, value: u64) {
        if let Some(slot) = self.0.get_mut(i) {
            *slot = value;
        }
    }

    /// Product of all components
    pub fn scalar_size(&self) -> u64 {
        self.0.iter().product()
    }

    /// Highest axis with an extent above 1, counted from 1
    pub fn rank(&self) -> u32 {
        self.0
            .iter()
            .rposition(|&d| d > 1)
            .map(|i| i as u32 + 1)
            .unwrap_or(1)
    }

    pub fn any_zero(&self) -> bool {
        self.0.iter().any(|&d| d == 0)
    }

    /// Componentwise `self <= other`
    pub fn all_le(&self, other: &Self) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a <= b)
    }

    pub fn min(&self, other: &Self) -> Self {
        Self(std::array::from_fn(|i| self.0[i].min(other.0[i])))
    }

    pub fn max(&self, other: &Self) -> Self {
        Self(std::array::from_fn(|i| self.0[i].max(other.0[i])))
    }

    /// Componentwise ceiling division; a zero divisor yields zero
    pub fn div_ceil(&self, other: &Self) -> Self {
        Self(std::array::from_fn(|i| {
            if other.0[i] == 0 {
                0
            } else {
                self.0[i].div_ceil(other.0[i])
            }
        }))
    }

    /// Swap between logical and back-end axis order for a dataset of `rank`
    ///
    /// Rank 2 exchanges axes 0 and 1, rank 3 reverses all three. The
    /// operation is its own inverse.
    pub fn swap_dims(&self, rank: u32) -> Self {
        let [x, y, z] = self.0;
        match rank {
            2 => Self([y, x, z]),
            3 => Self([z, y, x]),
            _ => *self,
        }
    }

    /// Back-end shape vector of length `rank`
    pub fn to_physical(&self, rank: u32) -> Vec<u64> {
        let swapped = self.swap_dims(rank);
        swapped.0[..rank.clamp(1, 3) as usize].to_vec()
    }

    /// Inverse of [`Dimensions::to_physical`]
    pub fn from_physical(shape: &[u64]) -> Result<Self> {
        if shape.is_empty() || shape.len() > 3 {
            return Err(DcError::InvalidArgument(format!(
                "Back-end shape must have 1 to 3 axes, got {}",
                shape.len()
            )));
        }
        let mut dims = Self::ONE;
        dims.0[..shape.len()].copy_from_slice(shape);
        Ok(dims.swap_dims(shape.len() as u32))
    }

    /// Linear index of `pos` in a grid of this shape, x fastest
    pub fn position_to_index(&self, pos: &Dimensions) -> u64 {
        pos.x() + pos.y() * self.x() + pos.z() * self.x() * self.y()
    }

    /// Inverse of [`Dimensions::position_to_index`]
    pub fn index_to_position(&self, index: u64) -> Dimensions {
        let x = self.x().max(1);
        let y = self.y().max(1);
        Dimensions::new(index % x, (index / x) % y, index / (x * y))
    }

    /// Check that components at or beyond `rank` are 1
    pub fn check_rank(&self, rank: u32, what: &str) -> Result<()> {
        for axis in rank as usize..3 {
            if self.0[axis] != 1 {
                return Err(DcError::InvalidArgument(format!(
                    "{} {} has extent {} on axis {} beyond rank {}",
                    what, self, self.0[axis], axis, rank
                )));
            }
        }
        Ok(())
    }

    /// Iterate all positions of a grid of this shape, x fastest
    pub fn positions(&self) -> impl Iterator<Item = Dimensions> + '_ {
        (0..self.scalar_size()).map(move |i| self.index_to_position(i))
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::ONE
    }
}

impl From<[u64; 3]> for Dimensions {
    fn from(value: [u64; 3]) -> Self {
        Self(value)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.0[0], self.0[1], self.0[2])
    }
}

macro_rules! componentwise {
    ($trait:ident, $method:ident, $op:tt) => {
        impl $trait for Dimensions {
            type Output = Dimensions;

            fn $method(self, rhs: Dimensions) -> Dimensions {
                Dimensions(std::array::from_fn(|i| self.0[i] $op rhs.0[i]))
            }
        }
    };
}

componentwise!(Add, add, +);
componentwise!(Mul, mul, *);

impl Sub for Dimensions {
    type Output = Dimensions;

    /// Saturating componentwise difference
    fn sub(self, rhs: Dimensions) -> Dimensions {
        Dimensions(std::array::from_fn(|i| self.0[i].saturating_sub(rhs.0[i])))
    }
}

/// Sub-array of a source buffer: `size` elements taken at `offset`, every
/// `stride` elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Shape of the whole source buffer
    pub src_buffer: Dimensions,
    /// Logical extent of the selected data
    pub size: Dimensions,
    /// Start of the selection inside the source buffer
    pub offset: Dimensions,
    /// Sampling step per axis
    pub stride: Dimensions,
}

impl Selection {
    /// Select the whole buffer densely
    pub fn new(src_buffer: Dimensions) -> Self {
        Self {
            src_buffer,
            size: src_buffer,
            offset: Dimensions::ZERO,
            stride: Dimensions::ONE,
        }
    }

    pub fn with_size(mut self, size: Dimensions) -> Self {
        self.size = size;
        self
    }

    pub fn with_offset(mut self, offset: Dimensions) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_stride(mut self, stride: Dimensions) -> Self {
        self.stride = stride;
        self
    }

    /// True if the selection covers the whole source buffer densely
    pub fn is_whole(&self) -> bool {
        self.size == self.src_buffer && self.offset == Dimensions::ZERO && self.stride == Dimensions::ONE
    }

    /// Check stride and bounds against the source buffer
    pub fn validate(&self) -> Result<()> {
        for axis in 0..3 {
            let (src, size, offset, stride) = (
                self.src_buffer.0[axis],
                self.size.0[axis],
                self.offset.0[axis],
                self.stride.0[axis],
            );
            if stride == 0 {
                return Err(DcError::InvalidArgument(format!(
                    "Stride must be at least 1, got {}",
                    self.stride
                )));
            }
            let fits = if size == 0 {
                offset <= src
            } else {
                offset + (size - 1) * stride < src
            };
            if !fits {
                return Err(DcError::InvalidArgument(format!(
                    "Selection of size {} at offset {} with stride {} exceeds source buffer {}",
                    self.size, self.offset, self.stride, self.src_buffer
                )));
            }
        }
        Ok(())
    }

    /// Pack the selected elements of `buf` densely, x fastest
    pub fn gather<'a>(&self, buf: &'a [u8], elem_size: usize) -> Result<Cow<'a, [u8]>> {
        self.validate()?;
        let src_len = self.src_buffer.scalar_size() as usize * elem_size;
        if buf.len() < src_len {
            return Err(DcError::ShapeMismatch(format!(
                "Source buffer holds {} bytes, selection source {} needs {}",
                buf.len(),
                self.src_buffer,
                src_len
            )));
        }
        if self.is_whole() {
            return Ok(Cow::Borrowed(&buf[..src_len]));
        }
        let count = self.size.to_physical(3);
        let mut out = vec![0u8; self.size.scalar_size() as usize * elem_size];
        copy_hyperslab(
            buf,
            &self.src_buffer.to_physical(3),
            &Hyperslab::new(self.offset.to_physical(3), self.stride.to_physical(3), count.clone()),
            &mut out,
            &count,
            &Hyperslab::dense(vec![0; 3], count.clone()),
            elem_size,
        )?;
        Ok(Cow::Owned(out))
    }
}

/// Back-end hyperslab, slowest axis first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hyperslab {
    pub offset: Vec<u64>,
    pub stride: Vec<u64>,
    pub count: Vec<u64>,
}

impl Hyperslab {
    pub fn new(offset: Vec<u64>, stride: Vec<u64>, count: Vec<u64>) -> Self {
        Self { offset, stride, count }
    }

    pub fn dense(offset: Vec<u64>, count: Vec<u64>) -> Self {
        let stride = vec![1; count.len()];
        Self { offset, stride, count }
    }

    pub fn num_elements(&self) -> u64 {
        self.count.iter().product()
    }

    /// Check that the hyperslab lies inside a buffer of `shape`
    pub fn check_within(&self, shape: &[u64]) -> Result<()> {
        let n = shape.len();
        if self.offset.len() != n || self.stride.len() != n || self.count.len() != n {
            return Err(DcError::InvalidArgument(format!(
                "Hyperslab rank does not match buffer rank {}",
                n
            )));
        }
        if self.count.iter().any(|&c| c == 0) {
            return Ok(());
        }
        for axis in 0..n {
            let last = self.offset[axis] + (self.count[axis] - 1) * self.stride[axis];
            if self.stride[axis] == 0 || last >= shape[axis] {
                return Err(DcError::InvalidArgument(format!(
                    "Hyperslab {:?}+{:?}*{:?} exceeds shape {:?}",
                    self.offset, self.count, self.stride, shape
                )));
            }
        }
        Ok(())
    }
}

/// Elements between successive indices along each axis of a C-order shape
pub(crate) fn pitches(shape: &[u64]) -> Vec<u64> {
    let mut pitch = vec![1u64; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        pitch[axis] = pitch[axis + 1] * shape[axis + 1];
    }
    pitch
}

/// Visit the start index of every innermost row of `count`
///
/// The callback receives the outer indices (all axes but the last).
pub(crate) fn for_each_row(count: &[u64], mut f: impl FnMut(&[u64])) {
    if count.is_empty() || count.iter().any(|&c| c == 0) {
        return;
    }
    let outer = count.len() - 1;
    let mut idx = vec![0u64; outer];
    loop {
        f(&idx);
        let mut axis = outer;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < count[axis] {
                break;
            }
            idx[axis] = 0;
        }
    }
}

/// Copy a hyperslab between two C-order buffers
///
/// Both hyperslabs must select the same `count`. Runs along the innermost
/// axis are copied with a single memcpy when both strides there are 1.
pub fn copy_hyperslab(
    src: &[u8],
    src_shape: &[u64],
    src_slab: &Hyperslab,
    dst: &mut [u8],
    dst_shape: &[u64],
    dst_slab: &Hyperslab,
    elem_size: usize,
) -> Result<()> {
    if src_slab.count != dst_slab.count {
        return Err(DcError::ShapeMismatch(format!(
            "Source selects {:?}, destination selects {:?}",
            src_slab.count, dst_slab.count
        )));
    }
    src_slab.check_within(src_shape)?;
    dst_slab.check_within(dst_shape)?;
    let src_needed = src_shape.iter().product::<u64>() as usize * elem_size;
    let dst_needed = dst_shape.iter().product::<u64>() as usize * elem_size;
    if src.len() < src_needed || dst.len() < dst_needed {
        return Err(DcError::ShapeMismatch(format!(
            "Buffers of {} and {} bytes are too small for shapes {:?} and {:?}",
            src.len(),
            dst.len(),
            src_shape,
            dst_shape
        )));
    }

    let n = src_shape.len();
    let last = n - 1;
    let src_pitch = pitches(src_shape);
    let dst_pitch = pitches(dst_shape);
    let run = src_slab.count[last] as usize;
    let contiguous = src_slab.stride[last] == 1 && dst_slab.stride[last] == 1;

    for_each_row(&src_slab.count, |outer| {
        let mut s = src_slab.offset[last] * src_pitch[last];
        let mut d = dst_slab.offset[last] * dst_pitch[last];
        for axis in 0..last {
            s += (src_slab.offset[axis] + outer[axis] * src_slab.stride[axis]) * src_pitch[axis];
            d += (dst_slab.offset[axis] + outer[axis] * dst_slab.stride[axis]) * dst_pitch[axis];
        }
        let (s, d) = (s as usize * elem_size, d as usize * elem_size);
        if contiguous {
            dst[d..d + run * elem_size].copy_from_slice(&src[s..s + run * elem_size]);
        } else {
            let s_step = src_slab.stride[last] as usize * elem_size;
            let d_step = dst_slab.stride[last] as usize * elem_size;
            for k in 0..run {
                let (so, dof) = (s + k * s_step, d + k * d_step);
                dst[dof..dof + elem_size].copy_from_slice(&src[so..so + elem_size]);
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_detection() {
        assert_eq!(Dimensions::new(1, 1, 1).rank(), 1);
        assert_eq!(Dimensions::new(7, 1, 1).rank(), 1);
        assert_eq!(Dimensions::new(7, 3, 1).rank(), 2);
        assert_eq!(Dimensions::new(1, 1, 4).rank(), 3);
        assert_eq!(Dimensions::new(0, 1, 1).rank(), 1);
    }

    #[test]
    fn test_swap_dims() {
        let d = Dimensions::new(2, 3, 4);
        assert_eq!(d.swap_dims(1), d);
        assert_eq!(d.swap_dims(2), Dimensions::new(3, 2, 4));
        assert_eq!(d.swap_dims(3), Dimensions::new(4, 3, 2));
        assert_eq!(d.swap_dims(3).swap_dims(3), d);
        assert_eq!(d.to_physical(3), vec![4, 3, 2]);
        assert_eq!(Dimensions::new(5, 6, 1).to_physical(2), vec![6, 5]);
        assert_eq!(Dimensions::from_physical(&[6, 5]).unwrap(), Dimensions::new(5, 6, 1));
    }

    #[test]
    fn test_index_position() {
        let grid = Dimensions::new(2, 3, 4);
        for i in 0..grid.scalar_size() {
            assert_eq!(grid.position_to_index(&grid.index_to_position(i)), i);
        }
        assert_eq!(grid.index_to_position(7), Dimensions::new(1, 0, 1));
        let order: Vec<_> = Dimensions::new(2, 2, 1).positions().collect();
        assert_eq!(order[1], Dimensions::new(1, 0, 0));
        assert_eq!(order[2], Dimensions::new(0, 1, 0));
    }

    #[test]
    fn test_componentwise_ops() {
        let a = Dimensions::new(4, 5, 6);
        let b = Dimensions::new(1, 2, 3);
        assert_eq!(a + b, Dimensions::new(5, 7, 9));
        assert_eq!(a - b, Dimensions::new(3, 3, 3));
        assert_eq!(b - a, Dimensions::ZERO);
        assert_eq!(a * b, Dimensions::new(4, 10, 18));
        assert_eq!(a.div_ceil(&Dimensions::new(2, 2, 4)), Dimensions::new(2, 3, 2));
    }

    #[test]
    fn test_selection_bounds() {
        let src = Dimensions::new(5, 5, 5);
        let strided = Selection::new(src)
            .with_size(Dimensions::new(3, 3, 3))
            .with_stride(Dimensions::new(2, 2, 2));
        assert!(strided.validate().is_ok());

        let too_far = Selection::new(src)
            .with_size(Dimensions::new(3, 1, 1))
            .with_offset(Dimensions::new(3, 0, 0));
        assert!(too_far.validate().is_err());

        let zero_stride = Selection::new(src).with_stride(Dimensions::new(0, 1, 1));
        assert!(zero_stride.validate().is_err());
    }

    #[test]
    fn test_gather_strided() {
        let src = Dimensions::new(4, 3, 1);
        let buf: Vec<u8> = (0..12).collect();
        let sel = Selection::new(src)
            .with_size(Dimensions::new(2, 2, 1))
            .with_offset(Dimensions::new(1, 0, 0))
            .with_stride(Dimensions::new(2, 2, 1));
        let packed = sel.gather(&buf, 1).unwrap();
        assert_eq!(&packed[..], &[1, 3, 9, 11]);
    }

    #[test]
    fn test_gather_whole_borrows() {
        let buf = vec![1u8, 2, 3, 4];
        let sel = Selection::new(Dimensions::new(2, 1, 1));
        let packed = sel.gather(&buf, 2).unwrap();
        assert!(matches!(packed, Cow::Borrowed(_)));
        assert_eq!(&packed[..], &buf[..]);
    }

    #[test]
    fn test_copy_hyperslab_into_offset() {
        let src: Vec<u8> = (1..=4).collect();
        let mut dst = vec![0u8; 9];
        copy_hyperslab(
            &src,
            &[2, 2],
            &Hyperslab::dense(vec![0, 0], vec![2, 2]),
            &mut dst,
            &[3, 3],
            &Hyperslab::dense(vec![1, 1], vec![2, 2]),
            1,
        )
        .unwrap();
        assert_eq!(dst, vec![0, 0, 0, 0, 1, 2, 0, 3, 4]);
    }

    #[test]
    fn test_copy_hyperslab_rejects_count_mismatch() {
        let src = vec![0u8; 4];
        let mut dst = vec![0u8; 4];
        let result = copy_hyperslab(
            &src,
            &[4],
            &Hyperslab::dense(vec![0], vec![2]),
            &mut dst,
            &[4],
            &Hyperslab::dense(vec![0], vec![3]),
            1,
        );
        assert!(result.is_err());
    }
}
