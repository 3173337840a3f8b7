use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — Memory layout of a tensor view (shape + strides + offset)
//
// The Layout decouples the logical shape of a tensor from how its data is
// arranged in a flat storage buffer. This is what makes slicing a fused
// gate block into per-gate views free: the view keeps the parent's strides
// and only changes shape and offset, so no data moves.
//
// KEY CONCEPTS:
//
// 1. **Strides**: elements to skip in flat storage to move one step along
//    each dimension. A contiguous [2,3] matrix has strides [3,1].
//
// 2. **Flat slice**: keep the parent strides, replace the shape, add an
//    element offset. Slicing columns [0, 2u) out of a [batch, 3u] gate
//    buffer yields shape [batch, 2u] with row stride still 3u — a strided,
//    non-contiguous view over the same storage.
//
// 3. **Narrow**: restrict one dimension to a sub-range. Slicing timestep t
//    out of a [T*batch, unit] rolling buffer is narrow(0, t*batch, batch):
//    dense rows, shifted offset.
//
// 4. **Contiguous vs dense**: contiguous means row-major strides and offset
//    zero (a whole buffer). Dense means row-major strides at any offset (a
//    narrow of dim 0). Matrix multiply accepts dense operands; arbitrary
//    strided views must be materialized first.
//
// 5. **Extent**: the farthest element a layout can touch. Every view must
//    keep offset + extent within the owning storage; violations surface as
//    SliceOutOfBounds instead of silently reading a neighbor slot.

/// Layout describes how a view's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    /// Element offset into the storage buffer where this view starts.
    offset: usize,
}

impl Layout {
    /// Create a new contiguous layout for the given shape.
    /// Strides are computed as row-major (C-order).
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a layout with explicit strides and offset (for views).
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Whether this layout is contiguous: row-major strides and offset 0.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Whether this layout is dense: row-major strides at any offset.
    /// Dense views (e.g. a timestep slice of the rolling hidden-state
    /// buffer) can feed matrix multiply without materialization.
    pub fn is_dense(&self) -> bool {
        self.strides == self.shape.stride_contiguous()
    }

    /// Number of storage elements this layout spans past its offset:
    /// 1 + sum((dim_i - 1) * stride_i). Zero for empty shapes.
    pub fn extent(&self) -> usize {
        if self.dims().iter().any(|&d| d == 0) {
            return 0;
        }
        1 + self
            .dims()
            .iter()
            .zip(self.strides.iter())
            .map(|(&d, &s)| (d - 1) * s)
            .sum::<usize>()
    }

    /// A view with a new shape at an element offset relative to this view,
    /// keeping this view's strides. This is how a fused [.., G*unit] gate
    /// block is split into per-gate views without copying.
    ///
    /// The caller (Tensor) validates the resulting extent against storage.
    pub fn slice_flat(&self, shape: Shape, elem_offset: usize) -> Result<Layout> {
        if shape.rank() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: shape.rank(),
            });
        }
        Ok(Layout::new(
            shape,
            self.strides.clone(),
            self.offset + elem_offset,
        ))
    }

    /// Narrow (slice) along a dimension. Returns a view layout into the
    /// same storage with adjusted shape and offset.
    ///
    /// Example: [4, 6] narrow(dim=1, start=2, len=3) gives shape [4, 3]
    /// with offset += 2 * stride[1].
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let dim_size = self.shape.dims()[dim];
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        new_dims[dim] = len;
        let new_offset = self.offset + start * self.strides[dim];
        Ok(Layout::new(
            Shape::new(new_dims),
            self.strides.clone(),
            new_offset,
        ))
    }

    /// A layout that reads a smaller contiguous operand as if it had
    /// `target` shape, repeating along broadcast dimensions (stride 0).
    /// Used to add a bias row over a whole gate block.
    pub fn broadcast_as(&self, target: &Shape) -> Result<Layout> {
        if !self.is_dense() {
            // Only dense sources broadcast; strided bias views do not occur.
            return Err(Error::msg("broadcast_as requires a dense source"));
        }
        if !self.shape.broadcasts_to(target) {
            return Err(Error::ShapeMismatch {
                expected: target.clone(),
                got: self.shape.clone(),
            });
        }
        let strides = self.shape.broadcast_strides(target);
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Iterator over all flat storage indices of this layout, in logical
    /// order. Handles non-contiguous layouts by walking multi-dimensional
    /// indices and converting via strides.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

// StridedIter — Iterates over flat storage indices respecting strides
//
// For a contiguous layout this counts offset, offset+1, offset+2, ...
// For a gate view it jumps over the neighboring gates' columns.
// Broadcast layouts (stride 0) revisit the same index along that axis.

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    /// Current multi-dimensional index (e.g., [0, 0]).
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        let rank = layout.rank();
        StridedIter {
            current: vec![0; rank],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            offset: layout.offset(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn flat_index(&self) -> usize {
        let mut idx = self.offset;
        for i in 0..self.current.len() {
            idx += self.current[i] * self.strides[i];
        }
        idx
    }

    /// Advance the multi-dimensional index by one (rightmost dim first).
    fn advance(&mut self) {
        let rank = self.dims.len();
        for i in (0..rank).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}
