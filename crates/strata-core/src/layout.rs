use crate::error::{Error, Result};
use crate::shape::{Format, Shape};

// Layout — Descriptor over a Volume's memory (shape + format + strides)
//
// A Volume hands out two descriptors over the same memory:
//
//   packed  — default row-major strides are implied; most kernels take this.
//   strided — strides are carried explicitly; kernels that address a
//             sub-region (channel partitions in concat/split) need this.
//
// Descriptors are metadata only. Narrowing one along the channel axis gives
// a strided view of a partition without touching the data:
//
//   [2, 6, 4, 4] narrow(axis=1, start=2, len=3)
//   → shape [2, 3, 4, 4], offset 2*16, strides unchanged [96, 16, 4, 1]

/// Describes how a Volume's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    format: Format,
    strides: Vec<usize>,
    /// Offset into storage where this view starts.
    offset: usize,
    explicit: bool,
}

impl Layout {
    /// Packed descriptor: strides are the implied row-major ones.
    pub fn packed(shape: Shape, format: Format) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            format,
            strides,
            offset: 0,
            explicit: false,
        }
    }

    /// Strided descriptor carrying explicit row-major strides.
    pub fn strided(shape: Shape, format: Format) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            format,
            strides,
            offset: 0,
            explicit: true,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn format(&self) -> Format {
        self.format
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

    /// Whether this descriptor carries explicit strides.
    pub fn is_strided(&self) -> bool {
        self.explicit
    }

    /// Check if the described region is packed (row-major, no gaps).
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Same region, explicit strides.
    pub fn to_strided(&self) -> Layout {
        Layout {
            explicit: true,
            ..self.clone()
        }
    }

    /// Narrow along one axis. The result is always a strided view.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Layout> {
        let rank = self.rank();
        if axis >= rank {
            return Err(Error::RankMismatch {
                expected: axis + 1,
                got: rank,
            });
        }
        let size = self.shape.dims()[axis];
        if start + len > size {
            return Err(Error::DimensionMismatch {
                axis,
                expected: size,
                got: start + len,
            });
        }
        Ok(Layout {
            shape: self.shape.with_dim(axis, len),
            format: self.format,
            strides: self.strides.clone(),
            offset: self.offset + start * self.strides[axis],
            explicit: true,
        })
    }

    /// Compute the flat index into storage for a multi-dimensional index.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Iterator over all flat indices of this layout, in logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
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

    /// Advance the multi-dimensional index by one (rightmost dimension first).
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
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
