//! Layout: shape, strides, and offset for tensor memory layout

use crate::error::{CopyError, Result};
use smallvec::SmallVec;
use std::fmt;

/// Stack allocation threshold for dimensions
/// Most tensors have 4 or fewer dimensions, so we stack-allocate up to 4
const STACK_DIMS: usize = 4;

/// Shape type: dimensions of a tensor
pub type Shape = SmallVec<[usize; STACK_DIMS]>;

/// Strides type: element offsets between consecutive elements along each dimension
/// Signed to support negative strides (e.g., for flipped views)
/// NOTE: Strides are in ELEMENTS, not bytes
pub type Strides = SmallVec<[isize; STACK_DIMS]>;

/// Layout describes the memory layout of a tensor view
///
/// Address of element at indices [i0, i1, ..., in]:
///   offset + i0 * strides[0] + i1 * strides[1] + ... + in * strides[n]
///
/// Strides may be zero (broadcast views, read side only) or negative.
#[derive(Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Strides,
    offset: usize,
}

impl Layout {
    /// Create a new contiguous (row-major/C-order) layout from a shape
    ///
    /// # Example
    /// ```
    /// use numr_copy::tensor::Layout;
    /// let layout = Layout::contiguous(&[2, 3, 4]);
    /// assert_eq!(layout.shape(), &[2, 3, 4]);
    /// assert_eq!(layout.strides(), &[12, 4, 1]);
    /// ```
    pub fn contiguous(shape: &[usize]) -> Self {
        let shape: Shape = shape.iter().copied().collect();
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a layout with explicit shape, strides, and offset
    pub fn new(shape: Shape, strides: Strides, offset: usize) -> Self {
        debug_assert_eq!(shape.len(), strides.len());
        Self {
            shape,
            strides,
            offset,
        }
    }

    /// Create a layout from slices, checking that ranks agree
    pub fn strided(shape: &[usize], strides: &[isize], offset: usize) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(CopyError::invalid_view(format!(
                "shape has {} dimensions but strides have {}",
                shape.len(),
                strides.len()
            )));
        }
        Ok(Self::new(
            SmallVec::from_slice(shape),
            SmallVec::from_slice(strides),
            offset,
        ))
    }

    /// Create a scalar (0-dimensional) layout
    pub fn scalar() -> Self {
        Self {
            shape: SmallVec::new(),
            strides: SmallVec::new(),
            offset: 0,
        }
    }

    /// Get the shape
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the strides
    #[inline]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    /// Get the offset
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of dimensions (rank)
    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements
    #[inline]
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if the layout is a scalar (0 dimensions)
    #[inline]
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// Check if memory is contiguous (row-major order, zero offset)
    pub fn is_contiguous(&self) -> bool {
        if self.is_scalar() {
            return true;
        }
        self.strides == contiguous_strides(&self.shape) && self.offset == 0
    }

    /// Normalize a dimension index (handle negative indices)
    pub fn normalize_dim(&self, d: isize) -> Option<usize> {
        let ndim = self.ndim() as isize;
        let idx = if d < 0 { ndim + d } else { d };
        if idx >= 0 && idx < ndim {
            Some(idx as usize)
        } else {
            None
        }
    }

    /// Compute the linear index (element offset) for given indices
    pub fn index(&self, indices: &[usize]) -> Option<usize> {
        if indices.len() != self.ndim() {
            return None;
        }

        for (idx, &dim) in indices.iter().zip(self.shape.iter()) {
            if *idx >= dim {
                return None;
            }
        }

        let mut linear = self.offset as isize;
        for (&idx, &stride) in indices.iter().zip(self.strides.iter()) {
            linear += idx as isize * stride;
        }

        usize::try_from(linear).ok()
    }

    /// Create a transposed layout (swap two dimensions)
    pub fn transpose(&self, dim0: isize, dim1: isize) -> Option<Self> {
        let d0 = self.normalize_dim(dim0)?;
        let d1 = self.normalize_dim(dim1)?;

        let mut new_shape = self.shape.clone();
        let mut new_strides = self.strides.clone();

        new_shape.swap(d0, d1);
        new_strides.swap(d0, d1);

        Some(Self {
            shape: new_shape,
            strides: new_strides,
            offset: self.offset,
        })
    }

    /// Reorder dimensions: output dimension `i` is input dimension `perm[i]`
    ///
    /// Returns None unless `perm` is a permutation of `0..ndim`.
    pub fn permute(&self, perm: &[usize]) -> Option<Self> {
        if perm.len() != self.ndim() {
            return None;
        }
        let mut seen: SmallVec<[bool; STACK_DIMS]> = SmallVec::from_elem(false, perm.len());
        for &p in perm {
            if p >= perm.len() || seen[p] {
                return None;
            }
            seen[p] = true;
        }

        Some(Self {
            shape: perm.iter().map(|&p| self.shape[p]).collect(),
            strides: perm.iter().map(|&p| self.strides[p]).collect(),
            offset: self.offset,
        })
    }

    /// Restrict dimension `dim` to `len` elements starting at `start`
    pub fn narrow(&self, dim: isize, start: usize, len: usize) -> Option<Self> {
        let d = self.normalize_dim(dim)?;
        if start.checked_add(len)? > self.shape[d] {
            return None;
        }
        let shift = start as isize * self.strides[d];
        let offset = usize::try_from(self.offset as isize + shift).ok()?;

        let mut shape = self.shape.clone();
        shape[d] = len;
        Some(Self {
            shape,
            strides: self.strides.clone(),
            offset,
        })
    }

    /// Reverse the element order along `dim` (negative stride)
    pub fn flip(&self, dim: isize) -> Option<Self> {
        let d = self.normalize_dim(dim)?;
        let mut offset = self.offset;
        if self.shape[d] > 1 {
            let last = (self.shape[d] - 1) as isize * self.strides[d];
            offset = usize::try_from(self.offset as isize + last).ok()?;
        }

        let mut strides = self.strides.clone();
        strides[d] = -strides[d];
        Some(Self {
            shape: self.shape.clone(),
            strides,
            offset,
        })
    }

    /// Create a broadcast layout to a target shape
    ///
    /// Returns None if shapes are not broadcastable
    pub fn broadcast_to(&self, target: &[usize]) -> Option<Self> {
        if target.len() < self.ndim() {
            return None;
        }

        let mut new_shape = Shape::new();
        let mut new_strides = Strides::new();

        // Pad with leading 1s
        let pad = target.len() - self.ndim();
        for &t in &target[..pad] {
            new_shape.push(t);
            new_strides.push(0);
        }

        for ((&s, &st), &t) in self
            .shape
            .iter()
            .zip(self.strides.iter())
            .zip(&target[pad..])
        {
            if s == t {
                new_shape.push(t);
                new_strides.push(st);
            } else if s == 1 {
                new_shape.push(t);
                new_strides.push(0);
            } else {
                return None;
            }
        }

        Some(Self::new(new_shape, new_strides, self.offset))
    }

    /// Smallest and largest element index reachable through this layout
    ///
    /// Returns `Ok(None)` for layouts with no elements. Fails if the extent
    /// overflows or reaches below element 0 of the allocation.
    pub fn extent(&self) -> Result<Option<(usize, usize)>> {
        if self.shape.contains(&0) {
            return Ok(None);
        }

        let overflow = || CopyError::invalid_view(format!("offset arithmetic overflows for {self:?}"));
        let mut min = self.offset as isize;
        let mut max = min;
        for (&dim, &stride) in self.shape.iter().zip(self.strides.iter()) {
            if dim > 1 {
                let end = stride.checked_mul(dim as isize - 1).ok_or_else(overflow)?;
                if end >= 0 {
                    max = max.checked_add(end).ok_or_else(overflow)?;
                } else {
                    min = min.checked_add(end).ok_or_else(overflow)?;
                }
            }
        }

        if min < 0 {
            return Err(CopyError::invalid_view(format!(
                "{self:?} reaches element {min}, before the start of its allocation"
            )));
        }
        Ok(Some((min as usize, max as usize)))
    }
}

/// Row-major strides for a shape
pub fn contiguous_strides(shape: &[usize]) -> Strides {
    let mut strides: Strides = SmallVec::with_capacity(shape.len());
    let mut stride = 1isize;

    for &dim in shape.iter().rev() {
        strides.push(stride);
        stride *= dim.max(1) as isize;
    }

    strides.reverse();
    strides
}

impl fmt::Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Layout {{ shape: {:?}, strides: {:?}, offset: {} }}",
            self.shape.as_slice(),
            self.strides.as_slice(),
            self.offset
        )
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.shape.as_slice())
    }
}
