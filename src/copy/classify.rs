//! Layout classification and dimension merging

use super::resolve::BroadcastPlan;
use crate::tensor::{Shape, Strides};
use smallvec::SmallVec;

/// Access pattern of a copy after dimension merging
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CopyClass {
    /// Both sides are one dense run: bulk path
    Contiguous,
    /// Strided access, every source element read once
    StridedNoBroadcast,
    /// Strided access with at least one broadcast source dimension
    StridedBroadcast,
}

/// Reduced iteration space of a step
///
/// Row-major: the last dimension varies fastest. Strides are in elements of
/// the respective tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IterDesc {
    /// Iteration shape
    pub shape: Shape,
    /// Source strides per dimension
    pub src_strides: Strides,
    /// Destination strides per dimension
    pub dst_strides: Strides,
}

impl IterDesc {
    /// Build from slices of equal length
    pub fn new(shape: &[usize], src_strides: &[isize], dst_strides: &[isize]) -> Self {
        debug_assert_eq!(shape.len(), src_strides.len());
        debug_assert_eq!(shape.len(), dst_strides.len());
        Self {
            shape: SmallVec::from_slice(shape),
            src_strides: SmallVec::from_slice(src_strides),
            dst_strides: SmallVec::from_slice(dst_strides),
        }
    }

    /// A dense run of `len` elements on both sides
    pub fn linear(len: usize) -> Self {
        Self::new(&[len], &[1], &[1])
    }

    /// Number of dimensions
    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements visited
    #[inline]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Classification result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classified {
    /// Access pattern
    pub class: CopyClass,
    /// Merged iteration space
    pub iter: IterDesc,
}

/// Classify a resolved copy
pub fn classify(plan: &BroadcastPlan) -> Classified {
    classify_strides(&plan.shape, &plan.src_strides, &plan.dst_strides)
}

/// Classify an arbitrary (shape, source strides, destination strides) triple
///
/// Size-1 dimensions are dropped, then adjacent dimensions `i, i + 1` merge
/// when `stride[i] == stride[i + 1] * shape[i + 1]` holds for both tensors.
pub fn classify_strides(shape: &[usize], src_strides: &[isize], dst_strides: &[isize]) -> Classified {
    if shape.contains(&0) {
        return Classified {
            class: CopyClass::Contiguous,
            iter: IterDesc::linear(0),
        };
    }

    let mut merged: SmallVec<[(usize, isize, isize); 8]> = SmallVec::new();
    for ((&n, &ss), &ds) in shape.iter().zip(src_strides).zip(dst_strides) {
        if n == 1 {
            continue;
        }
        if let Some(last) = merged.last_mut() {
            let (outer, outer_ss, outer_ds) = *last;
            if outer_ss == ss * n as isize && outer_ds == ds * n as isize {
                *last = (outer * n, ss, ds);
                continue;
            }
        }
        merged.push((n, ss, ds));
    }

    if merged.is_empty() {
        // Scalar or all-ones shape: a single element
        return Classified {
            class: CopyClass::Contiguous,
            iter: IterDesc::linear(1),
        };
    }

    let iter = IterDesc {
        shape: merged.iter().map(|d| d.0).collect(),
        src_strides: merged.iter().map(|d| d.1).collect(),
        dst_strides: merged.iter().map(|d| d.2).collect(),
    };
    let class = if iter.rank() == 1 && iter.src_strides[0] == 1 && iter.dst_strides[0] == 1 {
        CopyClass::Contiguous
    } else if iter.src_strides.contains(&0) {
        CopyClass::StridedBroadcast
    } else {
        CopyClass::StridedNoBroadcast
    };

    Classified { class, iter }
}

/// Whether one side alone is a dense row-major run over `shape`
pub fn is_row_major_dense(shape: &[usize], strides: &[isize]) -> bool {
    let mut expected = 1isize;
    for (&n, &s) in shape.iter().zip(strides).rev() {
        if n == 1 {
            continue;
        }
        if s != expected {
            return false;
        }
        expected *= n as isize;
    }
    true
}
