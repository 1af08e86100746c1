//! Shape/stride resolution: broadcasting a source onto a destination

use crate::error::ShapeError;
use crate::tensor::{Layout, Shape, Strides};

/// Iteration shape plus the per-tensor strides that walk it
///
/// Broadcast source dimensions carry stride 0. Both stride arrays have the
/// rank of `shape`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastPlan {
    /// Iteration shape (the destination shape)
    pub shape: Shape,
    /// Source strides, in source elements
    pub src_strides: Strides,
    /// Destination strides, in destination elements
    pub dst_strides: Strides,
}

impl BroadcastPlan {
    /// Number of elements written
    #[inline]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Iteration rank before dimension merging
    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// True if any source dimension is broadcast
    pub fn broadcasts_source(&self) -> bool {
        self.shape
            .iter()
            .zip(&self.src_strides)
            .any(|(&n, &s)| n > 1 && s == 0)
    }
}

/// Size of dimension `i` of a shape right-aligned to `rank` dims
#[inline]
fn aligned(shape: &[usize], rank: usize, i: usize) -> Option<usize> {
    let pad = rank - shape.len();
    (i >= pad).then(|| shape[i - pad])
}

/// Broadcast two shapes symmetrically
///
/// Right-aligns both shapes; each dimension pair must be equal or contain a
/// 1, and the result is the elementwise max.
///
/// # Example
///
/// ```
/// use numr_copy::copy::broadcast_shape;
/// assert_eq!(broadcast_shape(&[3, 1], &[1, 4]).unwrap().as_slice(), &[3, 4]);
/// assert!(broadcast_shape(&[3], &[4]).is_err());
/// ```
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Shape, ShapeError> {
    let rank = a.len().max(b.len());
    let mut out = Shape::with_capacity(rank);
    for i in 0..rank {
        let x = aligned(a, rank, i).unwrap_or(1);
        let y = aligned(b, rank, i).unwrap_or(1);
        let size = match (x, y) {
            _ if x == y => x,
            (1, _) => y,
            (_, 1) => x,
            _ => {
                return Err(ShapeError::Incompatible {
                    src: a.to_vec(),
                    dst: b.to_vec(),
                });
            }
        };
        out.push(size);
    }
    Ok(out)
}

/// Resolve how `src` is read while writing every element of `dst`
///
/// The iteration shape is the destination's shape after right-aligning both
/// shapes. The source may broadcast; the destination may not, since that
/// would write one location several times.
pub fn resolve(src: &Layout, dst: &Layout) -> Result<BroadcastPlan, ShapeError> {
    for (dim, (&size, &stride)) in dst.shape().iter().zip(dst.strides()).enumerate() {
        if size > 1 && stride == 0 {
            return Err(ShapeError::OverlappingDestination { dim, size });
        }
    }

    let rank = src.ndim().max(dst.ndim());
    let src_pad = rank - src.ndim();
    let dst_pad = rank - dst.ndim();

    let mut shape = Shape::with_capacity(rank);
    let mut src_strides = Strides::with_capacity(rank);
    let mut dst_strides = Strides::with_capacity(rank);

    for i in 0..rank {
        let (a, sa) = if i >= src_pad {
            (src.shape()[i - src_pad], src.strides()[i - src_pad])
        } else {
            (1, 0)
        };
        let (b, sb) = if i >= dst_pad {
            (dst.shape()[i - dst_pad], dst.strides()[i - dst_pad])
        } else {
            (1, 0)
        };

        if a == b {
            shape.push(a);
            src_strides.push(if a == 1 { 0 } else { sa });
        } else if a == 1 {
            shape.push(b);
            src_strides.push(0);
        } else if b == 1 {
            return Err(ShapeError::DestinationBroadcast { dim: i, size: a });
        } else {
            return Err(ShapeError::Incompatible {
                src: src.shape().to_vec(),
                dst: dst.shape().to_vec(),
            });
        }
        dst_strides.push(sb);
    }

    Ok(BroadcastPlan {
        shape,
        src_strides,
        dst_strides,
    })
}
