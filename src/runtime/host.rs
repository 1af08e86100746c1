//! Host executor: copy steps as CPU loops

use crate::copy::CopyClass;
use crate::dtype::{CastFn, select_cast};
use crate::error::{CopyError, Result};
use crate::runtime::{BoundStep, CompletionHandle, Executor, Placement, Stream, Venue};
use smallvec::SmallVec;
use tracing::trace;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Runs host-venue steps synchronously on the calling thread
///
/// Linear steps above `parallel_threshold` elements are split across the
/// rayon pool when the `rayon` feature is enabled.
#[derive(Clone, Debug)]
pub struct HostExecutor {
    parallel_threshold: usize,
}

impl HostExecutor {
    /// Create a host executor
    pub fn new(parallel_threshold: usize) -> Self {
        Self {
            parallel_threshold: parallel_threshold.max(1),
        }
    }

    /// Elements above which linear steps run in parallel
    pub fn parallel_threshold(&self) -> usize {
        self.parallel_threshold
    }

    unsafe fn run_linear(&self, cast: &CastFn, src: *const u8, dst: *mut u8, len: usize) {
        #[cfg(feature = "rayon")]
        {
            if len > self.parallel_threshold {
                unsafe { self.run_linear_parallel(cast, src, dst, len) };
                return;
            }
        }

        unsafe { cast.run(src, 1, dst, 1, len) };
    }

    #[cfg(feature = "rayon")]
    unsafe fn run_linear_parallel(&self, cast: &CastFn, src: *const u8, dst: *mut u8, len: usize) {
        let chunk = len
            .div_ceil(rayon::current_num_threads())
            .max(self.parallel_threshold);
        let src_elem = cast.src().size_in_bytes();
        let dst_elem = cast.dst().size_in_bytes();
        let src_addr = src as usize;
        let dst_addr = dst as usize;
        let cast = *cast;

        (0..len.div_ceil(chunk)).into_par_iter().for_each(|i| {
            let start = i * chunk;
            let n = chunk.min(len - start);
            unsafe {
                let src = (src_addr + start * src_elem) as *const u8;
                let dst = (dst_addr + start * dst_elem) as *mut u8;
                cast.run(src, 1, dst, 1, n);
            }
        });
    }
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new(crate::copy::CopyConfig::DEFAULT_PARALLEL_THRESHOLD)
    }
}

impl Executor for HostExecutor {
    fn execute(&self, bound: &BoundStep<'_>, _stream: Option<Stream>) -> Result<CompletionHandle> {
        let step = bound.step;
        if step.venue != Venue::Host
            || bound.src.placement != Placement::Host
            || bound.dst.placement != Placement::Host
        {
            return Err(CopyError::invalid_view(format!(
                "host executor cannot run a {} step ({} -> {})",
                step.venue, bound.src.placement, bound.dst.placement
            )));
        }

        let cast = match step.cast {
            Some(cast) => cast,
            None => select_cast(bound.src.dtype, bound.dst.dtype)?,
        };
        let src = bound.src.addr as usize as *const u8;
        let dst = bound.dst.addr as usize as *mut u8;

        trace!(
            class = ?step.class,
            numel = step.numel,
            rank = step.iter.rank(),
            ?cast,
            "host copy step"
        );

        // Safety: the planner validated both views against their allocations
        // and the bound addresses point at the iteration origin.
        unsafe {
            match step.class {
                CopyClass::Contiguous => self.run_linear(&cast, src, dst, step.numel),
                CopyClass::StridedNoBroadcast | CopyClass::StridedBroadcast => apply_strided(
                    &cast,
                    src,
                    dst,
                    &step.iter.shape,
                    &step.iter.src_strides,
                    &step.iter.dst_strides,
                ),
            }
        }

        Ok(CompletionHandle::ready())
    }
}

/// Visit `shape` in row-major order, converting one innermost run per call.
///
/// # Safety
/// - every index of `shape` must map inside the source and destination
///   allocations through the given strides (in elements)
/// - `src` and `dst` must point at the element for index (0, ..., 0)
/// - source and destination must not overlap
pub(crate) unsafe fn apply_strided(
    cast: &CastFn,
    src: *const u8,
    dst: *mut u8,
    shape: &[usize],
    src_strides: &[isize],
    dst_strides: &[isize],
) {
    let rank = shape.len();
    if rank == 0 {
        unsafe { cast.run(src, 1, dst, 1, 1) };
        return;
    }
    if shape.contains(&0) {
        return;
    }

    let src_elem = cast.src().size_in_bytes() as isize;
    let dst_elem = cast.dst().size_in_bytes() as isize;
    let inner = shape[rank - 1];
    let (inner_src, inner_dst) = (src_strides[rank - 1], dst_strides[rank - 1]);
    let outer = &shape[..rank - 1];

    let mut index: SmallVec<[usize; 8]> = SmallVec::from_elem(0, outer.len());
    let mut src_off: isize = 0;
    let mut dst_off: isize = 0;

    loop {
        unsafe {
            cast.run(
                src.wrapping_offset(src_off * src_elem),
                inner_src,
                dst.wrapping_offset(dst_off * dst_elem),
                inner_dst,
                inner,
            );
        }

        // Increment the outer index (row-major order)
        let mut dim = outer.len();
        loop {
            if dim == 0 {
                return;
            }
            dim -= 1;
            index[dim] += 1;
            src_off += src_strides[dim];
            dst_off += dst_strides[dim];
            if index[dim] < outer[dim] {
                break;
            }
            src_off -= src_strides[dim] * outer[dim] as isize;
            dst_off -= dst_strides[dim] * outer[dim] as isize;
            index[dim] = 0;
        }
    }
}
