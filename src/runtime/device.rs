//! Device executor: maps copy steps onto the device collaborator

use crate::copy::CopyClass;
use crate::error::{CopyError, DeviceError, Result};
use crate::runtime::{
    BoundStep, CompletionHandle, DeviceBackend, Direction, Executor, MAX_KERNEL_DIMS, Stream,
    StridedCopyLaunch, Transfer, Venue,
};
use smallvec::SmallVec;
use tracing::trace;

/// Enqueues device-venue steps and returns their handles
///
/// Contiguous identity steps and all inter-placement steps become a bulk
/// transfer. Everything else (cast or strided access) becomes one strided
/// copy kernel launch.
pub struct DeviceExecutor<'b> {
    backend: &'b dyn DeviceBackend,
}

impl<'b> DeviceExecutor<'b> {
    /// Wrap a backend
    pub fn new(backend: &'b dyn DeviceBackend) -> Self {
        Self { backend }
    }

    fn transfer(&self, bound: &BoundStep<'_>, direction: Direction, stream: Stream) -> Result<CompletionHandle> {
        let step = bound.step;
        let transfer = Transfer {
            src: bound.src.addr,
            dst: bound.dst.addr,
            size: step.numel * bound.dst.dtype.size_in_bytes(),
            direction,
        };
        trace!(venue = %step.venue, bytes = transfer.size, ?stream, "enqueue transfer");
        Ok(self.backend.enqueue_transfer(transfer, stream)?)
    }

    fn launch(&self, bound: &BoundStep<'_>, stream: Stream) -> Result<CompletionHandle> {
        let step = bound.step;
        let rank = step.iter.rank();
        if rank > MAX_KERNEL_DIMS {
            return Err(CopyError::RankTooHigh {
                rank,
                max: MAX_KERNEL_DIMS,
            });
        }

        let launch = StridedCopyLaunch {
            device: stream.device,
            src: bound.src.addr,
            dst: bound.dst.addr,
            src_dtype: bound.src.dtype,
            dst_dtype: bound.dst.dtype,
            shape: step.iter.shape.clone(),
            src_strides: SmallVec::from_slice(&step.iter.src_strides),
            dst_strides: SmallVec::from_slice(&step.iter.dst_strides),
        };
        trace!(
            device = %launch.device,
            rank,
            numel = step.numel,
            src = %launch.src_dtype,
            dst = %launch.dst_dtype,
            ?stream,
            "launch strided copy"
        );
        Ok(self.backend.launch_strided_copy(&launch, stream)?)
    }
}

impl Executor for DeviceExecutor<'_> {
    fn execute(&self, bound: &BoundStep<'_>, stream: Option<Stream>) -> Result<CompletionHandle> {
        let step = bound.step;
        let device = step
            .venue
            .queue_device()
            .ok_or_else(|| CopyError::invalid_view("device executor given a host step"))?;
        let stream = stream.unwrap_or_else(|| self.backend.default_stream(device));
        if stream.device != device {
            return Err(DeviceError::LaunchFailed {
                kernel: "copy",
                reason: format!("stream {stream:?} does not belong to device {device}"),
            }
            .into());
        }

        match step.venue.direction() {
            Some(direction) => self.transfer(bound, direction, stream),
            None if step.class == CopyClass::Contiguous && step.cast.is_none() => {
                self.transfer(bound, Direction::DeviceToDevice, stream)
            }
            None => self.launch(bound, stream),
        }
    }
}

impl std::fmt::Debug for DeviceExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceExecutor")
            .field("backend", &self.backend.name())
            .finish()
    }
}
