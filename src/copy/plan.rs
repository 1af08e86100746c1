//! Execution planning: from two views to an ordered list of steps

use super::classify::{Classified, CopyClass, IterDesc, classify, classify_strides, is_row_major_dense};
use super::config::{CopyConfig, PeerFallback};
use super::resolve::resolve;
use crate::dtype::{CastFn, DType, select_cast};
use crate::error::{CopyError, DeviceError, Result};
use crate::runtime::{DeviceBackend, Placement, Venue};
use crate::tensor::{TensorView, contiguous_strides};
use tracing::{debug, warn};

/// Which buffer an operand lives in
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferRef {
    /// The caller's source allocation
    Source,
    /// The caller's destination allocation
    Destination,
    /// Staging buffer `i` of [`CopyPlan::staging`]
    Staging(usize),
}

/// One side of a step
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Operand {
    /// Buffer holding the data
    pub buffer: BufferRef,
    /// Element type in that buffer
    pub dtype: DType,
    /// Element offset of the iteration origin from the buffer base
    pub offset: usize,
}

impl Operand {
    fn staging(index: usize, dtype: DType) -> Self {
        Self {
            buffer: BufferRef::Staging(index),
            dtype,
            offset: 0,
        }
    }
}

/// A single unit of work at one venue
#[derive(Clone, Debug, PartialEq)]
pub struct CopyStep {
    /// Where the step runs
    pub venue: Venue,
    /// Source operand
    pub src: Operand,
    /// Destination operand
    pub dst: Operand,
    /// Iteration space
    pub iter: IterDesc,
    /// Access pattern of `iter`
    pub class: CopyClass,
    /// Conversion applied per element; None for raw copies
    pub cast: Option<CastFn>,
    /// Elements written
    pub numel: usize,
}

impl CopyStep {
    /// True for bulk transfers between placements
    pub fn is_transfer(&self) -> bool {
        self.venue.direction().is_some()
    }
}

/// A temporary buffer the plan needs
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StagingRequest {
    /// Where to allocate
    pub placement: Placement,
    /// Element type stored
    pub dtype: DType,
    /// Number of elements
    pub len: usize,
}

impl StagingRequest {
    /// Size in bytes
    pub fn bytes(&self) -> usize {
        self.len * self.dtype.size_in_bytes()
    }
}

/// Ordered steps plus the staging they need
#[derive(Clone, Debug, PartialEq)]
pub struct CopyPlan {
    steps: Vec<CopyStep>,
    staging: Vec<StagingRequest>,
    numel: usize,
    class: CopyClass,
    src_placement: Placement,
    dst_placement: Placement,
}

impl CopyPlan {
    /// Steps in execution order
    pub fn steps(&self) -> &[CopyStep] {
        &self.steps
    }

    /// Staging buffers, indexed by [`BufferRef::Staging`]
    pub fn staging(&self) -> &[StagingRequest] {
        &self.staging
    }

    /// Elements written to the destination
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Classification of the whole copy
    pub fn class(&self) -> CopyClass {
        self.class
    }

    /// True when nothing needs to happen
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }

    /// Placement of an operand's buffer
    pub fn placement_of(&self, buffer: BufferRef) -> Option<Placement> {
        match buffer {
            BufferRef::Source => Some(self.src_placement),
            BufferRef::Destination => Some(self.dst_placement),
            BufferRef::Staging(i) => self.staging.get(i).map(|s| s.placement),
        }
    }

    /// True if a device-queued step reads or writes the caller's host memory
    pub fn borrows_host_memory(&self) -> bool {
        let caller_host = |buffer: BufferRef| {
            matches!(buffer, BufferRef::Source | BufferRef::Destination)
                && self.placement_of(buffer) == Some(Placement::Host)
        };
        self.steps
            .iter()
            .filter(|s| s.venue.queue_device().is_some())
            .any(|s| caller_host(s.src.buffer) || caller_host(s.dst.buffer))
    }

    /// Number of strided or casting kernel steps at a device venue
    pub fn device_kernel_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.venue, Venue::Device(_)))
            .filter(|s| s.class != CopyClass::Contiguous || s.cast.is_some())
            .count()
    }
}

fn check_placement(placement: Placement, backend: Option<&dyn DeviceBackend>) -> Result<()> {
    let Some(id) = placement.device() else {
        return Ok(());
    };
    let backend = backend.ok_or(DeviceError::NoBackend(placement))?;
    if id.index() >= backend.device_count() {
        return Err(DeviceError::UnknownDevice(id).into());
    }
    Ok(())
}

fn venue_at(placement: Placement) -> Venue {
    match placement {
        Placement::Host => Venue::Host,
        Placement::Device(id) => Venue::Device(id),
    }
}

/// Plan a copy from `src` into `dst`
///
/// Every error is reported here, before anything is allocated or written.
pub fn plan(
    src: &TensorView<'_>,
    dst: &TensorView<'_>,
    backend: Option<&dyn DeviceBackend>,
    config: &CopyConfig,
) -> Result<CopyPlan> {
    check_placement(src.placement(), backend)?;
    check_placement(dst.placement(), backend)?;

    let broadcast = resolve(src.layout(), dst.layout())?;
    let cast = select_cast(src.dtype(), dst.dtype())?;
    let classified = classify(&broadcast);
    let numel = broadcast.numel();

    let mut builder = PlanBuilder {
        steps: Vec::new(),
        staging: Vec::new(),
        backend,
        config,
    };

    if numel > 0 {
        let src_op = Operand {
            buffer: BufferRef::Source,
            dtype: src.dtype(),
            offset: src.layout().offset(),
        };
        let dst_op = Operand {
            buffer: BufferRef::Destination,
            dtype: dst.dtype(),
            offset: dst.layout().offset(),
        };
        let cast = (!cast.is_identity()).then_some(cast);

        match Venue::between(src.placement(), dst.placement()) {
            venue @ (Venue::Host | Venue::Device(_)) => {
                builder.elementwise(venue, src_op, dst_op, classified.clone(), cast)?
            }
            _ => builder.cross_placement(
                src.placement(),
                dst.placement(),
                src_op,
                dst_op,
                &classified,
                cast,
            )?,
        }
    }

    let plan = CopyPlan {
        steps: builder.steps,
        staging: builder.staging,
        numel,
        class: classified.class,
        src_placement: src.placement(),
        dst_placement: dst.placement(),
    };
    debug!(
        src = %src.placement(),
        dst = %dst.placement(),
        class = ?plan.class,
        numel,
        rank = classified.iter.rank(),
        steps = plan.steps.len(),
        staging = plan.staging.len(),
        "planned copy"
    );
    Ok(plan)
}

struct PlanBuilder<'a> {
    steps: Vec<CopyStep>,
    staging: Vec<StagingRequest>,
    backend: Option<&'a dyn DeviceBackend>,
    config: &'a CopyConfig,
}

impl PlanBuilder<'_> {
    fn stage(&mut self, placement: Placement, dtype: DType, len: usize) -> Operand {
        self.staging.push(StagingRequest {
            placement,
            dtype,
            len,
        });
        Operand::staging(self.staging.len() - 1, dtype)
    }

    /// One elementwise step (bulk or strided, with optional cast) at a
    /// single venue
    fn elementwise(
        &mut self,
        venue: Venue,
        src: Operand,
        dst: Operand,
        classified: Classified,
        cast: Option<CastFn>,
    ) -> Result<()> {
        let Classified { class, iter } = classified;
        if matches!(venue, Venue::Device(_)) && (class != CopyClass::Contiguous || cast.is_some()) {
            let max = self.config.max_device_rank();
            if iter.rank() > max {
                return Err(CopyError::RankTooHigh {
                    rank: iter.rank(),
                    max,
                });
            }
        }
        self.steps.push(CopyStep {
            venue,
            src,
            dst,
            numel: iter.numel(),
            iter,
            class,
            cast,
        });
        Ok(())
    }

    fn transfer(&mut self, venue: Venue, src: Operand, dst: Operand, numel: usize) {
        self.steps.push(CopyStep {
            venue,
            src,
            dst,
            iter: IterDesc::linear(numel),
            class: CopyClass::Contiguous,
            cast: None,
            numel,
        });
    }

    /// Gather at the source (if needed), move, scatter at the destination
    /// (if needed)
    fn cross_placement(
        &mut self,
        src_place: Placement,
        dst_place: Placement,
        src: Operand,
        dst: Operand,
        classified: &Classified,
        cast: Option<CastFn>,
    ) -> Result<()> {
        let iter = &classified.iter;
        let numel = iter.numel();
        let dense_strides = contiguous_strides(&iter.shape);
        let src_dense = is_row_major_dense(&iter.shape, &iter.src_strides);
        let dst_dense = is_row_major_dense(&iter.shape, &iter.dst_strides);

        let mut moving = src;
        if !src_dense || cast.is_some() {
            let staged = self.stage(src_place, dst.dtype, numel);
            let gather = classify_strides(&iter.shape, &iter.src_strides, &dense_strides);
            self.elementwise(venue_at(src_place), moving, staged, gather, cast)?;
            moving = staged;
        }

        let landing = if dst_dense {
            dst
        } else {
            self.stage(dst_place, dst.dtype, numel)
        };
        self.move_between(src_place, dst_place, moving, landing, numel)?;

        if !dst_dense {
            let scatter = classify_strides(&iter.shape, &dense_strides, &iter.dst_strides);
            self.elementwise(venue_at(dst_place), landing, dst, scatter, None)?;
        }
        Ok(())
    }

    fn move_between(
        &mut self,
        src_place: Placement,
        dst_place: Placement,
        from: Operand,
        to: Operand,
        numel: usize,
    ) -> Result<()> {
        let venue = Venue::between(src_place, dst_place);
        let Venue::DeviceToDevice { src, dst } = venue else {
            self.transfer(venue, from, to, numel);
            return Ok(());
        };

        let has_peer = self.backend.is_some_and(|b| b.has_peer_path(src, dst));
        if has_peer {
            self.transfer(venue, from, to, numel);
            return Ok(());
        }

        match self.config.peer_fallback() {
            PeerFallback::Reject => Err(DeviceError::NoPeerPath { src, dst }.into()),
            PeerFallback::StageThroughHost => {
                warn!(%src, %dst, numel, "no peer path between devices, staging through host");
                let bounce = self.stage(Placement::Host, from.dtype, numel);
                self.transfer(Venue::DeviceToHost(src), from, bounce, numel);
                self.transfer(Venue::HostToDevice(dst), bounce, to, numel);
                Ok(())
            }
        }
    }
}
