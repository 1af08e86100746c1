//! The copy engine
//!
//! A copy runs in three phases:
//!
//! 1. **Plan** (synchronous): resolve broadcasting ([`resolve()`]), select the
//!    cast ([`select_cast`](crate::dtype::select_cast)), merge dimensions and
//!    classify ([`classify()`]), then lay out steps per venue ([`plan()`]).
//!    Every error is raised here, before memory is touched.
//! 2. **Stage**: allocate every staging buffer the plan asks for. If one
//!    allocation fails the earlier ones are released and nothing runs.
//! 3. **Execute**: run host steps inline and enqueue device steps, waiting
//!    on the previous step only when the queue changes. Staging is released
//!    once the joined handle settles.

mod classify;
mod config;
mod plan;
mod resolve;

pub use classify::{Classified, CopyClass, IterDesc, classify, classify_strides, is_row_major_dense};
pub use config::{CopyConfig, CopyOptions, PeerFallback};
pub use plan::{BufferRef, CopyPlan, CopyStep, Operand, StagingRequest, plan};
pub use resolve::{BroadcastPlan, broadcast_shape, resolve};

use crate::error::{CopyError, DeviceError, Result};
use crate::runtime::{
    Allocation, BoundOperand, BoundStep, CompletionHandle, DeviceBackend, DeviceExecutor, Executor,
    HostExecutor, Placement, Stream, Venue,
};
use crate::tensor::{TensorView, TensorViewMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// The queue a step runs on
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Queue {
    Host,
    Device(Stream),
}

/// Strided tensor copy engine
///
/// Holds configuration and an optional device backend; all per-copy state
/// lives on the caller's stack or in the returned handle, so one engine can
/// serve many threads.
///
/// # Example
///
/// ```
/// use numr_copy::prelude::*;
///
/// let engine = CopyEngine::host_only(CopyConfig::default());
/// let src = [1.5f32, 2.5, 3.5, 4.5];
/// let mut dst = [0i32; 8];
/// let src = TensorView::contiguous(&src, &[1, 4]).unwrap();
/// let mut dst_view = TensorViewMut::contiguous(&mut dst, &[2, 4]).unwrap();
/// engine.copy(&src, &mut dst_view, true).unwrap();
/// assert_eq!(dst, [1, 2, 3, 4, 1, 2, 3, 4]);
/// ```
pub struct CopyEngine {
    config: CopyConfig,
    backend: Option<Arc<dyn DeviceBackend>>,
    host: HostExecutor,
    accepting: AtomicBool,
}

impl CopyEngine {
    /// Engine that only handles host memory
    pub fn host_only(config: CopyConfig) -> Self {
        Self {
            host: HostExecutor::new(config.parallel_threshold()),
            config,
            backend: None,
            accepting: AtomicBool::new(true),
        }
    }

    /// Engine with a device backend
    pub fn new(backend: Arc<dyn DeviceBackend>, config: CopyConfig) -> Self {
        Self {
            backend: Some(backend),
            ..Self::host_only(config)
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &CopyConfig {
        &self.config
    }

    /// The attached device backend, if any
    pub fn backend(&self) -> Option<&Arc<dyn DeviceBackend>> {
        self.backend.as_ref()
    }

    /// Plan a copy without executing it
    pub fn plan(&self, src: &TensorView<'_>, dst: &TensorView<'_>) -> Result<CopyPlan> {
        plan(src, dst, self.backend.as_deref(), &self.config)
    }

    /// Copy `src` into `dst`, broadcasting and casting as needed
    ///
    /// With `blocking` the call returns after all work is done and reports
    /// device failures as `Err`. Otherwise device-only copies return a
    /// pending handle; copies involving the caller's host memory still
    /// complete before returning.
    pub fn copy(
        &self,
        src: &TensorView<'_>,
        dst: &mut TensorViewMut<'_>,
        blocking: bool,
    ) -> Result<CompletionHandle> {
        let options = if blocking {
            CopyOptions::blocking()
        } else {
            CopyOptions::non_blocking()
        };
        self.copy_with(src, dst, &options)
    }

    /// [`copy`](Self::copy) with explicit options
    pub fn copy_with(
        &self,
        src: &TensorView<'_>,
        dst: &mut TensorViewMut<'_>,
        options: &CopyOptions,
    ) -> Result<CompletionHandle> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(CopyError::ShutDown);
        }

        let plan = self.plan(src, &dst.as_view())?;
        if plan.is_noop() {
            trace!(numel = plan.numel(), "copy is a no-op");
            return Ok(CompletionHandle::ready());
        }

        let staging = self.allocate_staging(&plan)?;
        let (handles, error) = self.execute(&plan, src, dst, &staging, options);
        let joined = CompletionHandle::join(handles);
        self.release_on_settled(&joined, staging);

        if let Some(err) = error {
            // Already-enqueued steps may still touch caller memory
            let _ = self.wait(&joined);
            return Err(err);
        }

        if options.blocking {
            self.wait(&joined)?;
        } else if plan.borrows_host_memory() {
            let _ = self.wait(&joined);
        }
        Ok(joined)
    }

    /// Stop accepting copies; work already enqueued is unaffected
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            debug!("copy engine shut down");
        }
    }

    /// True after [`shutdown`](Self::shutdown)
    pub fn is_shut_down(&self) -> bool {
        !self.accepting.load(Ordering::Acquire)
    }

    fn allocate_staging(&self, plan: &CopyPlan) -> Result<Vec<Allocation>> {
        if plan.staging().is_empty() {
            return Ok(Vec::new());
        }
        let backend = self.device_backend(plan.staging()[0].placement)?;

        let mut allocations = Vec::with_capacity(plan.staging().len());
        for request in plan.staging() {
            match backend.allocate_staging(request.placement, request.bytes()) {
                Ok(allocation) => allocations.push(allocation),
                Err(err) => {
                    debug!(
                        placement = %request.placement,
                        bytes = request.bytes(),
                        error = %err,
                        "staging allocation failed"
                    );
                    for allocation in allocations {
                        backend.free(allocation);
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(allocations)
    }

    fn release_on_settled(&self, joined: &CompletionHandle, staging: Vec<Allocation>) {
        if staging.is_empty() {
            return;
        }
        let Some(backend) = self.backend.clone() else {
            return;
        };
        joined.on_settled(move |status| {
            trace!(buffers = staging.len(), ?status, "releasing staging");
            for allocation in staging {
                backend.free(allocation);
            }
        });
    }

    /// Run the plan's steps in order
    ///
    /// Returns the handles of every step that started plus the synchronous
    /// error that stopped execution, if any.
    fn execute(
        &self,
        plan: &CopyPlan,
        src: &TensorView<'_>,
        dst: &TensorViewMut<'_>,
        staging: &[Allocation],
        options: &CopyOptions,
    ) -> (Vec<CompletionHandle>, Option<CopyError>) {
        let mut handles = Vec::with_capacity(plan.steps().len());
        let mut previous: Option<(Queue, CompletionHandle)> = None;

        for (index, step) in plan.steps().iter().enumerate() {
            let queue = match self.queue_for(step.venue, options) {
                Ok(queue) => queue,
                Err(err) => return (handles, Some(err)),
            };

            if let Some((prev_queue, prev)) = &previous {
                if *prev_queue != queue && self.wait(prev).is_err() {
                    debug!(step = index, "previous step failed, skipping the rest");
                    return (handles, None);
                }
            }

            let bound = BoundStep {
                step,
                src: bind(&step.src, src, dst, staging),
                dst: bind(&step.dst, src, dst, staging),
            };
            trace!(step = index, venue = %step.venue, ?queue, "executing step");

            let started = match queue {
                Queue::Host => self.host.execute(&bound, None),
                Queue::Device(stream) => self
                    .device_backend(Placement::Device(stream.device))
                    .and_then(|backend| DeviceExecutor::new(backend).execute(&bound, Some(stream))),
            };
            match started {
                Ok(handle) => {
                    handles.push(handle.clone());
                    previous = Some((queue, handle));
                }
                Err(err) => return (handles, Some(err)),
            }
        }

        (handles, None)
    }

    fn queue_for(&self, venue: Venue, options: &CopyOptions) -> Result<Queue> {
        let Some(device) = venue.queue_device() else {
            return Ok(Queue::Host);
        };
        let stream = match options.stream {
            Some(stream) if stream.device == device => stream,
            _ => self
                .device_backend(Placement::Device(device))?
                .default_stream(device),
        };
        Ok(Queue::Device(stream))
    }

    fn device_backend(&self, placement: Placement) -> Result<&dyn DeviceBackend> {
        self.backend
            .as_deref()
            .ok_or_else(|| DeviceError::NoBackend(placement).into())
    }

    fn wait(&self, handle: &CompletionHandle) -> Result<()> {
        match self.backend.as_deref() {
            Some(backend) => backend.wait(handle)?,
            None => handle.wait()?,
        }
        Ok(())
    }
}

fn bind(operand: &Operand, src: &TensorView<'_>, dst: &TensorViewMut<'_>, staging: &[Allocation]) -> BoundOperand {
    let (base, placement) = match operand.buffer {
        BufferRef::Source => (src.addr(), src.placement()),
        BufferRef::Destination => (dst.addr(), dst.placement()),
        BufferRef::Staging(i) => (staging[i].addr, staging[i].placement),
    };
    BoundOperand {
        addr: base + (operand.offset * operand.dtype.size_in_bytes()) as u64,
        dtype: operand.dtype,
        placement,
    }
}

impl std::fmt::Debug for CopyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyEngine")
            .field("config", &self.config)
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
