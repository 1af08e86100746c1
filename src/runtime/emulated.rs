//! Emulated device backend over host memory
//!
//! `EmulatedBackend` implements [`DeviceBackend`] without accelerator
//! hardware. "Device" allocations are ordinary host allocations tagged with a
//! placement, and every stream is a worker thread draining a FIFO queue, so
//! enqueued work really is asynchronous with respect to the caller.
//!
//! Allocations live in a pool shared with the stream workers. Dropping the
//! backend closes the stream queues without waiting; workers drain what is
//! already queued and the last one out releases the pool.
//!
//! The backend checks every transfer and kernel against its live
//! allocations, which makes it useful for testing planners: a step that
//! touches device memory outside an allocation is rejected at enqueue time.
//!
//! Test hooks:
//! - peer paths between device pairs ([`with_peer`](EmulatedBackend::with_peer))
//! - staging limits per placement ([`with_staging_limit`](EmulatedBackend::with_staging_limit))
//! - injected transfer faults ([`fail_next_transfers`](EmulatedBackend::fail_next_transfers))
//! - per-job latency ([`with_latency`](EmulatedBackend::with_latency))

use crate::dtype::select_cast;
use crate::error::DeviceError;
use crate::runtime::host::apply_strided;
use crate::runtime::{
    Allocation, CompletionHandle, DeviceBackend, DeviceId, DeviceResult, Direction,
    MAX_KERNEL_DIMS, Placement, Stream, StridedCopyLaunch, Transfer,
};
use bytemuck::Pod;
use parking_lot::Mutex;
use std::alloc::{self, Layout as AllocLayout};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

const BLOCK_ALIGN: usize = 16;

type Job = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
struct Block {
    allocation: Allocation,
    staging: bool,
}

#[derive(Default)]
struct Memory {
    blocks: HashMap<u64, Block>,
    staging_bytes: HashMap<Placement, usize>,
}

impl Memory {
    /// Check that `[addr, addr + size)` lies in one live block at `placement`
    fn contains(&self, placement: Placement, addr: u64, size: usize) -> bool {
        if size == 0 {
            return true;
        }
        self.blocks.values().any(|b| {
            b.allocation.placement == placement
                && addr >= b.allocation.addr
                && addr + size as u64 <= b.allocation.addr + b.allocation.size as u64
        })
    }

    /// Forget the block at `addr`, returning it if it was live
    fn remove(&mut self, addr: u64) -> Option<Block> {
        let block = self.blocks.remove(&addr)?;
        if block.staging {
            if let Some(used) = self.staging_bytes.get_mut(&block.allocation.placement) {
                *used = used.saturating_sub(block.allocation.size);
            }
        }
        Some(block)
    }

    /// Same as [`contains`](Self::contains) for any device placement
    fn contains_on_any_device(&self, addr: u64, size: usize) -> bool {
        self.blocks
            .values()
            .filter_map(|b| b.allocation.placement.device())
            .any(|d| self.contains(Placement::Device(d), addr, size))
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        for (_, block) in self.blocks.drain() {
            dealloc_block(&block.allocation);
        }
    }
}

fn block_layout(size: usize) -> Option<AllocLayout> {
    AllocLayout::from_size_align(size.max(1), BLOCK_ALIGN).ok()
}

fn dealloc_block(allocation: &Allocation) {
    if let Some(layout) = block_layout(allocation.size) {
        // Safety: allocated in `EmulatedBackend::allocate` with this layout
        unsafe { alloc::dealloc(allocation.addr as usize as *mut u8, layout) };
    }
}

/// Host-memory implementation of [`DeviceBackend`]
///
/// # Example
///
/// ```
/// use numr_copy::runtime::{DeviceBackend, DeviceId, EmulatedBackend, Placement};
///
/// let backend = EmulatedBackend::new(2).with_peer(DeviceId(0), DeviceId(1));
/// assert!(backend.has_peer_path(DeviceId(1), DeviceId(0)));
/// let buf = backend.alloc_buffer(Placement::Device(DeviceId(0)), 64).unwrap();
/// backend.write(&buf, &[7u8; 64]).unwrap();
/// assert_eq!(backend.read(&buf).unwrap(), vec![7u8; 64]);
/// backend.free(buf);
/// ```
pub struct EmulatedBackend {
    device_count: usize,
    peers: HashSet<(DeviceId, DeviceId)>,
    staging_limits: HashMap<Placement, usize>,
    latency: Duration,
    memory: Arc<Mutex<Memory>>,
    streams: Mutex<HashMap<Stream, mpsc::Sender<Job>>>,
    next_stream: AtomicU32,
    fail_next: AtomicUsize,
    transfers: AtomicUsize,
    kernels: AtomicUsize,
}

impl EmulatedBackend {
    /// Backend with `device_count` devices and no peer paths
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            peers: HashSet::new(),
            staging_limits: HashMap::new(),
            latency: Duration::ZERO,
            memory: Arc::new(Mutex::new(Memory::default())),
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU32::new(1),
            fail_next: AtomicUsize::new(0),
            transfers: AtomicUsize::new(0),
            kernels: AtomicUsize::new(0),
        }
    }

    /// Allow direct transfers between `a` and `b`, both directions
    pub fn with_peer(mut self, a: DeviceId, b: DeviceId) -> Self {
        self.peers.insert((a, b));
        self.peers.insert((b, a));
        self
    }

    /// Cap live staging memory at `placement` to `bytes`
    pub fn with_staging_limit(mut self, placement: Placement, bytes: usize) -> Self {
        self.staging_limits.insert(placement, bytes);
        self
    }

    /// Delay every enqueued job by `latency` before it runs
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `count` enqueued transfers fail asynchronously
    pub fn fail_next_transfers(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// A new stream on `device`, distinct from the default stream
    pub fn create_stream(&self, device: DeviceId) -> Stream {
        Stream {
            device,
            id: self.next_stream.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Allocate a zeroed buffer owned by the caller (not counted as staging)
    pub fn alloc_buffer(&self, placement: Placement, size_bytes: usize) -> DeviceResult<Allocation> {
        self.allocate(placement, size_bytes, false)
    }

    /// Overwrite the start of `allocation` with `bytes`
    pub fn write(&self, allocation: &Allocation, bytes: &[u8]) -> DeviceResult<()> {
        let memory = self.memory.lock();
        if bytes.len() > allocation.size || !memory.blocks.contains_key(&allocation.addr) {
            return Err(DeviceError::TransferFailed {
                size: bytes.len(),
                reason: format!("write outside allocation {:#x}", allocation.addr),
            });
        }
        // Safety: the block is live and at least `bytes.len()` long
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), allocation.addr as usize as *mut u8, bytes.len());
        }
        Ok(())
    }

    /// Copy the whole of `allocation` out
    pub fn read(&self, allocation: &Allocation) -> DeviceResult<Vec<u8>> {
        let memory = self.memory.lock();
        if !memory.blocks.contains_key(&allocation.addr) {
            return Err(DeviceError::TransferFailed {
                size: allocation.size,
                reason: format!("read of freed allocation {:#x}", allocation.addr),
            });
        }
        let mut out = vec![0u8; allocation.size];
        // Safety: the block is live and `allocation.size` long
        unsafe {
            std::ptr::copy_nonoverlapping(
                allocation.addr as usize as *const u8,
                out.as_mut_ptr(),
                allocation.size,
            );
        }
        Ok(out)
    }

    /// Copy `allocation` out as elements of `T`
    ///
    /// Trailing bytes that do not fill a whole element are ignored.
    pub fn read_as<T: Pod>(&self, allocation: &Allocation) -> DeviceResult<Vec<T>> {
        let bytes = self.read(allocation)?;
        let mut out = vec![T::zeroed(); bytes.len() / size_of::<T>().max(1)];
        let len = std::mem::size_of_val(out.as_slice());
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&bytes[..len]);
        Ok(out)
    }

    /// Staging buffers currently allocated
    pub fn live_staging(&self) -> usize {
        self.memory.lock().blocks.values().filter(|b| b.staging).count()
    }

    /// Staging bytes currently allocated at `placement`
    pub fn staging_bytes(&self, placement: Placement) -> usize {
        self.memory
            .lock()
            .staging_bytes
            .get(&placement)
            .copied()
            .unwrap_or(0)
    }

    /// Number of transfers enqueued so far
    pub fn transfers_enqueued(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    /// Number of strided copy kernels launched so far
    pub fn kernels_launched(&self) -> usize {
        self.kernels.load(Ordering::SeqCst)
    }

    /// Wait until every stream has drained its queue
    ///
    /// Must not be called from work running on one of this backend's
    /// streams, such as a completion callback.
    pub fn synchronize(&self) {
        let senders: Vec<_> = self.streams.lock().values().cloned().collect();
        let mut handles = Vec::with_capacity(senders.len());
        for sender in senders {
            let (handle, completer) = CompletionHandle::pending();
            let job: Job = Box::new(move || completer.complete());
            if sender.send(job).is_ok() {
                handles.push(handle);
            }
        }
        for handle in handles {
            let _ = handle.wait();
        }
    }

    fn check_placement(&self, placement: Placement) -> DeviceResult<()> {
        match placement {
            Placement::Device(id) if id.index() >= self.device_count => Err(DeviceError::UnknownDevice(id)),
            _ => Ok(()),
        }
    }

    fn allocate(&self, placement: Placement, size_bytes: usize, staging: bool) -> DeviceResult<Allocation> {
        self.check_placement(placement)?;
        let oom = || DeviceError::OutOfMemory {
            placement,
            size: size_bytes,
        };

        let mut memory = self.memory.lock();
        if staging {
            let used = memory.staging_bytes.get(&placement).copied().unwrap_or(0);
            if let Some(&limit) = self.staging_limits.get(&placement) {
                if used + size_bytes > limit {
                    debug!(%placement, size_bytes, used, limit, "emulated staging limit reached");
                    return Err(oom());
                }
            }
        }

        let layout = block_layout(size_bytes).ok_or_else(oom)?;
        // Safety: layout has non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(oom());
        }

        let allocation = Allocation {
            addr: ptr as usize as u64,
            size: size_bytes,
            placement,
        };
        if staging {
            *memory.staging_bytes.entry(placement).or_insert(0) += size_bytes;
        }
        memory.blocks.insert(allocation.addr, Block { allocation, staging });
        trace!(%placement, size_bytes, staging, addr = allocation.addr, "emulated alloc");
        Ok(allocation)
    }

    fn submit(&self, stream: Stream, job: Job) -> DeviceResult<()> {
        let launch_failed = |reason: String| DeviceError::LaunchFailed {
            kernel: "emulated_stream",
            reason,
        };

        let mut streams = self.streams.lock();
        let sender = match streams.entry(stream) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel::<Job>();
                let memory = Arc::clone(&self.memory);
                thread::Builder::new()
                    .name(format!("emulated-stream-{}-{}", stream.device, stream.id))
                    .spawn(move || {
                        for job in rx {
                            job();
                        }
                        drop(memory);
                    })
                    .map_err(|e| launch_failed(e.to_string()))?;
                entry.insert(tx).clone()
            }
        };
        sender
            .send(job)
            .map_err(|_| launch_failed(format!("stream {stream:?} worker has exited")))
    }

    fn take_fault(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Lowest and one-past-highest byte touched by a strided region
fn byte_span(addr: u64, shape: &[usize], strides: &[isize], elem: usize) -> Option<(u64, usize)> {
    if shape.contains(&0) {
        return Some((addr, 0));
    }
    let mut lo: i128 = 0;
    let mut hi: i128 = 0;
    for (&n, &s) in shape.iter().zip(strides) {
        let reach = (n as i128 - 1) * s as i128;
        if reach < 0 {
            lo += reach;
        } else {
            hi += reach;
        }
    }
    let start = addr as i128 + lo * elem as i128;
    let len = (hi - lo + 1) * elem as i128;
    Some((u64::try_from(start).ok()?, usize::try_from(len).ok()?))
}

impl DeviceBackend for EmulatedBackend {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn device_count(&self) -> usize {
        self.device_count
    }

    fn allocate_staging(&self, placement: Placement, size_bytes: usize) -> DeviceResult<Allocation> {
        self.allocate(placement, size_bytes, true)
    }

    fn free(&self, allocation: Allocation) {
        let Some(block) = self.memory.lock().remove(allocation.addr) else {
            debug!(addr = allocation.addr, "emulated free of unknown allocation");
            return;
        };
        dealloc_block(&block.allocation);
    }

    fn enqueue_transfer(&self, transfer: Transfer, stream: Stream) -> DeviceResult<CompletionHandle> {
        self.check_placement(Placement::Device(stream.device))?;
        let on_stream = Placement::Device(stream.device);
        {
            let memory = self.memory.lock();
            let (src_ok, dst_ok) = match transfer.direction {
                Direction::HostToDevice => (true, memory.contains(on_stream, transfer.dst, transfer.size)),
                Direction::DeviceToHost => (memory.contains(on_stream, transfer.src, transfer.size), true),
                Direction::DeviceToDevice => (
                    memory.contains(on_stream, transfer.src, transfer.size),
                    memory.contains_on_any_device(transfer.dst, transfer.size),
                ),
            };
            if !src_ok || !dst_ok {
                return Err(DeviceError::LaunchFailed {
                    kernel: "transfer",
                    reason: format!("{transfer:?} is outside device allocations"),
                });
            }
        }

        self.transfers.fetch_add(1, Ordering::SeqCst);
        let fail = self.take_fault();
        let latency = self.latency;
        let (handle, completer) = CompletionHandle::pending();
        self.submit(
            stream,
            Box::new(move || {
                if !latency.is_zero() {
                    thread::sleep(latency);
                }
                if fail {
                    completer.fail(DeviceError::TransferFailed {
                        size: transfer.size,
                        reason: "injected fault".into(),
                    });
                    return;
                }
                // Safety: both ranges were checked against live allocations
                // (or belong to the caller's host memory) at enqueue time.
                unsafe {
                    std::ptr::copy(
                        transfer.src as usize as *const u8,
                        transfer.dst as usize as *mut u8,
                        transfer.size,
                    );
                }
                completer.complete();
            }),
        )?;
        Ok(handle)
    }

    fn launch_strided_copy(&self, launch: &StridedCopyLaunch, stream: Stream) -> DeviceResult<CompletionHandle> {
        let failed = |reason: String| DeviceError::LaunchFailed {
            kernel: "strided_copy",
            reason,
        };
        self.check_placement(Placement::Device(launch.device))?;
        if stream.device != launch.device {
            return Err(failed(format!("stream {stream:?} is not on device {}", launch.device)));
        }
        if launch.shape.len() > MAX_KERNEL_DIMS {
            return Err(failed(format!("rank {} exceeds {MAX_KERNEL_DIMS}", launch.shape.len())));
        }
        let cast = select_cast(launch.src_dtype, launch.dst_dtype).map_err(|e| failed(e.to_string()))?;

        let device = Placement::Device(launch.device);
        let spans = (
            byte_span(launch.src, &launch.shape, &launch.src_strides, launch.src_dtype.size_in_bytes()),
            byte_span(launch.dst, &launch.shape, &launch.dst_strides, launch.dst_dtype.size_in_bytes()),
        );
        let in_bounds = match spans {
            (Some((src, src_len)), Some((dst, dst_len))) => {
                let memory = self.memory.lock();
                memory.contains(device, src, src_len) && memory.contains(device, dst, dst_len)
            }
            _ => false,
        };
        if !in_bounds {
            return Err(failed(format!("{launch:?} is outside allocations on device {}", launch.device)));
        }

        self.kernels.fetch_add(1, Ordering::SeqCst);
        let launch = launch.clone();
        let latency = self.latency;
        let (handle, completer) = CompletionHandle::pending();
        self.submit(
            stream,
            Box::new(move || {
                if !latency.is_zero() {
                    thread::sleep(latency);
                }
                // Safety: both regions were bounds-checked at launch time and
                // the engine keeps them alive until this handle settles.
                unsafe {
                    apply_strided(
                        &cast,
                        launch.src as usize as *const u8,
                        launch.dst as usize as *mut u8,
                        &launch.shape,
                        &launch.src_strides,
                        &launch.dst_strides,
                    );
                }
                completer.complete();
            }),
        )?;
        Ok(handle)
    }

    fn has_peer_path(&self, src: DeviceId, dst: DeviceId) -> bool {
        src == dst || self.peers.contains(&(src, dst))
    }

    fn default_stream(&self, device: DeviceId) -> Stream {
        Stream { device, id: 0 }
    }
}

impl Drop for EmulatedBackend {
    fn drop(&mut self) {
        // Closing the queues lets each worker exit once drained. This may run
        // on a worker itself (a settle callback holding the last reference),
        // so it must not wait on any stream.
        let streams = std::mem::take(self.streams.get_mut());
        trace!(streams = streams.len(), "emulated backend dropped");
    }
}

impl std::fmt::Debug for EmulatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedBackend")
            .field("device_count", &self.device_count)
            .field("peers", &(self.peers.len() / 2))
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use smallvec::smallvec;

    const D0: Placement = Placement::Device(DeviceId(0));

    #[test]
    fn test_transfer_roundtrip() {
        let backend = EmulatedBackend::new(1);
        let buf = backend.alloc_buffer(D0, 8).unwrap();
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let stream = backend.default_stream(DeviceId(0));
        let h2d = Transfer {
            src: src.as_ptr() as usize as u64,
            dst: buf.addr,
            size: 8,
            direction: Direction::HostToDevice,
        };
        backend.enqueue_transfer(h2d, stream).unwrap().wait().unwrap();
        assert_eq!(backend.read(&buf).unwrap(), src.to_vec());
    }

    #[test]
    fn test_out_of_bounds_transfer_rejected() {
        let backend = EmulatedBackend::new(1);
        let buf = backend.alloc_buffer(D0, 8).unwrap();
        let src = [0u8; 16];
        let t = Transfer {
            src: src.as_ptr() as usize as u64,
            dst: buf.addr,
            size: 16,
            direction: Direction::HostToDevice,
        };
        let err = backend.enqueue_transfer(t, backend.default_stream(DeviceId(0))).unwrap_err();
        assert!(matches!(err, DeviceError::LaunchFailed { kernel: "transfer", .. }));
    }

    #[test]
    fn test_injected_fault_fails_handle() {
        let backend = EmulatedBackend::new(1);
        let a = backend.alloc_buffer(D0, 4).unwrap();
        let b = backend.alloc_buffer(D0, 4).unwrap();
        backend.fail_next_transfers(1);
        let t = Transfer {
            src: a.addr,
            dst: b.addr,
            size: 4,
            direction: Direction::DeviceToDevice,
        };
        let stream = backend.default_stream(DeviceId(0));
        let first = backend.enqueue_transfer(t, stream).unwrap();
        let second = backend.enqueue_transfer(t, stream).unwrap();
        assert!(matches!(first.wait(), Err(DeviceError::TransferFailed { .. })));
        assert_eq!(second.wait(), Ok(()));
    }

    #[test]
    fn test_staging_limit_and_accounting() {
        let backend = EmulatedBackend::new(1).with_staging_limit(D0, 100);
        let a = backend.allocate_staging(D0, 60).unwrap();
        assert!(matches!(
            backend.allocate_staging(D0, 60),
            Err(DeviceError::OutOfMemory { size: 60, .. })
        ));
        assert_eq!(backend.live_staging(), 1);
        backend.free(a);
        assert_eq!(backend.live_staging(), 0);
        assert_eq!(backend.staging_bytes(D0), 0);
        assert!(backend.allocate_staging(D0, 100).is_ok());
        assert!(matches!(
            backend.allocate_staging(Placement::Device(DeviceId(3)), 1),
            Err(DeviceError::UnknownDevice(DeviceId(3)))
        ));
    }

    #[test]
    fn test_strided_kernel_transposes_with_cast() {
        let backend = EmulatedBackend::new(1);
        let src = backend.alloc_buffer(D0, 6 * 4).unwrap();
        let dst = backend.alloc_buffer(D0, 6 * 8).unwrap();
        let values: Vec<i32> = (0..6).collect();
        backend.write(&src, bytemuck::cast_slice(&values)).unwrap();
        let launch = StridedCopyLaunch {
            device: DeviceId(0),
            src: src.addr,
            dst: dst.addr,
            src_dtype: DType::I32,
            dst_dtype: DType::F64,
            shape: smallvec![3, 2],
            src_strides: smallvec![1, 3],
            dst_strides: smallvec![2, 1],
        };
        backend
            .launch_strided_copy(&launch, backend.default_stream(DeviceId(0)))
            .unwrap()
            .wait()
            .unwrap();
        let out: Vec<f64> = backend.read_as(&dst).unwrap();
        assert_eq!(out, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert_eq!(backend.kernels_launched(), 1);
    }

    #[test]
    fn test_stream_is_fifo() {
        let backend = EmulatedBackend::new(1).with_latency(Duration::from_millis(2));
        let a = backend.alloc_buffer(D0, 4).unwrap();
        let b = backend.alloc_buffer(D0, 4).unwrap();
        backend.write(&a, &[9, 9, 9, 9]).unwrap();
        let stream = backend.create_stream(DeviceId(0));
        let copy = |src: u64, dst: u64| Transfer {
            src,
            dst,
            size: 4,
            direction: Direction::DeviceToDevice,
        };
        let _first = backend.enqueue_transfer(copy(a.addr, b.addr), stream).unwrap();
        let second = backend.enqueue_transfer(copy(b.addr, a.addr), stream).unwrap();
        assert_eq!(second.status(), crate::runtime::Status::Pending);
        second.wait().unwrap();
        assert_eq!(backend.read(&a).unwrap(), vec![9, 9, 9, 9]);
    }

    #[test]
    fn test_drop_leaves_queued_work_running() {
        let backend = EmulatedBackend::new(1).with_latency(Duration::from_millis(20));
        let a = backend.alloc_buffer(D0, 4).unwrap();
        let b = backend.alloc_buffer(D0, 4).unwrap();
        let t = Transfer {
            src: a.addr,
            dst: b.addr,
            size: 4,
            direction: Direction::DeviceToDevice,
        };
        let handle = backend.enqueue_transfer(t, backend.default_stream(DeviceId(0))).unwrap();
        drop(backend);
        assert_eq!(handle.wait_timeout(Duration::from_secs(5)), Some(Ok(())));
    }

    #[test]
    fn test_peer_paths() {
        let backend = EmulatedBackend::new(3).with_peer(DeviceId(0), DeviceId(2));
        assert!(backend.has_peer_path(DeviceId(2), DeviceId(0)));
        assert!(backend.has_peer_path(DeviceId(1), DeviceId(1)));
        assert!(!backend.has_peer_path(DeviceId(0), DeviceId(1)));
        assert!(format!("{backend:?}").contains("peers: 1"));
    }
}
