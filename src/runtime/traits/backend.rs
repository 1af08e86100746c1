//! Device collaborator consumed by the copy engine

use crate::runtime::{Allocation, CompletionHandle, DeviceId, Placement, Stream, StridedCopyLaunch, Transfer};
use crate::error::DeviceError;

/// Result type for collaborator calls
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Interface to the device/context manager
///
/// The engine never manages devices, streams or allocators itself; it asks
/// the backend for exactly what a plan needs. Implementations must be usable
/// from any thread.
///
/// Enqueue methods return immediately. Synchronous errors (bad arguments,
/// unknown device) come back as `Err`; failures during execution settle the
/// returned handle as failed.
///
/// # Example
///
/// ```ignore
/// let stream = backend.default_stream(DeviceId(0));
/// let staging = backend.allocate_staging(Placement::Device(DeviceId(0)), 4096)?;
/// let done = backend.enqueue_transfer(transfer, stream)?;
/// backend.wait(&done)?;
/// backend.free(staging);
/// ```
pub trait DeviceBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &'static str;

    /// Number of devices; valid ids are `0..device_count()`
    fn device_count(&self) -> usize;

    /// Allocate a temporary buffer
    ///
    /// `Placement::Host` requests host memory suitable for transfers
    /// (pinned, where the platform distinguishes it).
    /// Returns `Err(OutOfMemory)` if allocation fails.
    fn allocate_staging(&self, placement: Placement, size_bytes: usize) -> DeviceResult<Allocation>;

    /// Release a buffer obtained from [`allocate_staging`](Self::allocate_staging)
    fn free(&self, allocation: Allocation);

    /// Enqueue a bulk byte transfer on `stream`
    fn enqueue_transfer(&self, transfer: Transfer, stream: Stream) -> DeviceResult<CompletionHandle>;

    /// Enqueue an elementwise strided copy (with optional cast) on `stream`
    fn launch_strided_copy(
        &self,
        launch: &StridedCopyLaunch,
        stream: Stream,
    ) -> DeviceResult<CompletionHandle>;

    /// Whether `src` can write directly into `dst` memory
    fn has_peer_path(&self, src: DeviceId, dst: DeviceId) -> bool;

    /// The stream used when the caller does not pick one
    fn default_stream(&self, device: DeviceId) -> Stream;

    /// Block until `handle` settles
    fn wait(&self, handle: &CompletionHandle) -> DeviceResult<()> {
        handle.wait()
    }
}
