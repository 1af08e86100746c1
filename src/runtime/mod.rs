//! Execution backends for copy steps
//!
//! The engine drives two executors behind the [`Executor`] trait:
//!
//! ```text
//! Executor
//! ├── HostExecutor    (CPU loops, optionally parallel)
//! └── DeviceExecutor  (enqueue through a DeviceBackend)
//!         └── DeviceBackend (external collaborator: allocation, transfer, kernels)
//!                 └── EmulatedBackend (host-memory reference implementation)
//! ```
//!
//! Device work is asynchronous and reported through [`CompletionHandle`].

mod completion;
pub mod device;
pub mod emulated;
pub mod host;
mod traits;

pub use completion::{CompletionHandle, Completer, Status};
pub use device::DeviceExecutor;
pub use emulated::EmulatedBackend;
pub use host::HostExecutor;
pub use traits::{BoundOperand, BoundStep, DeviceBackend, DeviceResult, Executor};

use crate::dtype::DType;
use crate::tensor::{Shape, Strides};
use std::fmt;

/// Maximum rank accepted by a device strided-copy kernel
pub const MAX_KERNEL_DIMS: usize = 8;

/// Identifies one accelerator device
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Index into per-device tables
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an allocation lives
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Host (CPU) memory
    Host,
    /// Memory of one accelerator device
    Device(DeviceId),
}

impl Placement {
    /// Device id, or None for host memory
    #[inline]
    pub fn device(self) -> Option<DeviceId> {
        match self {
            Self::Host => None,
            Self::Device(id) => Some(id),
        }
    }

    /// True for host memory
    #[inline]
    pub fn is_host(self) -> bool {
        matches!(self, Self::Host)
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Device(id) => write!(f, "device:{id}"),
        }
    }
}

/// Where a copy step executes
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Venue {
    /// CPU loop over host memory
    Host,
    /// Kernel or transfer within one device
    Device(DeviceId),
    /// Host memory to device memory
    HostToDevice(DeviceId),
    /// Device memory to host memory
    DeviceToHost(DeviceId),
    /// Between two devices over a peer path
    DeviceToDevice {
        /// Device holding the source
        src: DeviceId,
        /// Device receiving the data
        dst: DeviceId,
    },
}

impl Venue {
    /// Device whose queue runs this step, None for host steps
    pub fn queue_device(self) -> Option<DeviceId> {
        match self {
            Self::Host => None,
            Self::Device(id) | Self::HostToDevice(id) | Self::DeviceToHost(id) => Some(id),
            Self::DeviceToDevice { src, .. } => Some(src),
        }
    }

    /// Transfer direction for inter-placement steps
    pub fn direction(self) -> Option<Direction> {
        match self {
            Self::Host | Self::Device(_) => None,
            Self::HostToDevice(_) => Some(Direction::HostToDevice),
            Self::DeviceToHost(_) => Some(Direction::DeviceToHost),
            Self::DeviceToDevice { .. } => Some(Direction::DeviceToDevice),
        }
    }

    /// Venue moving data from `src` to `dst`
    pub fn between(src: Placement, dst: Placement) -> Self {
        match (src, dst) {
            (Placement::Host, Placement::Host) => Self::Host,
            (Placement::Host, Placement::Device(d)) => Self::HostToDevice(d),
            (Placement::Device(s), Placement::Host) => Self::DeviceToHost(s),
            (Placement::Device(s), Placement::Device(d)) if s == d => Self::Device(s),
            (Placement::Device(s), Placement::Device(d)) => Self::DeviceToDevice { src: s, dst: d },
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Device(id) => write!(f, "device:{id}"),
            Self::HostToDevice(id) => write!(f, "host->device:{id}"),
            Self::DeviceToHost(id) => write!(f, "device:{id}->host"),
            Self::DeviceToDevice { src, dst } => write!(f, "device:{src}->device:{dst}"),
        }
    }
}

/// Transfer direction passed to [`DeviceBackend::enqueue_transfer`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device
    HostToDevice,
    /// Device to host
    DeviceToHost,
    /// Device to device (same device or peer)
    DeviceToDevice,
}

/// An in-order work queue on one device
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Stream {
    /// Owning device
    pub device: DeviceId,
    /// Backend-assigned stream number
    pub id: u32,
}

/// A block of memory obtained from [`DeviceBackend::allocate_staging`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// Base address
    pub addr: u64,
    /// Size in bytes
    pub size: usize,
    /// Where the block lives
    pub placement: Placement,
}

/// A bulk byte transfer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    /// Source address
    pub src: u64,
    /// Destination address
    pub dst: u64,
    /// Number of bytes
    pub size: usize,
    /// Direction of travel
    pub direction: Direction,
}

/// Arguments of a device strided copy kernel
///
/// `src` and `dst` address the element at index (0, ..., 0). Strides are in
/// elements of the respective dtype. Rank never exceeds [`MAX_KERNEL_DIMS`].
#[derive(Clone, Debug, PartialEq)]
pub struct StridedCopyLaunch {
    /// Device running the kernel
    pub device: DeviceId,
    /// Source origin address
    pub src: u64,
    /// Destination origin address
    pub dst: u64,
    /// Source element type
    pub src_dtype: DType,
    /// Destination element type
    pub dst_dtype: DType,
    /// Iteration shape
    pub shape: Shape,
    /// Source strides per dimension
    pub src_strides: Strides,
    /// Destination strides per dimension
    pub dst_strides: Strides,
}

impl StridedCopyLaunch {
    /// Number of elements written
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}
