//! Error types for numr-copy

use crate::dtype::DType;
use crate::runtime::{DeviceId, Placement};
use thiserror::Error;

/// Result type alias using numr-copy's error
pub type Result<T> = std::result::Result<T, CopyError>;

/// Errors surfaced by the copy engine
///
/// Everything except [`CopyError::Device`] raised from a completion handle is
/// detected while planning, before any destination memory is written.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CopyError {
    /// Source and destination shapes cannot be reconciled
    #[error(transparent)]
    Shape(#[from] ShapeError),

    /// No conversion rule between the two element types
    #[error("Unsupported cast from {src} to {dst}")]
    UnsupportedCast {
        /// Source element type
        src: DType,
        /// Destination element type
        dst: DType,
    },

    /// The device collaborator reported a failure
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Iteration rank exceeds what the device strided kernel accepts
    #[error("Iteration rank {rank} exceeds device kernel maximum of {max}")]
    RankTooHigh {
        /// Rank after dimension merging
        rank: usize,
        /// Supported maximum
        max: usize,
    },

    /// A tensor view does not describe a valid region of its allocation
    #[error("Invalid tensor view: {reason}")]
    InvalidView {
        /// What is wrong with the view
        reason: String,
    },

    /// The engine no longer accepts new copies
    #[error("Copy engine has been shut down")]
    ShutDown,

    /// No implementation is registered for the requested operation
    #[error("No operation registered for '{op}'")]
    OpNotRegistered {
        /// Operation name
        op: &'static str,
    },

    /// The operation table already holds an implementation
    #[error("Operation '{op}' is already registered")]
    AlreadyRegistered {
        /// Operation name
        op: &'static str,
    },
}

impl CopyError {
    /// Create an invalid view error
    pub fn invalid_view(reason: impl Into<String>) -> Self {
        Self::InvalidView {
            reason: reason.into(),
        }
    }

    /// Create an unsupported cast error
    pub fn unsupported_cast(src: DType, dst: DType) -> Self {
        Self::UnsupportedCast { src, dst }
    }

    /// True for errors raised before anything was enqueued or written
    ///
    /// Launch failures and abandoned work come from execution, possibly
    /// after earlier steps of the same copy were already enqueued.
    pub fn is_planning_error(&self) -> bool {
        !matches!(
            self,
            Self::Device(
                DeviceError::TransferFailed { .. } | DeviceError::LaunchFailed { .. } | DeviceError::Abandoned
            )
        )
    }
}

/// Shape and broadcast errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// A dimension pair is neither equal nor contains a 1
    #[error("Cannot broadcast source shape {src:?} to destination shape {dst:?}")]
    Incompatible {
        /// Source shape
        src: Vec<usize>,
        /// Destination shape
        dst: Vec<usize>,
    },

    /// Destination dimension of size 1 paired with a larger source dimension
    #[error(
        "Destination dimension {dim} has size 1 but iteration size is {size}; \
         destination broadcasting would write one element multiple times"
    )]
    DestinationBroadcast {
        /// Dimension index in the right-aligned iteration shape
        dim: usize,
        /// Required iteration size
        size: usize,
    },

    /// Destination has a zero stride on a dimension with more than one element
    #[error("Destination dimension {dim} (size {size}) has stride 0 and would alias writes")]
    OverlappingDestination {
        /// Dimension index in the destination layout
        dim: usize,
        /// Size of that dimension
        size: usize,
    },
}

/// Errors reported by the device collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Allocation failed on the given placement
    #[error("Out of memory on {placement}: failed to allocate {size} bytes")]
    OutOfMemory {
        /// Where the allocation was attempted
        placement: Placement,
        /// Requested size in bytes
        size: usize,
    },

    /// The device id is not known to the backend
    #[error("Device {0} is not available")]
    UnknownDevice(DeviceId),

    /// A device placement was used without a device backend attached
    #[error("No device backend attached; cannot reach {0}")]
    NoBackend(Placement),

    /// Two devices cannot exchange data directly and host staging is disabled
    #[error("No peer path between device {src} and device {dst}")]
    NoPeerPath {
        /// Source device
        src: DeviceId,
        /// Destination device
        dst: DeviceId,
    },

    /// A transfer failed while executing
    #[error("Transfer of {size} bytes failed: {reason}")]
    TransferFailed {
        /// Transfer size in bytes
        size: usize,
        /// Backend-provided description
        reason: String,
    },

    /// A kernel launch failed
    #[error("Kernel launch '{kernel}' failed: {reason}")]
    LaunchFailed {
        /// Kernel name
        kernel: &'static str,
        /// Backend-provided description
        reason: String,
    },

    /// The backend dropped a pending operation without completing it
    #[error("Device operation was abandoned before completion")]
    Abandoned,
}
