//! # numr-copy
//!
//! **Strided tensor copy engine for numr backends.**
//!
//! numr-copy moves tensor data between views that differ in layout, element
//! type and placement. One call to [`CopyEngine::copy`](copy::CopyEngine::copy)
//! covers all of these:
//!
//! - **Broadcasting**: a source of shape `[1, 4]` fills a `[3, 4]` destination
//! - **Layouts**: transposed, sliced, flipped or offset views on either side
//! - **Casts**: any pair of the 14 numeric dtypes plus bool
//! - **Placement**: host to device, device to host, and device to device,
//!   directly over a peer path or staged through host memory
//!
//! Every copy is planned before anything runs, so invalid shapes, casts and
//! ranks are reported without touching the destination.
//!
//! ## Quick Start
//!
//! ```
//! use numr_copy::prelude::*;
//!
//! let engine = CopyEngine::host_only(CopyConfig::default());
//!
//! let src = [1u8, 2, 3];
//! let mut dst = [0f64; 6];
//! let src = TensorView::contiguous(&src, &[3])?;
//! let mut dst_view = TensorViewMut::contiguous(&mut dst, &[2, 3])?;
//!
//! engine.copy(&src, &mut dst_view, true)?;
//! assert_eq!(dst, [1., 2., 3., 1., 2., 3.]);
//! # Ok::<(), numr_copy::error::CopyError>(())
//! ```
//!
//! ## Devices
//!
//! Device memory is reached through the [`DeviceBackend`](runtime::DeviceBackend)
//! trait. [`EmulatedBackend`](runtime::EmulatedBackend) implements it in host
//! memory with one worker thread per stream, which is what the test suite
//! runs against.
//!
//! ## Feature Flags
//!
//! - `rayon` (default): multi-threaded host copies for large contiguous steps

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod copy;
pub mod dtype;
pub mod error;
pub mod registry;
pub mod runtime;
pub mod tensor;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::copy::{CopyConfig, CopyEngine, CopyOptions, CopyPlan, PeerFallback};
    pub use crate::dtype::{Complex64, Complex128, DType, Element, can_cast};
    pub use crate::error::{CopyError, DeviceError, Result, ShapeError};
    pub use crate::registry::{OpId, OpTable, Registration, initialize_copy_ops};
    pub use crate::runtime::{
        CompletionHandle, DeviceBackend, DeviceId, EmulatedBackend, Placement, Status, Stream,
    };
    pub use crate::tensor::{Layout, TensorView, TensorViewMut};
}
