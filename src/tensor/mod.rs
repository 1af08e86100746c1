//! Tensor layouts and views
//!
//! Tensors themselves are owned by the host runtime. The copy engine only
//! sees them through borrowed views: an allocation plus a [`Layout`].

mod layout;
mod view;

pub use layout::{Layout, Shape, Strides, contiguous_strides};
pub use view::{TensorView, TensorViewMut};
