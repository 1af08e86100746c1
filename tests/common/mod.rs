//! Common test utilities
#![allow(dead_code)]

use bytemuck::Pod;
use numr_copy::dtype::Element;
use numr_copy::runtime::{Allocation, DeviceId, EmulatedBackend, Placement};
use numr_copy::tensor::{Layout, TensorView, TensorViewMut};
use tracing_subscriber::EnvFilter;

/// Route engine logs to the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Device placement shorthand
pub fn dev(id: u32) -> Placement {
    Placement::Device(DeviceId(id))
}

/// Upload `data` into a fresh buffer on `placement`
pub fn upload<T: Pod>(backend: &EmulatedBackend, placement: Placement, data: &[T]) -> Allocation {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    let buf = backend.alloc_buffer(placement, bytes.len()).unwrap();
    backend.write(&buf, bytes).unwrap();
    buf
}

/// Read-only view over a backend buffer
pub fn device_view<T: Element>(buf: &Allocation, layout: Layout) -> TensorView<'static> {
    unsafe { TensorView::from_raw(buf.addr, buf.size, T::DTYPE, layout, buf.placement) }.unwrap()
}

/// Writable view over a backend buffer
pub fn device_view_mut<T: Element>(buf: &Allocation, layout: Layout) -> TensorViewMut<'static> {
    unsafe { TensorViewMut::from_raw(buf.addr, buf.size, T::DTYPE, layout, buf.placement) }.unwrap()
}

/// Gather the logical elements of `layout` over `data` in row-major order
pub fn gather<T: Copy>(data: &[T], layout: &Layout) -> Vec<T> {
    let shape = layout.shape().to_vec();
    let count: usize = shape.iter().product();
    let mut out = Vec::with_capacity(count);
    let mut idx = vec![0usize; shape.len()];
    for _ in 0..count {
        out.push(data[layout.index(&idx).unwrap()]);
        for d in (0..shape.len()).rev() {
            idx[d] += 1;
            if idx[d] < shape[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    out
}

/// `0, 1, 2, ...` as `f32`
pub fn iota_f32(n: usize) -> Vec<f32> {
    (0..n).map(|i| i as f32).collect()
}
