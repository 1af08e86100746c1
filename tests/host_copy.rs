//! Host-to-host copies through the public engine API

mod common;

use common::{gather, init_tracing, iota_f32};
use half::f16;
use numr_copy::prelude::*;

fn engine() -> CopyEngine {
    init_tracing();
    CopyEngine::host_only(CopyConfig::default())
}

#[test]
fn test_row_broadcast() {
    let engine = engine();
    let src = [1.0f32, 2.0, 3.0, 4.0];
    let mut dst = [0f32; 12];
    let src_view = TensorView::contiguous(&src, &[1, 4]).unwrap();
    let mut dst_view = TensorViewMut::contiguous(&mut dst, &[3, 4]).unwrap();

    let handle = engine.copy(&src_view, &mut dst_view, true).unwrap();
    assert_eq!(handle.status(), Status::Ready);
    assert_eq!(dst, [1., 2., 3., 4., 1., 2., 3., 4., 1., 2., 3., 4.]);
}

#[test]
fn test_column_and_scalar_broadcast() {
    let engine = engine();
    let col = [10i64, 20];
    let mut dst = [0i64; 6];
    let src = TensorView::contiguous(&col, &[2, 1]).unwrap();
    let mut dst_view = TensorViewMut::contiguous(&mut dst, &[2, 3]).unwrap();
    engine.copy(&src, &mut dst_view, true).unwrap();
    assert_eq!(dst, [10, 10, 10, 20, 20, 20]);

    let one = [7u16];
    let mut dst = [0u16; 6];
    let src = TensorView::from_slice(&one, Layout::scalar()).unwrap();
    let mut dst_view = TensorViewMut::contiguous(&mut dst, &[2, 3]).unwrap();
    engine.copy(&src, &mut dst_view, true).unwrap();
    assert_eq!(dst, [7; 6]);
}

#[test]
fn test_permuted_source_matches_reference() {
    let engine = engine();
    let data = iota_f32(24);
    let layout = Layout::contiguous(&[2, 3, 4]).permute(&[2, 0, 1]).unwrap();
    let expected = gather(&data, &layout);

    let mut out = vec![0f32; 24];
    let src = TensorView::from_slice(&data, layout).unwrap();
    let mut dst = TensorViewMut::contiguous(&mut out, &[4, 2, 3]).unwrap();
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(out, expected);
}

#[test]
fn test_transpose_round_trip_across_types() {
    let engine = engine();
    let data: Vec<i32> = (0..35).collect();

    // i32 [5, 7] -> f64 transposed -> i32 [5, 7]
    let mut wide = vec![0f64; 35];
    let src = TensorView::contiguous(&data, &[5, 7]).unwrap();
    let t = Layout::contiguous(&[7, 5]).transpose(0, 1).unwrap();
    let mut dst = TensorViewMut::from_slice(&mut wide, t.clone()).unwrap();
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(wide[5], 1.0);

    let mut back = vec![0i32; 35];
    let src = TensorView::from_slice(&wide, t).unwrap();
    let mut dst = TensorViewMut::contiguous(&mut back, &[5, 7]).unwrap();
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(back, data);
}

#[test]
fn test_copy_is_idempotent() {
    let engine = engine();
    let data = iota_f32(12);
    let layout = Layout::contiguous(&[3, 4]).flip(1).unwrap();
    let mut out = vec![0f32; 12];

    for _ in 0..2 {
        let src = TensorView::from_slice(&data, layout.clone()).unwrap();
        let mut dst = TensorViewMut::contiguous(&mut out, &[3, 4]).unwrap();
        engine.copy(&src, &mut dst, true).unwrap();
    }
    assert_eq!(&out[..4], &[3., 2., 1., 0.]);
    assert_eq!(out, gather(&data, &layout));
}

#[test]
fn test_sliced_offset_views() {
    let engine = engine();
    let data = iota_f32(24);
    // Rows 1..3, columns 2..5 of a [4, 6] matrix
    let src_layout = Layout::contiguous(&[4, 6]).narrow(0, 1, 2).unwrap().narrow(1, 2, 3).unwrap();
    let mut out = vec![-1f32; 12];
    // Written into the middle of a [3, 4] buffer
    let dst_layout = Layout::contiguous(&[3, 4]).narrow(0, 1, 2).unwrap().narrow(1, 1, 3).unwrap();

    let src = TensorView::from_slice(&data, src_layout).unwrap();
    let mut dst = TensorViewMut::from_slice(&mut out, dst_layout).unwrap();
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(
        out,
        vec![-1., -1., -1., -1., -1., 8., 9., 10., -1., 14., 15., 16.]
    );
}

#[test]
fn test_reversed_destination() {
    let engine = engine();
    let src = [1u8, 2, 3, 4];
    let mut out = [0u8; 4];
    let src = TensorView::contiguous(&src, &[4]).unwrap();
    let mut dst = TensorViewMut::from_slice(&mut out, Layout::contiguous(&[4]).flip(0).unwrap()).unwrap();
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(out, [4, 3, 2, 1]);
}

#[test]
fn test_casts() {
    let engine = engine();

    let src = [300.7f64, -300.0, 1.9, -1.9];
    let mut out = [0i8; 4];
    let src = TensorView::contiguous(&src, &[4]).unwrap();
    let mut dst = TensorViewMut::contiguous(&mut out, &[4]).unwrap();
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(out, [127, -128, 1, -1]);

    let src = [1.0f32, 0.5, 65504.0];
    let mut out = [f16::ZERO; 3];
    let src = TensorView::contiguous(&src, &[3]).unwrap();
    let mut dst = TensorViewMut::contiguous(&mut out, &[3]).unwrap();
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(out, [f16::ONE, f16::from_f32(0.5), f16::MAX]);

    let src = [0.0f32, 0.5, -2.0];
    let mut out = [9u8; 3];
    let src = TensorView::contiguous(&src, &[3]).unwrap();
    let mut dst = TensorViewMut::from_bytes(&mut out, DType::Bool, Layout::contiguous(&[3])).unwrap();
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(out, [0, 1, 1]);

    let src = [Complex64::new(1.5, -0.25), Complex64::new(-2.0, 3.0)];
    let mut out = [Complex128::default(); 2];
    let src = TensorView::contiguous(&src, &[2]).unwrap();
    let mut dst = TensorViewMut::contiguous(&mut out, &[2]).unwrap();
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(out, [Complex128::new(1.5, -0.25), Complex128::new(-2.0, 3.0)]);
}

#[test]
fn test_zero_size_is_noop() {
    let engine = engine();
    let src: [f32; 0] = [];
    let mut out: [f32; 0] = [];
    let src = TensorView::contiguous(&src, &[0, 3]).unwrap();
    let mut dst = TensorViewMut::contiguous(&mut out, &[0, 3]).unwrap();
    let plan = engine.plan(&src, &dst.as_view()).unwrap();
    assert!(plan.is_noop());
    let handle = engine.copy(&src, &mut dst, false).unwrap();
    assert!(handle.is_ready());
}

#[test]
fn test_planning_errors_leave_destination_untouched() {
    let engine = engine();
    let src = [1f32; 12];
    let mut out = [5f32; 4];

    let src_view = TensorView::contiguous(&src, &[3, 4]).unwrap();
    let mut dst = TensorViewMut::contiguous(&mut out, &[1, 4]).unwrap();
    let err = engine.copy(&src_view, &mut dst, true).unwrap_err();
    assert_eq!(
        err,
        CopyError::Shape(ShapeError::DestinationBroadcast { dim: 0, size: 3 })
    );

    let cplx = [Complex64::new(1.0, 1.0); 4];
    let src_view = TensorView::contiguous(&cplx, &[4]).unwrap();
    let mut dst = TensorViewMut::contiguous(&mut out, &[4]).unwrap();
    let err = engine.copy(&src_view, &mut dst, true).unwrap_err();
    assert_eq!(err, CopyError::unsupported_cast(DType::Complex64, DType::F32));
    assert_eq!(out, [5f32; 4]);
}

#[test]
fn test_device_placement_without_backend() {
    let engine = engine();
    let data = [0u8; 8];
    let src = unsafe {
        TensorView::from_raw(
            data.as_ptr() as usize as u64,
            8,
            DType::U8,
            Layout::contiguous(&[8]),
            Placement::Device(DeviceId(0)),
        )
    }
    .unwrap();
    let mut out = [0u8; 8];
    let mut dst = TensorViewMut::contiguous(&mut out, &[8]).unwrap();
    let err = engine.copy(&src, &mut dst, true).unwrap_err();
    assert!(matches!(err, CopyError::Device(DeviceError::NoBackend(_))));
}

#[test]
fn test_large_copy_above_parallel_threshold() {
    init_tracing();
    let engine = CopyEngine::host_only(CopyConfig::default().with_parallel_threshold(1024));
    let n = 50_000;
    let data: Vec<u32> = (0..n as u32).collect();
    let mut out = vec![0f64; n];
    let src = TensorView::contiguous(&data, &[n]).unwrap();
    let mut dst = TensorViewMut::contiguous(&mut out, &[n]).unwrap();
    engine.copy(&src, &mut dst, true).unwrap();
    assert!(out.iter().enumerate().all(|(i, &v)| v == i as f64));
}
