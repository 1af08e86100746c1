//! Copies involving device placements, run against the emulated backend

mod common;

use common::{dev, device_view, device_view_mut, gather, init_tracing, iota_f32, upload};
use numr_copy::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn setup(backend: EmulatedBackend, config: CopyConfig) -> (Arc<EmulatedBackend>, CopyEngine) {
    init_tracing();
    let backend = Arc::new(backend);
    let engine = CopyEngine::new(backend.clone(), config);
    (backend, engine)
}

#[test]
fn test_host_device_round_trip() {
    let (backend, engine) = setup(EmulatedBackend::new(1), CopyConfig::default());
    let data = iota_f32(64);
    let buf = backend.alloc_buffer(dev(0), 64 * 4).unwrap();

    let src = TensorView::contiguous(&data, &[8, 8]).unwrap();
    let mut on_device = device_view_mut::<f32>(&buf, Layout::contiguous(&[8, 8]));
    let handle = engine.copy(&src, &mut on_device, false).unwrap();
    // Borrowed host memory: the copy has finished by the time it returns
    assert!(handle.is_ready());
    assert_eq!(backend.read_as::<f32>(&buf).unwrap(), data);

    let mut back = vec![0f32; 64];
    let src = device_view::<f32>(&buf, Layout::contiguous(&[8, 8]));
    let mut dst = TensorViewMut::contiguous(&mut back, &[8, 8]).unwrap();
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(back, data);
    assert_eq!(backend.transfers_enqueued(), 2);
    assert_eq!(backend.kernels_launched(), 0);
}

#[test]
fn test_transposed_upload_matches_host_reference() {
    let (backend, engine) = setup(EmulatedBackend::new(1), CopyConfig::default());
    let data = iota_f32(100 * 100);
    let layout = Layout::contiguous(&[100, 100]).transpose(0, 1).unwrap();
    let expected = gather(&data, &layout);

    let buf = backend.alloc_buffer(dev(0), data.len() * 4).unwrap();
    let src = TensorView::from_slice(&data, layout).unwrap();
    let mut dst = device_view_mut::<f32>(&buf, Layout::contiguous(&[100, 100]));
    engine.copy(&src, &mut dst, true).unwrap();

    assert_eq!(backend.read_as::<f32>(&buf).unwrap(), expected);
    assert_eq!(backend.live_staging(), 0);
}

#[test]
fn test_cast_on_upload_and_strided_download() {
    let (backend, engine) = setup(EmulatedBackend::new(1), CopyConfig::default());
    let ints: Vec<i32> = (0..6).collect();
    let buf = backend.alloc_buffer(dev(0), 6 * 4).unwrap();

    let src = TensorView::contiguous(&ints, &[2, 3]).unwrap();
    let mut dst = device_view_mut::<f32>(&buf, Layout::contiguous(&[2, 3]));
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(backend.read_as::<f32>(&buf).unwrap(), vec![0., 1., 2., 3., 4., 5.]);

    // Download into a transposed host destination: scatter runs on the host
    let mut out = vec![0f64; 6];
    let src = device_view::<f32>(&buf, Layout::contiguous(&[2, 3]));
    let t = Layout::contiguous(&[3, 2]).transpose(0, 1).unwrap();
    let mut dst = TensorViewMut::from_slice(&mut out, t).unwrap();
    let plan = engine.plan(&src, &dst.as_view()).unwrap();
    assert_eq!(plan.staging().len(), 2);
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(out, vec![0., 3., 1., 4., 2., 5.]);
    assert_eq!(backend.live_staging(), 0);
}

#[test]
fn test_broadcast_into_device() {
    let (backend, engine) = setup(EmulatedBackend::new(1), CopyConfig::default());
    let row = [1u16, 2, 3];
    let buf = backend.alloc_buffer(dev(0), 4 * 3 * 2).unwrap();
    let src = TensorView::contiguous(&row, &[3]).unwrap();
    let mut dst = device_view_mut::<u16>(&buf, Layout::contiguous(&[4, 3]));
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(backend.read_as::<u16>(&buf).unwrap(), vec![1u16, 2, 3].repeat(4));
}

#[test]
fn test_device_to_device_with_peer_path() {
    let backend = EmulatedBackend::new(2).with_peer(DeviceId(0), DeviceId(1));
    let (backend, engine) = setup(backend, CopyConfig::default());
    let data = iota_f32(100 * 100);
    let a = upload(&backend, dev(0), &data);
    let b = backend.alloc_buffer(dev(1), data.len() * 4).unwrap();

    let layout = Layout::contiguous(&[100, 100]).transpose(0, 1).unwrap();
    let src = device_view::<f32>(&a, layout.clone());
    let mut dst = device_view_mut::<f32>(&b, Layout::contiguous(&[100, 100]));
    engine.copy(&src, &mut dst, true).unwrap();

    assert_eq!(backend.read_as::<f32>(&b).unwrap(), gather(&data, &layout));
    assert_eq!(backend.kernels_launched(), 1);
    assert_eq!(backend.transfers_enqueued(), 1);
    assert_eq!(backend.staging_bytes(Placement::Host), 0);
}

#[test]
fn test_device_to_device_staged_through_host() {
    let (backend, engine) = setup(EmulatedBackend::new(2), CopyConfig::default());
    let data = iota_f32(100 * 100);
    let a = upload(&backend, dev(0), &data);
    let b = backend.alloc_buffer(dev(1), data.len() * 4).unwrap();

    let layout = Layout::contiguous(&[100, 100]).transpose(0, 1).unwrap();
    let src = device_view::<f32>(&a, layout.clone());
    let mut dst = device_view_mut::<f32>(&b, Layout::contiguous(&[100, 100]));
    let plan = engine.plan(&src, &dst.as_view()).unwrap();
    assert!(plan.staging().iter().any(|s| s.placement == Placement::Host));

    let handle = engine.copy(&src, &mut dst, false).unwrap();
    handle.wait().unwrap();
    assert_eq!(backend.read_as::<f32>(&b).unwrap(), gather(&data, &layout));
    assert_eq!(backend.transfers_enqueued(), 2);
    assert_eq!(backend.live_staging(), 0);
}

#[test]
fn test_dropping_engine_and_backend_mid_copy() {
    let backend = EmulatedBackend::new(2).with_latency(Duration::from_millis(50));
    let (backend, engine) = setup(backend, CopyConfig::default());
    let a = upload(&backend, dev(0), &iota_f32(256));
    let b = backend.alloc_buffer(dev(1), 256 * 4).unwrap();
    let src = device_view::<f32>(&a, Layout::contiguous(&[256]));
    let mut dst = device_view_mut::<f32>(&b, Layout::contiguous(&[256]));

    let handle = engine.copy(&src, &mut dst, false).unwrap();
    assert_eq!(handle.status(), Status::Pending);
    // The staging release callback now holds the last backend reference
    drop(engine);
    drop(backend);
    assert_eq!(handle.wait_timeout(Duration::from_secs(5)), Some(Ok(())));
}

#[test]
fn test_device_to_device_rejected_without_peer() {
    let config = CopyConfig::default().with_peer_fallback(PeerFallback::Reject);
    let (backend, engine) = setup(EmulatedBackend::new(2), config);
    let a = backend.alloc_buffer(dev(0), 16).unwrap();
    let b = backend.alloc_buffer(dev(1), 16).unwrap();
    let src = device_view::<u32>(&a, Layout::contiguous(&[4]));
    let mut dst = device_view_mut::<u32>(&b, Layout::contiguous(&[4]));

    let err = engine.copy(&src, &mut dst, true).unwrap_err();
    assert_eq!(
        err,
        CopyError::Device(DeviceError::NoPeerPath {
            src: DeviceId(0),
            dst: DeviceId(1)
        })
    );
    assert_eq!(backend.transfers_enqueued(), 0);
}

#[test]
fn test_transfer_fault_reported_through_handle() {
    let backend = EmulatedBackend::new(2).with_peer(DeviceId(0), DeviceId(1));
    let (backend, engine) = setup(backend, CopyConfig::default());
    let a = upload(&backend, dev(0), &[1u64, 2, 3, 4]);
    let b = backend.alloc_buffer(dev(1), 32).unwrap();
    let src = device_view::<u64>(&a, Layout::contiguous(&[4]));
    let mut dst = device_view_mut::<u64>(&b, Layout::contiguous(&[4]));

    backend.fail_next_transfers(1);
    let handle = engine.copy(&src, &mut dst, false).unwrap();
    assert!(matches!(
        handle.wait(),
        Err(DeviceError::TransferFailed { size: 32, .. })
    ));
    assert!(matches!(handle.status(), Status::Failed(_)));

    backend.fail_next_transfers(1);
    let err = engine.copy(&src, &mut dst, true).unwrap_err();
    assert!(!err.is_planning_error());

    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(backend.read_as::<u64>(&b).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn test_fault_releases_staging() {
    let (backend, engine) = setup(EmulatedBackend::new(2), CopyConfig::default());
    let a = upload(&backend, dev(0), &iota_f32(16));
    let b = backend.alloc_buffer(dev(1), 16 * 4).unwrap();
    let src = device_view::<f32>(&a, Layout::contiguous(&[4, 4]).transpose(0, 1).unwrap());
    let mut dst = device_view_mut::<f32>(&b, Layout::contiguous(&[4, 4]));

    backend.fail_next_transfers(1);
    let err = engine.copy(&src, &mut dst, true).unwrap_err();
    assert!(matches!(err, CopyError::Device(DeviceError::TransferFailed { .. })));
    // Only the first transfer ran; the upload half was skipped
    assert_eq!(backend.transfers_enqueued(), 1);
    assert_eq!(backend.live_staging(), 0);
}

#[test]
fn test_rank_too_high_for_device_kernel() {
    let (backend, engine) = setup(EmulatedBackend::new(1), CopyConfig::default());
    let shape = [2usize; 9];
    let reversed: Vec<usize> = (0..9).rev().collect();
    let layout = Layout::contiguous(&shape).permute(&reversed).unwrap();

    let a = backend.alloc_buffer(dev(0), 512 * 4).unwrap();
    let b = backend.alloc_buffer(dev(0), 512 * 4).unwrap();
    let src = device_view::<f32>(&a, layout.clone());
    let mut dst = device_view_mut::<f32>(&b, Layout::contiguous(&shape));
    let err = engine.copy(&src, &mut dst, true).unwrap_err();
    assert_eq!(err, CopyError::RankTooHigh { rank: 9, max: 8 });
    assert_eq!(backend.kernels_launched(), 0);

    // The host has no rank limit
    let data = iota_f32(512);
    let mut out = vec![0f32; 512];
    let src = TensorView::from_slice(&data, layout.clone()).unwrap();
    let mut dst = TensorViewMut::contiguous(&mut out, &shape).unwrap();
    engine.copy(&src, &mut dst, true).unwrap();
    assert_eq!(out, gather(&data, &layout));
}

#[test]
fn test_configured_rank_limit() {
    let config = CopyConfig::default().with_max_device_rank(2);
    let (backend, engine) = setup(EmulatedBackend::new(1), config);
    let layout = Layout::contiguous(&[2, 3, 4]).permute(&[2, 1, 0]).unwrap();
    let a = backend.alloc_buffer(dev(0), 24 * 4).unwrap();
    let b = backend.alloc_buffer(dev(0), 24 * 4).unwrap();
    let src = device_view::<i32>(&a, layout);
    let mut dst = device_view_mut::<i32>(&b, Layout::contiguous(&[4, 3, 2]));
    assert_eq!(
        engine.copy(&src, &mut dst, true).unwrap_err(),
        CopyError::RankTooHigh { rank: 3, max: 2 }
    );
}

#[test]
fn test_staging_allocation_failure() {
    let backend = EmulatedBackend::new(2).with_staging_limit(dev(0), 0);
    let (backend, engine) = setup(backend, CopyConfig::default());
    let a = upload(&backend, dev(0), &iota_f32(16));
    let b = upload(&backend, dev(1), &[9f32; 16]);
    let src = device_view::<f32>(&a, Layout::contiguous(&[4, 4]).transpose(0, 1).unwrap());
    let mut dst = device_view_mut::<f32>(&b, Layout::contiguous(&[4, 4]));

    let err = engine.copy(&src, &mut dst, true).unwrap_err();
    assert!(matches!(err, CopyError::Device(DeviceError::OutOfMemory { .. })));
    assert_eq!(backend.live_staging(), 0);
    assert_eq!(backend.transfers_enqueued() + backend.kernels_launched(), 0);
    assert_eq!(backend.read_as::<f32>(&b).unwrap(), vec![9f32; 16]);
}

#[test]
fn test_unknown_device() {
    let (backend, engine) = setup(EmulatedBackend::new(1), CopyConfig::default());
    let a = backend.alloc_buffer(dev(0), 16).unwrap();
    let src = device_view::<f32>(&a, Layout::contiguous(&[4]));
    let mut out = [0f32; 4];
    let mut ghost = unsafe {
        TensorViewMut::from_raw(
            out.as_mut_ptr() as usize as u64,
            16,
            DType::F32,
            Layout::contiguous(&[4]),
            dev(3),
        )
    }
    .unwrap();
    let err = engine.copy(&src, &mut ghost, true).unwrap_err();
    assert_eq!(err, CopyError::Device(DeviceError::UnknownDevice(DeviceId(3))));
}

#[test]
fn test_explicit_stream() {
    let backend = EmulatedBackend::new(2).with_latency(Duration::from_millis(10));
    let (backend, engine) = setup(backend, CopyConfig::default());
    let stream = backend.create_stream(DeviceId(0));
    let a = upload(&backend, dev(0), &[5i16; 32]);
    let b = backend.alloc_buffer(dev(0), 64).unwrap();
    let src = device_view::<i16>(&a, Layout::contiguous(&[32]));
    let mut dst = device_view_mut::<i16>(&b, Layout::contiguous(&[32]));

    let options = CopyOptions::non_blocking().on_stream(stream);
    let handle = engine.copy_with(&src, &mut dst, &options).unwrap();
    assert_eq!(handle.status(), Status::Pending);
    assert!(handle.wait_timeout(Duration::from_secs(5)).is_some());
    assert_eq!(backend.read_as::<i16>(&b).unwrap(), vec![5i16; 32]);

    // A stream on another device does not apply; the default stream is used
    let other = backend.create_stream(DeviceId(1));
    let options = CopyOptions::blocking().on_stream(other);
    engine.copy_with(&src, &mut dst, &options).unwrap();
}

#[test]
fn test_shutdown_keeps_pending_work() {
    let backend = EmulatedBackend::new(1).with_latency(Duration::from_millis(20));
    let (backend, engine) = setup(backend, CopyConfig::default());
    let a = upload(&backend, dev(0), &[3u8; 128]);
    let b = backend.alloc_buffer(dev(0), 128).unwrap();
    let src = device_view::<u8>(&a, Layout::contiguous(&[128]));
    let mut dst = device_view_mut::<u8>(&b, Layout::contiguous(&[128]));

    let handle = engine.copy(&src, &mut dst, false).unwrap();
    engine.shutdown();
    assert_eq!(engine.copy(&src, &mut dst, false).unwrap_err(), CopyError::ShutDown);
    handle.wait().unwrap();
    assert_eq!(backend.read(&b).unwrap(), vec![3u8; 128]);
}
