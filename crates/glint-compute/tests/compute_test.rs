//! Integration tests for the compute stack.
//!
//! GPU-dependent tests return early when no CUDA device is reachable, so
//! the suite passes on machines without a GPU while still exercising the
//! full path where one exists.

use approx::assert_relative_eq;
use glint_compute::{
    BufferState, ComputeContext, ComputeError, GpuImageBuffer, Kernel, KernelArg, KernelState,
};
use glint_core::{PixelFormat, SourceFormat, SourceImage};

const FILL_KERNEL: &str = r#"
extern "C" __global__ void fill_value(
    float* dst, int width, int height, float value
) {
    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= width || y >= height) return;

    int px = (y * width + x) * 4;
    dst[px]     = value;
    dst[px + 1] = value;
    dst[px + 2] = value;
    dst[px + 3] = 1.0f;
}
"#;

const NOOP_KERNEL: &str = r#"
extern "C" __global__ void noop(int n) { (void)n; }
"#;

#[test]
fn test_context_reports_devices() {
    if !ComputeContext::is_available() {
        return;
    }
    let ctx = ComputeContext::global().unwrap();
    assert!(!ctx.devices().is_empty());
    assert!(ctx.supports_format(PixelFormat::Rgba8));
    assert!(ctx.supports_format(PixelFormat::Rgba32f));
    assert!(ctx.available_memory() > 0);

    // Replaying the accessor yields the same context.
    let again = ComputeContext::global().unwrap();
    assert_eq!(ctx.devices().len(), again.devices().len());
}

#[test]
fn test_concurrent_context_initialization() {
    // One initialization, one outcome: N concurrent first callers must all
    // observe the same terminal result, whether it is a live context or the
    // replayed initialization failure.
    let results: Vec<_> = std::thread::scope(|scope| {
        (0..8)
            .map(|_| scope.spawn(ComputeContext::global))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    let first = &results[0];
    for result in &results {
        assert_eq!(result.is_ok(), first.is_ok());
        match (result, first) {
            (Ok(ctx), Ok(reference)) => {
                assert_eq!(ctx.devices().len(), reference.devices().len());
                assert!(std::ptr::eq(*ctx, *reference));
            }
            (Err(e), Err(reference)) => assert_eq!(e.to_string(), reference.to_string()),
            _ => unreachable!(),
        }
    }
}

#[test]
fn test_upload_then_host_clear_invalidates_device() {
    if !ComputeContext::is_available() {
        return;
    }
    let buf = GpuImageBuffer::builder(16, 16, PixelFormat::Rgba8)
        .build()
        .unwrap();
    buf.write_host(&vec![42u8; 16 * 16 * 4]).unwrap();
    buf.upload().unwrap();
    assert_eq!(buf.state(), BufferState::BothValid);

    // A host-side write through the core's own clear makes the device
    // replica stale.
    buf.clear(true, false).unwrap();
    assert_eq!(buf.state(), BufferState::HostOnly);
}

#[test]
fn test_upload_download_roundtrip() {
    if !ComputeContext::is_available() {
        return;
    }
    let buf = GpuImageBuffer::builder(32, 8, PixelFormat::Rgba8)
        .build()
        .unwrap();
    let pixels: Vec<u8> = (0..32 * 8 * 4).map(|i| (i % 253) as u8).collect();
    buf.write_host(&pixels).unwrap();
    buf.upload().unwrap();

    // Scribble over the host replica through the device path: download
    // must bring back exactly what was uploaded.
    buf.download().unwrap();
    assert_eq!(buf.state(), BufferState::BothValid);
    assert_eq!(buf.read_host().unwrap(), pixels);
}

#[test]
fn test_allocate_both_orders_without_validity() {
    if !ComputeContext::is_available() {
        return;
    }
    for host_first in [true, false] {
        let buf = GpuImageBuffer::builder(64, 64, PixelFormat::Luma16)
            .build()
            .unwrap();
        if host_first {
            buf.allocate_host().unwrap();
            buf.allocate_device().unwrap();
        } else {
            buf.allocate_device().unwrap();
            buf.allocate_host().unwrap();
        }
        assert_eq!(buf.state(), BufferState::Neither);
    }
}

#[test]
fn test_kernel_fill_and_derived_layout() {
    if !ComputeContext::is_available() {
        return;
    }
    let img = GpuImageBuffer::builder(130, 130, PixelFormat::Rgba32f)
        .alloc_device()
        .zero_fill()
        .build()
        .unwrap();
    assert_eq!(img.state(), BufferState::DeviceOnly);

    let kernel = Kernel::from_source(FILL_KERNEL, "fill_value").unwrap();
    assert_eq!(kernel.state(), KernelState::Ready);

    kernel
        .invoke(&[
            KernelArg::Image(&img),
            KernelArg::I32(130),
            KernelArg::I32(130),
            KernelArg::F32(0.25),
        ])
        .unwrap();

    // 130 rounded up to the default 8x8 block.
    let layout = kernel.layout().unwrap();
    assert_eq!(layout.local, [8, 8]);
    assert_eq!(layout.global, [136, 136]);

    img.download().unwrap();
    let bytes = img.read_host().unwrap();
    let floats: &[f32] = bytemuck::cast_slice(&bytes);
    assert_relative_eq!(floats[0], 0.25);
    assert_relative_eq!(floats[3], 1.0);
    let last = (130 * 130 - 1) * 4;
    assert_relative_eq!(floats[last], 0.25);
}

#[test]
fn test_invoke_without_image_needs_layout() {
    if !ComputeContext::is_available() {
        return;
    }
    let kernel = Kernel::from_source(NOOP_KERNEL, "noop").unwrap();
    let err = kernel.invoke(&[KernelArg::I32(1)]).unwrap_err();
    assert!(matches!(err, ComputeError::MissingLayout));

    kernel.set_layout([8, 8], Some([64, 64])).unwrap();
    kernel.invoke(&[KernelArg::I32(1)]).unwrap();
    let layout = kernel.layout().unwrap();
    assert_eq!(layout.global, [64, 64]);
}

#[test]
fn test_kernel_reload_rejected() {
    if !ComputeContext::is_available() {
        return;
    }
    let kernel = Kernel::from_source(NOOP_KERNEL, "noop").unwrap();
    let err = kernel.load_source(NOOP_KERNEL, "noop").unwrap_err();
    assert!(matches!(
        err,
        ComputeError::InvalidState { op: "load", state: "ready" }
    ));
}

#[test]
fn test_kernel_compile_failure_is_terminal() {
    if !ComputeContext::is_available() {
        return;
    }
    let kernel = Kernel::new();
    let err = kernel
        .load_source("this is not CUDA", "nothing")
        .unwrap_err();
    assert!(matches!(err, ComputeError::KernelCompile(_)));
    assert_eq!(kernel.state(), KernelState::Failed);

    let err = kernel.invoke(&[]).unwrap_err();
    assert!(matches!(
        err,
        ComputeError::InvalidState { op: "invoke", state: "failed" }
    ));
}

#[test]
fn test_conversion_to_rgba32f() {
    if !ComputeContext::is_available() {
        return;
    }
    let mut pixels = Vec::with_capacity(4 * 4 * 4);
    for _ in 0..16 {
        pixels.extend_from_slice(&[255, 0, 128, 64]);
    }
    let src = SourceImage::new(4, 4, SourceFormat::Rgba8888, &pixels).unwrap();
    let buf = GpuImageBuffer::from_source(&src, PixelFormat::Rgba32f, 0).unwrap();
    assert_eq!(buf.state(), BufferState::DeviceOnly);

    buf.download().unwrap();
    let bytes = buf.read_host().unwrap();
    let floats: &[f32] = bytemuck::cast_slice(&bytes);
    assert_relative_eq!(floats[0], 1.0);
    assert_relative_eq!(floats[1], 0.0);
    assert_relative_eq!(floats[2], 128.0 / 255.0, max_relative = 1e-6);
    assert_relative_eq!(floats[3], 64.0 / 255.0, max_relative = 1e-6);
}

#[test]
fn test_conversion_to_rgba16() {
    if !ComputeContext::is_available() {
        return;
    }
    let mut pixels = Vec::with_capacity(2 * 2 * 4);
    for _ in 0..4 {
        pixels.extend_from_slice(&[200, 0, 255, 255]);
    }
    let src = SourceImage::new(2, 2, SourceFormat::Rgbx8888, &pixels).unwrap();
    let buf = GpuImageBuffer::from_source(&src, PixelFormat::Rgba16, 0).unwrap();

    buf.download().unwrap();
    let bytes = buf.read_host().unwrap();
    let shorts: &[u16] = bytemuck::cast_slice(&bytes);
    // 8-bit channels scale by exactly 257 into the 16-bit range.
    assert_eq!(shorts[0], 200 * 257);
    assert_eq!(shorts[1], 0);
    assert_eq!(shorts[2], 65535);
    assert_eq!(shorts[3], 65535);
}

#[test]
fn test_conversion_to_luma16f() {
    if !ComputeContext::is_available() {
        return;
    }
    let ctx = ComputeContext::global().unwrap();
    if !ctx.supports_format(PixelFormat::Luma16f) {
        return;
    }
    // Solid white collapses to luma 1.0 under the Rec.709 weights.
    let pixels = vec![255u8; 4 * 4 * 4];
    let src = SourceImage::new(4, 4, SourceFormat::Rgba8888, &pixels).unwrap();
    let buf = GpuImageBuffer::from_source(&src, PixelFormat::Luma16f, 0).unwrap();

    buf.download().unwrap();
    let bytes = buf.read_host().unwrap();
    let first = half::f16::from_le_bytes([bytes[0], bytes[1]]);
    let last = half::f16::from_le_bytes([bytes[30], bytes[31]]);
    assert_relative_eq!(first.to_f32(), 1.0, max_relative = 1e-3);
    assert_relative_eq!(last.to_f32(), 1.0, max_relative = 1e-3);
}

#[test]
fn test_rgba8_source_stays_on_host() {
    // The byte-identical path never touches the device.
    let pixels: Vec<u8> = (0..8 * 4 * 4).map(|i| i as u8).collect();
    let src = SourceImage::new(8, 4, SourceFormat::Rgba8888, &pixels).unwrap();
    let buf = GpuImageBuffer::builder(8, 4, PixelFormat::Rgba8)
        .build()
        .unwrap();
    buf.load_from_source(&src).unwrap();
    assert_eq!(buf.state(), BufferState::HostOnly);
    assert_eq!(buf.read_host().unwrap(), pixels);
}
