//! Generated conversion kernels for the source-load path.
//!
//! When externally decoded pixels don't match a buffer's format, the
//! bytes are staged on the device in their 32-bit truecolor layout and a
//! per-format kernel rewrites them into the target layout. Kernels are
//! generated from the format's device descriptor, compiled once per
//! (device, format) pair and cached for the process lifetime.
//!
//! Numeric policy: source channels normalize to [0, 1] by dividing by
//! 255; unorm targets scale to their full range with round-to-nearest
//! and clamping; float targets store the normalized value; luma targets
//! collapse RGB with the Rec.709 coefficients.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use cudarc::driver::{CudaSlice, CudaStream};
use glint_core::format::{ChannelKind, PixelFormat};
use parking_lot::Mutex;

use crate::kernel::{rounded_global, Kernel, KernelArg, WorkLayout, DEFAULT_LOCAL_WORK};
use crate::{ComputeError, ComputeResult};

const ENTRY: &str = "convert_rgba8";

static KERNELS: OnceLock<Mutex<HashMap<(usize, PixelFormat), Arc<Kernel>>>> = OnceLock::new();

/// Runs the conversion kernel from a staged truecolor buffer into `dst`,
/// blocking until it completes.
pub(crate) fn convert_staged(
    device: usize,
    stream: &Arc<CudaStream>,
    staging: &CudaSlice<u8>,
    dst: &CudaSlice<u8>,
    width: u32,
    height: u32,
    target: PixelFormat,
) -> ComputeResult<()> {
    let kernel = cached_kernel(device, target)?;
    let layout = WorkLayout {
        local: DEFAULT_LOCAL_WORK,
        global: [
            rounded_global(width, DEFAULT_LOCAL_WORK[0]),
            rounded_global(height, DEFAULT_LOCAL_WORK[1]),
        ],
    };
    kernel.invoke_with(
        &[
            KernelArg::Bytes(staging),
            KernelArg::Bytes(dst),
            KernelArg::I32(width as i32),
            KernelArg::I32(height as i32),
        ],
        layout,
    )?;
    stream
        .synchronize()
        .map_err(|e| ComputeError::LaunchFailed(format!("conversion sync: {e:?}")))
}

fn cached_kernel(device: usize, target: PixelFormat) -> ComputeResult<Arc<Kernel>> {
    let cache = KERNELS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = cache.lock();
    if let Some(kernel) = map.get(&(device, target)) {
        return Ok(kernel.clone());
    }
    let code = conversion_source(target).ok_or_else(|| {
        ComputeError::NoConversionPath("rgba8888".into(), target.to_string())
    })?;
    let kernel = Arc::new(Kernel::new());
    kernel.load_source_for(&code, ENTRY, device)?;
    map.insert((device, target), Arc::clone(&kernel));
    Ok(kernel)
}

/// Generates the CUDA C source converting staged truecolor bytes into
/// `target`. Returns `None` for `Rgba8`, which needs no conversion.
pub fn conversion_source(target: PixelFormat) -> Option<String> {
    if target == PixelFormat::Rgba8 {
        return None;
    }
    let df = target.device_format();

    let header = if df.kind == ChannelKind::Float16 {
        "#include <cuda_fp16.h>\n"
    } else {
        ""
    };

    let body = if df.channels == 4 {
        format!(
            "    int d = px * 4;\n\
             \x20   dst[d]     = {};\n\
             \x20   dst[d + 1] = {};\n\
             \x20   dst[d + 2] = {};\n\
             \x20   dst[d + 3] = {};",
            store_expr(df.kind, "r"),
            store_expr(df.kind, "g"),
            store_expr(df.kind, "b"),
            store_expr(df.kind, "a"),
        )
    } else {
        format!(
            "    float v = 0.2126f * r + 0.7152f * g + 0.0722f * b;\n\
             \x20   dst[px] = {};",
            store_expr(df.kind, "v"),
        )
    };

    Some(format!(
        r#"{header}extern "C" __global__ void {ENTRY}(
    const unsigned char* src,
    {ctype}* dst,
    int width, int height
) {{
    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= width || y >= height) return;

    int px = y * width + x;
    int s = px * 4;
    float r = src[s]     / 255.0f;
    float g = src[s + 1] / 255.0f;
    float b = src[s + 2] / 255.0f;
    float a = src[s + 3] / 255.0f;

{body}
}}
"#,
        ctype = df.channel_ctype,
    ))
}

/// Expression storing a normalized float into one target channel.
fn store_expr(kind: ChannelKind, v: &str) -> String {
    match kind {
        ChannelKind::Unorm8 => format!("(unsigned char)(__saturatef({v}) * 255.0f + 0.5f)"),
        ChannelKind::Unorm16 => format!("(unsigned short)(__saturatef({v}) * 65535.0f + 0.5f)"),
        ChannelKind::Float16 => format!("__float2half_rn({v})"),
        ChannelKind::Float32 => v.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_source_for_rgba8() {
        assert!(conversion_source(PixelFormat::Rgba8).is_none());
    }

    #[test]
    fn test_float_target_source() {
        let code = conversion_source(PixelFormat::Rgba32f).unwrap();
        assert!(code.contains("float* dst"));
        assert!(code.contains("convert_rgba8"));
        assert!(code.contains("dst[d + 3] = a;"));
        assert!(!code.contains("cuda_fp16.h"));
    }

    #[test]
    fn test_half_target_includes_fp16_header() {
        let code = conversion_source(PixelFormat::Rgba16f).unwrap();
        assert!(code.contains("#include <cuda_fp16.h>"));
        assert!(code.contains("__half* dst"));
        assert!(code.contains("__float2half_rn(r)"));
    }

    #[test]
    fn test_unorm16_target_rounds_and_clamps() {
        let code = conversion_source(PixelFormat::Rgba16).unwrap();
        assert!(code.contains("unsigned short* dst"));
        assert!(code.contains("__saturatef(r) * 65535.0f + 0.5f"));
    }

    #[test]
    fn test_luma_targets_use_rec709() {
        for fmt in [
            PixelFormat::Luma8,
            PixelFormat::Luma16,
            PixelFormat::Luma16f,
            PixelFormat::Luma32f,
        ] {
            let code = conversion_source(fmt).unwrap();
            assert!(code.contains("0.2126f * r + 0.7152f * g + 0.0722f * b"));
            assert!(code.contains("dst[px]"));
        }
    }

    #[test]
    fn test_bounds_guard_present() {
        let code = conversion_source(PixelFormat::Luma32f).unwrap();
        assert!(code.contains("if (x >= width || y >= height) return;"));
    }
}
