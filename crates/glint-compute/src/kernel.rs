//! Runtime-compiled kernels and typed dispatch.
//!
//! A [`Kernel`] goes through a short one-way lifecycle: it starts *empty*,
//! a single load call compiles CUDA C through NVRTC and lands it in
//! *ready*, and any failure along the way parks it in *failed* for good.
//! Re-loading an instance is rejected; build a new one instead.
//!
//! Dispatch is positional: [`Kernel::invoke`] binds each [`KernelArg`] in
//! order and enqueues on the stream of the device the kernel was compiled
//! for. Image arguments double as geometry: the first one supplies the
//! global work size (extent rounded up to the local work size, 8x8 by
//! default) unless [`Kernel::set_layout`] overrode it.

use std::sync::Arc;

use cudarc::driver::{CudaFunction, CudaModule, CudaSlice, LaunchConfig, PushKernelArg};
use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::buffer::{BufferInner, GpuImageBuffer};
use crate::context::ComputeContext;
use crate::{ComputeError, ComputeResult};

/// Default local work size per dimension.
pub const DEFAULT_LOCAL_WORK: [u32; 2] = [8, 8];

/// Lifecycle state of a [`Kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelState {
    /// No source loaded yet.
    #[default]
    Empty,
    /// Source accepted, compilation in flight.
    Loaded,
    /// Compiled and bound to a device; invocable.
    Ready,
    /// Compilation or module load failed; terminal.
    Failed,
}

impl KernelState {
    /// State name for diagnostics.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Loaded => "loaded",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

/// Launch geometry of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkLayout {
    /// Threads per block, per dimension.
    pub local: [u32; 2],
    /// Total threads, per dimension; a multiple of `local` when derived.
    pub global: [u32; 2],
}

/// Rounds an extent up to the next multiple of the local work size.
#[inline]
pub const fn rounded_global(extent: u32, local: u32) -> u32 {
    extent.div_ceil(local) * local
}

/// One positional kernel argument.
pub enum KernelArg<'a> {
    /// 32-bit signed integer.
    I32(i32),
    /// 32-bit unsigned integer.
    U32(u32),
    /// 32-bit float.
    F32(f32),
    /// A raw device byte buffer.
    Bytes(&'a CudaSlice<u8>),
    /// An image buffer; binds its device replica and can supply geometry.
    Image(&'a GpuImageBuffer),
}

struct KernelInner {
    state: KernelState,
    device: usize,
    /// Keeps the module alive for the lifetime of the function handle.
    #[allow(dead_code)]
    module: Option<Arc<CudaModule>>,
    func: Option<CudaFunction>,
    local: [u32; 2],
    global: Option<[u32; 2]>,
    /// Geometry of the most recent dispatch, for inspection.
    derived: Option<WorkLayout>,
}

/// A unit of device code, compiled at runtime and invoked with typed
/// positional arguments.
///
/// Compiled state is immutable once *ready*; invocation on the same
/// instance from multiple threads is serialized internally.
pub struct Kernel {
    inner: Mutex<KernelInner>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Creates an empty kernel.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(KernelInner {
                state: KernelState::Empty,
                device: 0,
                module: None,
                func: None,
                local: DEFAULT_LOCAL_WORK,
                global: None,
                derived: None,
            }),
        }
    }

    /// Creates a kernel and loads `code` for device 0 in one step.
    pub fn from_source(code: &str, entry: &str) -> ComputeResult<Self> {
        let kernel = Self::new();
        kernel.load_source(code, entry)?;
        Ok(kernel)
    }

    /// Compiles `code` and binds `entry` on device 0.
    pub fn load_source(&self, code: &str, entry: &str) -> ComputeResult<()> {
        self.load_source_for(code, entry, 0)
    }

    /// Compiles `code` and binds `entry` on the given selected device.
    ///
    /// Valid only from the *empty* state. On compile or load failure the
    /// kernel transitions to *failed* and stays there.
    pub fn load_source_for(&self, code: &str, entry: &str, device: usize) -> ComputeResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != KernelState::Empty {
            return Err(ComputeError::InvalidState {
                op: "load",
                state: inner.state.name(),
            });
        }
        inner.state = KernelState::Loaded;

        let result = compile(code, entry, device);
        match result {
            Ok((module, func)) => {
                debug!("kernel '{entry}' ready on device {device}");
                inner.module = Some(module);
                inner.func = Some(func);
                inner.device = device;
                inner.state = KernelState::Ready;
                Ok(())
            }
            Err(e) => {
                inner.state = KernelState::Failed;
                Err(e)
            }
        }
    }

    /// Reads CUDA C from a file and loads it for device 0.
    ///
    /// An unreadable file leaves the kernel *empty*; only compilation
    /// failures park it in *failed*.
    pub fn load_file(&self, path: &std::path::Path, entry: &str) -> ComputeResult<()> {
        let code = std::fs::read_to_string(path).map_err(|e| ComputeError::SourceRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.load_source(&code, entry)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> KernelState {
        self.inner.lock().state
    }

    /// The selected device this kernel was compiled for.
    pub fn device(&self) -> usize {
        self.inner.lock().device
    }

    /// Overrides the launch geometry.
    ///
    /// `local` applies to every subsequent dispatch. With a `global`
    /// override, invocation no longer needs an image argument; without
    /// one, the global size is derived from the first image argument as
    /// usual, rounded to the new `local`.
    pub fn set_layout(&self, local: [u32; 2], global: Option<[u32; 2]>) -> ComputeResult<()> {
        if local[0] == 0 || local[1] == 0 {
            return Err(ComputeError::InvalidDimensions(local[0], local[1]));
        }
        let mut inner = self.inner.lock();
        inner.local = local;
        inner.global = global;
        Ok(())
    }

    /// Geometry of the most recent dispatch, if any.
    pub fn layout(&self) -> Option<WorkLayout> {
        self.inner.lock().derived
    }

    /// Binds `args` in order and enqueues the kernel.
    ///
    /// The first [`KernelArg::Image`] supplies the launch geometry unless
    /// a global override was set; with neither, invocation fails with
    /// [`ComputeError::MissingLayout`]. Image arguments must live on the
    /// device this kernel was compiled for and must have a device replica
    /// allocated. Enqueue errors are reported once, with no retry.
    pub fn invoke(&self, args: &[KernelArg<'_>]) -> ComputeResult<()> {
        let mut inner = self.inner.lock();
        let local = inner.local;
        let global = inner.global;
        let layout = dispatch(&inner, args, local, global)?;
        inner.derived = Some(layout);
        Ok(())
    }

    /// Dispatch with explicit geometry, leaving the stored layout alone.
    /// Used by shared in-process kernels where concurrent callers must not
    /// race through `set_layout`.
    pub(crate) fn invoke_with(&self, args: &[KernelArg<'_>], layout: WorkLayout) -> ComputeResult<()> {
        let mut inner = self.inner.lock();
        let result = dispatch(&inner, args, layout.local, Some(layout.global))?;
        inner.derived = Some(result);
        Ok(())
    }
}

fn compile(
    code: &str,
    entry: &str,
    device: usize,
) -> ComputeResult<(Arc<CudaModule>, CudaFunction)> {
    let ptx = cudarc::nvrtc::compile_ptx(code)
        .map_err(|e| ComputeError::KernelCompile(format!("nvrtc: {e:?}")))?;

    let ctx = ComputeContext::global()?;
    let cuda = ctx.cuda_for(device)?;
    let module = cuda
        .load_module(ptx)
        .map_err(|e| ComputeError::KernelCompile(format!("module load: {e:?}")))?;
    let func = module
        .load_function(entry)
        .map_err(|e| ComputeError::KernelCompile(format!("entry point '{entry}': {e:?}")))?;
    Ok((module, func))
}

fn dispatch(
    inner: &KernelInner,
    args: &[KernelArg<'_>],
    local: [u32; 2],
    global: Option<[u32; 2]>,
) -> ComputeResult<WorkLayout> {
    if inner.state != KernelState::Ready {
        return Err(ComputeError::InvalidState {
            op: "invoke",
            state: inner.state.name(),
        });
    }
    let func = inner.func.as_ref().ok_or(ComputeError::InvalidState {
        op: "invoke",
        state: inner.state.name(),
    })?;

    // Geometry: explicit override wins, else the first image argument.
    let first_image = args.iter().find_map(|a| match a {
        KernelArg::Image(img) => Some(*img),
        _ => None,
    });
    if let Some(img) = first_image {
        if img.device() != inner.device {
            return Err(ComputeError::DeviceMismatch {
                buffer: img.device(),
                kernel: inner.device,
            });
        }
    }
    let global = match (global, first_image) {
        (Some(g), _) => g,
        (None, Some(img)) => [
            rounded_global(img.width(), local[0]),
            rounded_global(img.height(), local[1]),
        ],
        (None, None) => return Err(ComputeError::MissingLayout),
    };

    let ctx = ComputeContext::global()?;
    let stream = ctx.queue_for(inner.device)?;

    // Lock each distinct image once; repeated arguments reuse the guard.
    let mut guards: Vec<(usize, MutexGuard<'_, BufferInner>)> = Vec::new();
    for (index, arg) in args.iter().enumerate() {
        if let KernelArg::Image(img) = arg {
            if img.device() != inner.device {
                return Err(ComputeError::DeviceMismatch {
                    buffer: img.device(),
                    kernel: inner.device,
                });
            }
            let key = std::ptr::from_ref::<GpuImageBuffer>(img) as usize;
            if !guards.iter().any(|(k, _)| *k == key) {
                let guard = img.lock_inner();
                if guard.dev_slice().is_none() {
                    return Err(ComputeError::KernelArgument {
                        index,
                        reason: "image has no device buffer".into(),
                    });
                }
                guards.push((key, guard));
            }
        }
    }

    let mut builder = stream.launch_builder(func);
    for arg in args {
        match arg {
            KernelArg::I32(v) => {
                builder.arg(v);
            }
            KernelArg::U32(v) => {
                builder.arg(v);
            }
            KernelArg::F32(v) => {
                builder.arg(v);
            }
            KernelArg::Bytes(slice) => {
                builder.arg(*slice);
            }
            KernelArg::Image(img) => {
                let key = std::ptr::from_ref::<GpuImageBuffer>(*img) as usize;
                let guard = guards
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, g)| g)
                    .ok_or(ComputeError::DeviceBufferMissing)?;
                let slice = guard.dev_slice().ok_or(ComputeError::DeviceBufferMissing)?;
                builder.arg(slice);
            }
        }
    }

    let cfg = LaunchConfig {
        grid_dim: (global[0].div_ceil(local[0]), global[1].div_ceil(local[1]), 1),
        block_dim: (local[0], local[1], 1),
        shared_mem_bytes: 0,
    };

    #[allow(unsafe_code)]
    unsafe { builder.launch(cfg) }
        .map_err(|e| ComputeError::LaunchFailed(format!("{e:?}")))?;

    Ok(WorkLayout { local, global })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounded_global() {
        assert_eq!(rounded_global(130, 8), 136);
        assert_eq!(rounded_global(128, 8), 128);
        assert_eq!(rounded_global(1, 8), 8);
        assert_eq!(rounded_global(1920, 8), 1920);
        assert_eq!(rounded_global(1080, 16), 1088);
    }

    #[test]
    fn test_invoke_on_empty_kernel() {
        let kernel = Kernel::new();
        let err = kernel.invoke(&[KernelArg::I32(1)]).unwrap_err();
        assert!(matches!(
            err,
            ComputeError::InvalidState { op: "invoke", state: "empty" }
        ));
    }

    #[test]
    fn test_load_file_missing_leaves_kernel_empty() {
        let kernel = Kernel::new();
        let err = kernel
            .load_file(std::path::Path::new("/nonexistent/fill.cu"), "fill")
            .unwrap_err();
        assert!(matches!(err, ComputeError::SourceRead { .. }));
        assert!(err.to_string().contains("/nonexistent/fill.cu"));
        assert_eq!(kernel.state(), KernelState::Empty);
    }

    #[test]
    fn test_set_layout_rejects_zero_local() {
        let kernel = Kernel::new();
        let err = kernel.set_layout([0, 8], None).unwrap_err();
        assert!(matches!(err, ComputeError::InvalidDimensions(0, 8)));
    }

    #[test]
    fn test_new_kernel_state() {
        let kernel = Kernel::new();
        assert_eq!(kernel.state(), KernelState::Empty);
        assert_eq!(kernel.layout(), None);
    }
}
