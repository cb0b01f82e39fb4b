//! # glint-compute
//!
//! GPU image buffers and runtime-compiled kernel dispatch on CUDA.
//!
//! The crate is organized around four process-level pieces:
//!
//! - [`DeviceCatalog`] - one-time enumeration and selection of compute devices
//! - [`ComputeContext`] - the process-wide context over the selected devices
//! - [`GpuImageBuffer`] - a dual-buffer (host + device) image with validity tracking
//! - [`Kernel`] - CUDA C compiled at runtime, dispatched with typed arguments
//!
//! ## Typical flow
//!
//! ```no_run
//! use glint_compute::{ComputeContext, GpuImageBuffer, Kernel, KernelArg};
//! use glint_core::PixelFormat;
//!
//! # fn main() -> glint_compute::ComputeResult<()> {
//! // First context access enumerates and selects devices.
//! let ctx = ComputeContext::global()?;
//! assert!(!ctx.devices().is_empty());
//!
//! let img = GpuImageBuffer::builder(1920, 1080, PixelFormat::Rgba32f)
//!     .alloc_device()
//!     .build()?;
//!
//! let kernel = Kernel::from_source(
//!     r#"extern "C" __global__ void fill(float* px, int w, int h) { /* ... */ }"#,
//!     "fill",
//! )?;
//! kernel.invoke(&[
//!     KernelArg::Image(&img),
//!     KernelArg::I32(1920),
//!     KernelArg::I32(1080),
//! ])?;
//! # Ok(())
//! # }
//! ```
//!
//! Errors are local to the call that produced them; no operation retries
//! internally, and a buffer or kernel that reports an error stays usable for
//! the states its flags say are valid.

#![warn(missing_docs)]

use thiserror::Error;

pub mod buffer;
pub mod catalog;
pub mod context;
pub mod convert;
pub mod kernel;

pub use buffer::{BufferState, GpuImageBuffer, ImageBufferBuilder};
pub use catalog::{DeviceCatalog, DeviceClass, DeviceInfo, DeviceSelection};
pub use context::{ComputeContext, SelectedDevice};
pub use kernel::{Kernel, KernelArg, KernelState, WorkLayout, DEFAULT_LOCAL_WORK};

/// Result type for compute operations.
pub type ComputeResult<T> = std::result::Result<T, ComputeError>;

/// Errors from device, buffer and kernel operations.
///
/// Four broad families: resource exhaustion (`AllocationFailed`), caller
/// misuse (`InvalidState`, `AlreadySelected`, the mismatch variants), native
/// API failure (`ContextFailed`, `LaunchFailed`, `TransferFailed`, the
/// payload carries the driver diagnostic), and capability gaps
/// (`NoConversionPath`, `DeviceMismatch`).
///
/// `Clone` because the one-time context initialization result is cached and
/// replayed to every later caller.
#[derive(Debug, Clone, Error)]
pub enum ComputeError {
    /// No compute devices present on this machine.
    #[error("no compute devices available")]
    NoDevices,

    /// A device index is not in the catalog or not selected.
    #[error("device {0} not found among selected devices")]
    DeviceNotFound(usize),

    /// The device selection was already made for this process.
    #[error("device selection already made for this process")]
    AlreadySelected,

    /// Creating a native device context failed.
    #[error("device creation failed: {0}")]
    DeviceCreation(String),

    /// The compute context could not be initialized.
    #[error("compute context initialization failed: {0}")]
    ContextFailed(String),

    /// A device or host allocation failed.
    #[error("allocation of {requested} bytes failed: {reason}")]
    AllocationFailed {
        /// Bytes requested
        requested: usize,
        /// Native or allocator diagnostic
        reason: String,
    },

    /// Kernel source failed to compile or load.
    #[error("kernel compilation failed: {0}")]
    KernelCompile(String),

    /// Kernel source could not be read from disk.
    #[error("failed to read kernel source {path}: {reason}")]
    SourceRead {
        /// Path that was read
        path: String,
        /// I/O diagnostic
        reason: String,
    },

    /// A kernel argument could not be bound.
    #[error("kernel argument {index} invalid: {reason}")]
    KernelArgument {
        /// Zero-based position in the argument list
        index: usize,
        /// What was wrong with it
        reason: String,
    },

    /// A kernel launch was rejected by the driver.
    #[error("kernel launch failed: {0}")]
    LaunchFailed(String),

    /// A host/device transfer failed.
    #[error("{op} transfer failed: {reason}")]
    TransferFailed {
        /// Which transfer ("upload", "download", "staging upload")
        op: &'static str,
        /// Native diagnostic
        reason: String,
    },

    /// An operation was called in a state that does not permit it.
    #[error("operation '{op}' invalid in state '{state}'")]
    InvalidState {
        /// Operation attempted
        op: &'static str,
        /// State it found
        state: &'static str,
    },

    /// Source and destination dimensions differ.
    #[error("size mismatch: destination {dst_width}x{dst_height}, source {src_width}x{src_height}")]
    SizeMismatch {
        /// Destination width
        dst_width: u32,
        /// Destination height
        dst_height: u32,
        /// Source width
        src_width: u32,
        /// Source height
        src_height: u32,
    },

    /// A caller-provided byte buffer has the wrong length.
    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch {
        /// Bytes the buffer geometry implies
        expected: usize,
        /// Bytes provided
        actual: usize,
    },

    /// No conversion kernel exists between these formats.
    #[error("no conversion path from {0} to {1}")]
    NoConversionPath(String, String),

    /// The operation needs a host buffer that was never allocated.
    #[error("host buffer not allocated")]
    HostBufferMissing,

    /// The operation needs a device buffer that was never allocated.
    #[error("device buffer not allocated")]
    DeviceBufferMissing,

    /// Launch geometry is neither set nor derivable from the arguments.
    #[error("no launch geometry: no global size set and no image argument to derive it from")]
    MissingLayout,

    /// An image argument lives on a different device than the kernel.
    #[error("image on device {buffer} passed to kernel compiled for device {kernel}")]
    DeviceMismatch {
        /// Device index the buffer belongs to
        buffer: usize,
        /// Device index the kernel was compiled for
        kernel: usize,
    },

    /// Width or height is zero.
    #[error("invalid dimensions: {0}x{1}")]
    InvalidDimensions(u32, u32),
}
