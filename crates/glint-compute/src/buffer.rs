//! Dual-buffer GPU image.
//!
//! A [`GpuImageBuffer`] holds up to two replicas of one image, a host byte
//! vector and a device allocation, plus a [`BufferState`] saying which
//! replica is authoritative. Only this type's own operations move the
//! state: a transfer or clear updates it, and nothing else does. At most
//! one replica is authoritative except immediately after a transfer or a
//! clear of both sides.
//!
//! Buffers are allocated lazily and independently. Allocation never
//! implies validity; a freshly allocated side stays invalid until a
//! transfer, clear or load writes it.
//!
//! Each instance serializes its own mutating operations behind a
//! per-instance lock. Distinct instances are fully independent.

use cudarc::driver::CudaSlice;
use glint_core::format::PixelFormat;
use glint_core::source::SourceImage;
use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::context::ComputeContext;
use crate::convert;
use crate::{ComputeError, ComputeResult};

/// Which replicas of the image currently hold authoritative pixels.
///
/// A tagged state instead of two independent booleans, so an illegal
/// combination cannot be represented by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferState {
    /// Neither replica holds valid pixels.
    #[default]
    Neither,
    /// Only the host replica is authoritative.
    HostOnly,
    /// Only the device replica is authoritative.
    DeviceOnly,
    /// Both replicas agree; either may be read.
    BothValid,
}

impl BufferState {
    /// Whether the host replica is authoritative.
    #[inline]
    pub const fn host_valid(&self) -> bool {
        matches!(self, Self::HostOnly | Self::BothValid)
    }

    /// Whether the device replica is authoritative.
    #[inline]
    pub const fn dev_valid(&self) -> bool {
        matches!(self, Self::DeviceOnly | Self::BothValid)
    }

    /// Builds a state from the two validity flags.
    #[inline]
    pub const fn from_flags(host: bool, dev: bool) -> Self {
        match (host, dev) {
            (false, false) => Self::Neither,
            (true, false) => Self::HostOnly,
            (false, true) => Self::DeviceOnly,
            (true, true) => Self::BothValid,
        }
    }

    /// State name for diagnostics.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Neither => "neither",
            Self::HostOnly => "host-only",
            Self::DeviceOnly => "device-only",
            Self::BothValid => "both-valid",
        }
    }
}

#[derive(Debug)]
pub(crate) struct BufferInner {
    host: Option<Vec<u8>>,
    dev: Option<CudaSlice<u8>>,
    /// Staging buffer for source-format bytes on the conversion path.
    /// Kept across loads so repeated loads reuse the allocation.
    staging: Option<CudaSlice<u8>>,
    state: BufferState,
}

impl BufferInner {
    pub(crate) fn dev_slice(&self) -> Option<&CudaSlice<u8>> {
        self.dev.as_ref()
    }
}

/// Builder for [`GpuImageBuffer`], covering the construction-time choices:
/// which device, which replicas to pre-allocate, and whether to start with
/// both replicas cleared to zero (and therefore valid).
#[derive(Debug, Clone)]
pub struct ImageBufferBuilder {
    width: u32,
    height: u32,
    format: PixelFormat,
    device: usize,
    alloc_host: bool,
    alloc_device: bool,
    zero_fill: bool,
}

impl ImageBufferBuilder {
    /// Binds the buffer to a selected device (default: device 0).
    pub fn device(mut self, index: usize) -> Self {
        self.device = index;
        self
    }

    /// Pre-allocates the host replica.
    pub fn alloc_host(mut self) -> Self {
        self.alloc_host = true;
        self
    }

    /// Pre-allocates the device replica.
    pub fn alloc_device(mut self) -> Self {
        self.alloc_device = true;
        self
    }

    /// Marks the pre-allocated replicas valid, relying on them being
    /// zero-initialized. Requires at least one of [`Self::alloc_host`] or
    /// [`Self::alloc_device`]; with neither there is nothing to fill and
    /// [`Self::build`] rejects the combination.
    pub fn zero_fill(mut self) -> Self {
        self.zero_fill = true;
        self
    }

    /// Builds the buffer, performing the requested allocations.
    pub fn build(self) -> ComputeResult<GpuImageBuffer> {
        if self.width == 0 || self.height == 0 {
            return Err(ComputeError::InvalidDimensions(self.width, self.height));
        }
        if self.zero_fill && !self.alloc_host && !self.alloc_device {
            return Err(ComputeError::InvalidState {
                op: "zero_fill",
                state: "no replica allocated",
            });
        }
        let buffer = GpuImageBuffer {
            width: self.width,
            height: self.height,
            format: self.format,
            device: self.device,
            inner: Mutex::new(BufferInner {
                host: None,
                dev: None,
                staging: None,
                state: BufferState::Neither,
            }),
        };
        if self.alloc_host {
            buffer.allocate_host()?;
        }
        if self.alloc_device {
            buffer.allocate_device()?;
        }
        if self.zero_fill {
            // Fresh allocations are zeroed, so clearing here is a flag
            // update for the sides that exist.
            buffer.clear(self.alloc_host, self.alloc_device)?;
        }
        Ok(buffer)
    }
}

/// A dual-buffer (host + device) image bound to one selected device.
#[derive(Debug)]
pub struct GpuImageBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    device: usize,
    inner: Mutex<BufferInner>,
}

impl GpuImageBuffer {
    /// Starts building a buffer of the given geometry.
    pub fn builder(width: u32, height: u32, format: PixelFormat) -> ImageBufferBuilder {
        ImageBufferBuilder {
            width,
            height,
            format,
            device: 0,
            alloc_host: false,
            alloc_device: false,
            zero_fill: false,
        }
    }

    /// Builds a buffer sized to `source` and loads it, converting on the
    /// device if the source layout differs from `format`.
    pub fn from_source(
        source: &SourceImage<'_>,
        format: PixelFormat,
        device: usize,
    ) -> ComputeResult<Self> {
        let buffer = Self::builder(source.width(), source.height(), format)
            .device(device)
            .build()?;
        buffer.load_from_source(source)?;
        Ok(buffer)
    }

    /// Image width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Image height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format of both replicas.
    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Catalog index of the device this buffer is bound to.
    #[inline]
    pub fn device(&self) -> usize {
        self.device
    }

    /// Byte extent of one replica.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    /// Current validity state.
    pub fn state(&self) -> BufferState {
        self.inner.lock().state
    }

    /// (Re)allocates the host replica to the exact byte extent.
    ///
    /// Allocation carries no data: the host flag comes back invalid. The
    /// device replica and its validity are untouched.
    pub fn allocate_host(&self) -> ComputeResult<()> {
        let mut inner = self.inner.lock();
        let dev_valid = inner.state.dev_valid();
        alloc_host(&mut inner, self.byte_size())?;
        inner.state = BufferState::from_flags(false, dev_valid);
        Ok(())
    }

    /// Releases any existing device replica and allocates a fresh one.
    ///
    /// On failure the device handle stays absent and its flag invalid;
    /// the host replica is untouched.
    pub fn allocate_device(&self) -> ComputeResult<()> {
        let ctx = ComputeContext::global()?;
        let stream = ctx.queue_for(self.device)?;
        let mut inner = self.inner.lock();
        let host_valid = inner.state.host_valid();
        inner.dev = None;
        inner.state = BufferState::from_flags(host_valid, false);
        let dev = alloc_dev(stream, self.byte_size())?;
        inner.dev = Some(dev);
        Ok(())
    }

    /// Loads externally decoded pixels.
    ///
    /// The source geometry must match this buffer exactly. A source whose
    /// byte layout equals this buffer's format is copied straight into the
    /// host replica (host becomes the sole authority). Any other 32-bit
    /// truecolor source goes through the device conversion path: bytes are
    /// staged on the device and a conversion kernel writes the device
    /// replica (device becomes the sole authority). Transfers on this path
    /// block until the conversion has finished.
    ///
    /// On failure no validity flag ends up true, except the size-mismatch
    /// rejection which leaves the state exactly as it was.
    pub fn load_from_source(&self, source: &SourceImage<'_>) -> ComputeResult<()> {
        if source.width() != self.width || source.height() != self.height {
            return Err(ComputeError::SizeMismatch {
                dst_width: self.width,
                dst_height: self.height,
                src_width: source.width(),
                src_height: source.height(),
            });
        }

        match PixelFormat::from_source(source.format()) {
            Some(direct) if direct == self.format => self.load_direct(source),
            Some(staged) if staged == PixelFormat::Rgba8 => self.load_converted(source),
            _ => Err(ComputeError::NoConversionPath(
                source.format().to_string(),
                self.format.to_string(),
            )),
        }
    }

    /// Direct byte copy into the host replica.
    fn load_direct(&self, source: &SourceImage<'_>) -> ComputeResult<()> {
        let mut inner = self.inner.lock();
        if inner.host.is_none() {
            alloc_host(&mut inner, self.byte_size())?;
        }
        match inner.host.as_mut() {
            Some(host) => host.copy_from_slice(source.bytes()),
            None => return Err(ComputeError::HostBufferMissing),
        }
        inner.state = BufferState::HostOnly;
        Ok(())
    }

    /// Stage source bytes on the device and convert into the device replica.
    fn load_converted(&self, source: &SourceImage<'_>) -> ComputeResult<()> {
        let ctx = ComputeContext::global()?;
        let stream = ctx.queue_for(self.device)?;
        let mut inner = self.inner.lock();

        // Everything below mutates device memory; nothing is authoritative
        // until the conversion lands.
        inner.state = BufferState::Neither;

        if inner.dev.is_none() {
            inner.dev = Some(alloc_dev(stream, self.byte_size())?);
        }
        let staging_size = source.bytes().len();
        if inner.staging.as_ref().map(|s| s.len()) != Some(staging_size) {
            inner.staging = Some(alloc_dev(stream, staging_size)?);
        }

        {
            let BufferInner {
                dev: Some(dev),
                staging: Some(staging),
                ..
            } = &mut *inner
            else {
                return Err(ComputeError::DeviceBufferMissing);
            };

            stream
                .memcpy_htod(source.bytes(), staging)
                .map_err(|e| ComputeError::TransferFailed {
                    op: "staging upload",
                    reason: format!("{e:?}"),
                })?;
            stream
                .synchronize()
                .map_err(|e| ComputeError::TransferFailed {
                    op: "staging upload",
                    reason: format!("{e:?}"),
                })?;

            convert::convert_staged(
                self.device,
                stream,
                staging,
                dev,
                self.width,
                self.height,
                self.format,
            )?;
        }

        debug!(
            "converted {}x{} {} -> {} on device {}",
            self.width,
            self.height,
            source.format(),
            self.format,
            self.device
        );
        inner.state = BufferState::DeviceOnly;
        Ok(())
    }

    /// Transfers the host replica to the device.
    ///
    /// Requires a valid host replica; allocates the device replica if
    /// absent. On completion both replicas are valid (upload does not
    /// invalidate its source).
    pub fn upload(&self) -> ComputeResult<()> {
        let ctx = ComputeContext::global()?;
        let stream = ctx.queue_for(self.device)?;
        let mut inner = self.inner.lock();
        if inner.host.is_none() {
            return Err(ComputeError::HostBufferMissing);
        }
        if !inner.state.host_valid() {
            return Err(ComputeError::InvalidState {
                op: "upload",
                state: inner.state.name(),
            });
        }
        if inner.dev.is_none() {
            inner.dev = Some(alloc_dev(stream, self.byte_size())?);
        }
        let BufferInner {
            host: Some(host),
            dev: Some(dev),
            ..
        } = &mut *inner
        else {
            return Err(ComputeError::DeviceBufferMissing);
        };
        stream
            .memcpy_htod(host.as_slice(), dev)
            .map_err(|e| ComputeError::TransferFailed {
                op: "upload",
                reason: format!("{e:?}"),
            })?;
        inner.state = BufferState::BothValid;
        Ok(())
    }

    /// Transfers the device replica to the host, blocking until the bytes
    /// have landed.
    ///
    /// Requires a valid device replica; allocates the host replica if
    /// absent. On completion both replicas are valid.
    pub fn download(&self) -> ComputeResult<()> {
        let ctx = ComputeContext::global()?;
        let stream = ctx.queue_for(self.device)?;
        let mut inner = self.inner.lock();
        if inner.dev.is_none() {
            return Err(ComputeError::DeviceBufferMissing);
        }
        if !inner.state.dev_valid() {
            return Err(ComputeError::InvalidState {
                op: "download",
                state: inner.state.name(),
            });
        }
        if inner.host.is_none() {
            alloc_host(&mut inner, self.byte_size())?;
        }
        let BufferInner {
            host: Some(host),
            dev: Some(dev),
            ..
        } = &mut *inner
        else {
            return Err(ComputeError::HostBufferMissing);
        };
        stream
            .memcpy_dtoh(dev, host.as_mut_slice())
            .and_then(|_| stream.synchronize())
            .map_err(|e| ComputeError::TransferFailed {
                op: "download",
                reason: format!("{e:?}"),
            })?;
        inner.state = BufferState::BothValid;
        Ok(())
    }

    /// Zero-fills the requested replicas that are currently allocated.
    ///
    /// A requested replica that is not allocated is silently skipped.
    /// Afterwards the validity flags reflect exactly which replicas were
    /// actually written.
    pub fn clear(&self, host: bool, device: bool) -> ComputeResult<()> {
        if !host && !device {
            return Ok(());
        }
        let mut inner = self.inner.lock();

        let wrote_host = match (host, inner.host.as_mut()) {
            (true, Some(bytes)) => {
                bytes.fill(0);
                true
            }
            _ => false,
        };

        let wrote_dev = if device && inner.dev.is_some() {
            let ctx = ComputeContext::global()?;
            let stream = ctx.queue_for(self.device)?;
            if let Some(dev) = inner.dev.as_mut() {
                stream
                    .memset_zeros(dev)
                    .map_err(|e| ComputeError::TransferFailed {
                        op: "clear",
                        reason: format!("{e:?}"),
                    })?;
            }
            true
        } else {
            false
        };

        inner.state = BufferState::from_flags(wrote_host, wrote_dev);
        Ok(())
    }

    /// Copies the host replica out.
    ///
    /// # Errors
    ///
    /// [`ComputeError::HostBufferMissing`] if never allocated;
    /// [`ComputeError::InvalidState`] if the host replica is not valid.
    pub fn read_host(&self) -> ComputeResult<Vec<u8>> {
        let inner = self.inner.lock();
        let host = inner.host.as_ref().ok_or(ComputeError::HostBufferMissing)?;
        if !inner.state.host_valid() {
            return Err(ComputeError::InvalidState {
                op: "read_host",
                state: inner.state.name(),
            });
        }
        Ok(host.clone())
    }

    /// Overwrites the host replica with caller bytes, allocating it if
    /// absent. The host becomes the sole authority.
    pub fn write_host(&self, bytes: &[u8]) -> ComputeResult<()> {
        let expected = self.byte_size();
        if bytes.len() != expected {
            return Err(ComputeError::BufferSizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let mut inner = self.inner.lock();
        if inner.host.is_none() {
            alloc_host(&mut inner, expected)?;
        }
        match inner.host.as_mut() {
            Some(host) => host.copy_from_slice(bytes),
            None => return Err(ComputeError::HostBufferMissing),
        }
        inner.state = BufferState::HostOnly;
        Ok(())
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock()
    }
}

fn alloc_host(inner: &mut BufferInner, size: usize) -> ComputeResult<()> {
    let mut host = Vec::new();
    host.try_reserve_exact(size)
        .map_err(|e| ComputeError::AllocationFailed {
            requested: size,
            reason: e.to_string(),
        })?;
    host.resize(size, 0);
    inner.host = Some(host);
    Ok(())
}

fn alloc_dev(
    stream: &std::sync::Arc<cudarc::driver::CudaStream>,
    size: usize,
) -> ComputeResult<CudaSlice<u8>> {
    stream
        .alloc_zeros::<u8>(size)
        .map_err(|e| ComputeError::AllocationFailed {
            requested: size,
            reason: format!("{e:?}"),
        })
}
