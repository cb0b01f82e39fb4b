//! The process-wide compute context.
//!
//! Initialization happens exactly once, on first access, under the usual
//! once-cell guarantee: concurrent first callers all observe the same
//! outcome, success or failure, and a failed initialization is final for
//! the process. The context owns one native context and one command stream
//! per selected device.

use std::sync::{Arc, OnceLock};

use cudarc::driver::{CudaContext, CudaStream};
use glint_core::format::{PixelFormat, ALL_FORMATS};
use log::info;

use crate::catalog::{DeviceCatalog, DeviceInfo};
use crate::{ComputeError, ComputeResult};

/// One selected device with its live native handles.
pub struct SelectedDevice {
    info: DeviceInfo,
    cuda: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl SelectedDevice {
    /// Catalog identity of this device.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub(crate) fn cuda(&self) -> &Arc<CudaContext> {
        &self.cuda
    }

    pub(crate) fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }
}

/// The process-wide compute context over the selected devices.
///
/// Obtained via [`ComputeContext::global`]. Holds per-device native
/// contexts and streams, the set of pixel formats every selected device
/// can represent, and a VRAM budget estimate.
pub struct ComputeContext {
    devices: Vec<SelectedDevice>,
    formats: Vec<PixelFormat>,
    available_memory: u64,
}

static CONTEXT: OnceLock<ComputeResult<ComputeContext>> = OnceLock::new();

impl ComputeContext {
    /// The process-wide context, initializing it on first access.
    ///
    /// If no device selection was made beforehand, every catalog device is
    /// selected. A failed initialization is cached and replayed to every
    /// later caller.
    pub fn global() -> ComputeResult<&'static ComputeContext> {
        match CONTEXT.get_or_init(Self::initialize) {
            Ok(ctx) => Ok(ctx),
            Err(e) => Err(e.clone()),
        }
    }

    /// Whether a CUDA device can be reached at all. Cheap probe, does not
    /// initialize the global context.
    pub fn is_available() -> bool {
        CudaContext::new(0).is_ok()
    }

    fn initialize() -> ComputeResult<ComputeContext> {
        let catalog = DeviceCatalog::global();
        let indices = catalog.selected_or_default()?;

        let mut devices = Vec::with_capacity(indices.len());
        for index in indices {
            let info = catalog.devices()[index].clone();
            let cuda = CudaContext::new(info.ordinal).map_err(|e| {
                ComputeError::DeviceCreation(format!(
                    "device {} ({}) init failed: {e:?}",
                    info.index, info.name
                ))
            })?;
            let stream = cuda.default_stream();
            devices.push(SelectedDevice { info, cuda, stream });
        }
        if devices.is_empty() {
            return Err(ComputeError::NoDevices);
        }

        let formats = supported_formats(devices.iter().map(|d| &d.info));
        let available_memory = query_available_memory();
        info!(
            "compute context up: {} device(s), {} format(s), ~{} MiB budget",
            devices.len(),
            formats.len(),
            available_memory / (1024 * 1024)
        );

        Ok(ComputeContext {
            devices,
            formats,
            available_memory,
        })
    }

    /// The selected devices, in catalog order.
    pub fn devices(&self) -> &[SelectedDevice] {
        &self.devices
    }

    /// Pixel formats every selected device can hold in device buffers.
    pub fn supported_formats(&self) -> &[PixelFormat] {
        &self.formats
    }

    /// Whether every selected device supports `format`.
    pub fn supports_format(&self, format: PixelFormat) -> bool {
        self.formats.contains(&format)
    }

    /// Estimated VRAM budget in bytes.
    pub fn available_memory(&self) -> u64 {
        self.available_memory
    }

    /// The selected device at a catalog index.
    pub fn device(&self, index: usize) -> ComputeResult<&SelectedDevice> {
        self.devices
            .iter()
            .find(|d| d.info.index == index)
            .ok_or(ComputeError::DeviceNotFound(index))
    }

    /// The command queue for a selected device.
    pub fn queue_for(&self, index: usize) -> ComputeResult<&Arc<CudaStream>> {
        Ok(self.device(index)?.stream())
    }

    pub(crate) fn cuda_for(&self, index: usize) -> ComputeResult<&Arc<CudaContext>> {
        Ok(self.device(index)?.cuda())
    }
}

/// Formats representable on every listed device. Half-precision formats
/// require compute capability 5.3.
fn supported_formats<'a>(devices: impl Iterator<Item = &'a DeviceInfo> + Clone) -> Vec<PixelFormat> {
    let all_half = devices.clone().all(|d| d.supports_half());
    ALL_FORMATS
        .into_iter()
        .filter(|f| all_half || !f.is_half())
        .collect()
}

/// Queries free VRAM from the driver, keeping a margin for driver overhead
/// and other processes. Falls back to 4GB if the query fails.
fn query_available_memory() -> u64 {
    use cudarc::driver::sys as cuda_sys;

    let mut free: usize = 0;
    let mut total: usize = 0;

    #[allow(unsafe_code)]
    let result = unsafe { cuda_sys::cuMemGetInfo_v2(&raw mut free, &raw mut total) };

    if result == cuda_sys::CUresult::CUDA_SUCCESS {
        (free as f64 * 0.6) as u64
    } else {
        4 * 1024 * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(cc: (i32, i32)) -> DeviceInfo {
        DeviceInfo {
            index: 0,
            ordinal: 0,
            name: "test".into(),
            compute_capability: cc,
        }
    }

    #[test]
    fn test_supported_formats_full() {
        let devices = [dev((8, 6))];
        let formats = supported_formats(devices.iter());
        assert_eq!(formats.len(), ALL_FORMATS.len());
        assert!(formats.contains(&PixelFormat::Rgba16f));
    }

    #[test]
    fn test_supported_formats_without_half() {
        let devices = [dev((5, 0))];
        let formats = supported_formats(devices.iter());
        assert!(!formats.contains(&PixelFormat::Rgba16f));
        assert!(!formats.contains(&PixelFormat::Luma16f));
        assert!(formats.contains(&PixelFormat::Rgba32f));
        assert!(formats.contains(&PixelFormat::Rgba8));
        assert_eq!(formats.len(), ALL_FORMATS.len() - 2);
    }

    #[test]
    fn test_mixed_capability_restricts_all() {
        let devices = [dev((8, 6)), dev((5, 0))];
        let formats = supported_formats(devices.iter());
        assert!(!formats.contains(&PixelFormat::Rgba16f));
    }
}
