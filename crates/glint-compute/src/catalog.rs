//! Process-wide device catalog.
//!
//! Enumeration runs once per process, on first access, and the result is
//! immutable afterwards: devices that appear or disappear later are not
//! observed. Selection is likewise one-shot. Either the caller selects a
//! subset before touching the [`crate::ComputeContext`], or the context's
//! own initialization selects every enumerated device.

use std::sync::OnceLock;

use cudarc::driver::CudaContext;
use log::{info, warn};
use parking_lot::Mutex;

use crate::{ComputeError, ComputeResult};

/// Broad device category a selection can ask for.
///
/// CUDA only ever exposes GPUs, so both classes currently admit every
/// enumerated device; the distinction is kept for selection-by-intent in
/// caller code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Any compute device.
    Any,
    /// Discrete or integrated GPUs.
    Gpu,
}

/// Identity of one enumerated device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Position in the catalog; stable for the process lifetime.
    pub index: usize,
    /// Native driver ordinal.
    pub ordinal: usize,
    /// Marketing name reported by the driver.
    pub name: String,
    /// Compute capability as (major, minor).
    pub compute_capability: (i32, i32),
}

impl DeviceInfo {
    /// Whether the device supports half-precision arithmetic (cc 5.3+).
    #[inline]
    pub fn supports_half(&self) -> bool {
        self.compute_capability >= (5, 3)
    }
}

/// How to pick the devices the process will compute on.
#[derive(Debug, Clone)]
pub enum DeviceSelection {
    /// Every catalog device of the given class.
    Class(DeviceClass),
    /// Explicit catalog indices.
    Indices(Vec<usize>),
}

/// The process-wide catalog of compute devices.
///
/// Obtained via [`DeviceCatalog::global`]. Holds the immutable enumeration
/// result plus the one-shot selection slot.
pub struct DeviceCatalog {
    devices: Vec<DeviceInfo>,
    selected: Mutex<Option<Vec<usize>>>,
}

static CATALOG: OnceLock<DeviceCatalog> = OnceLock::new();

impl DeviceCatalog {
    /// The process-wide catalog, enumerating devices on first access.
    pub fn global() -> &'static DeviceCatalog {
        CATALOG.get_or_init(|| DeviceCatalog::with_devices(enumerate()))
    }

    fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            selected: Mutex::new(None),
        }
    }

    /// All enumerated devices, in catalog order.
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// The device at a catalog index.
    pub fn device(&self, index: usize) -> ComputeResult<&DeviceInfo> {
        self.devices
            .get(index)
            .ok_or(ComputeError::DeviceNotFound(index))
    }

    /// The selected catalog indices, if a selection has been made.
    pub fn selected(&self) -> Option<Vec<usize>> {
        self.selected.lock().clone()
    }

    /// Whether a selection has been made.
    pub fn is_selected(&self) -> bool {
        self.selected.lock().is_some()
    }

    /// Selects the devices the process will compute on.
    ///
    /// One-shot: succeeds at most once per process. A failed call (bad
    /// index, empty catalog) leaves the slot unconsumed so a corrected
    /// selection can still be made.
    ///
    /// # Errors
    ///
    /// [`ComputeError::AlreadySelected`] after a prior successful call;
    /// [`ComputeError::NoDevices`] if the selection resolves to nothing;
    /// [`ComputeError::DeviceNotFound`] for an out-of-range index.
    pub fn select(&self, selection: DeviceSelection) -> ComputeResult<Vec<usize>> {
        let mut slot = self.selected.lock();
        if slot.is_some() {
            return Err(ComputeError::AlreadySelected);
        }
        let indices = self.resolve(&selection)?;
        *slot = Some(indices.clone());
        info!("selected devices {indices:?}");
        Ok(indices)
    }

    /// Returns the selection, making the default (everything) selection if
    /// none was made yet. Used by context initialization.
    pub(crate) fn selected_or_default(&self) -> ComputeResult<Vec<usize>> {
        let mut slot = self.selected.lock();
        if let Some(indices) = slot.as_ref() {
            return Ok(indices.clone());
        }
        let indices = self.resolve(&DeviceSelection::Class(DeviceClass::Any))?;
        *slot = Some(indices.clone());
        info!("auto-selected devices {indices:?}");
        Ok(indices)
    }

    fn resolve(&self, selection: &DeviceSelection) -> ComputeResult<Vec<usize>> {
        let indices = match selection {
            DeviceSelection::Class(_) => (0..self.devices.len()).collect::<Vec<_>>(),
            DeviceSelection::Indices(indices) => {
                for &i in indices {
                    if i >= self.devices.len() {
                        return Err(ComputeError::DeviceNotFound(i));
                    }
                }
                let mut indices = indices.clone();
                indices.sort_unstable();
                indices.dedup();
                indices
            }
        };
        if indices.is_empty() {
            return Err(ComputeError::NoDevices);
        }
        Ok(indices)
    }
}

/// Enumerates CUDA devices. Probe failures demote a device to absent
/// rather than failing the whole catalog.
fn enumerate() -> Vec<DeviceInfo> {
    use cudarc::driver::sys::CUdevice_attribute;

    let count = match CudaContext::device_count() {
        Ok(n) if n > 0 => n as usize,
        Ok(_) => return Vec::new(),
        Err(e) => {
            warn!("device enumeration failed: {e:?}");
            return Vec::new();
        }
    };

    let mut devices = Vec::with_capacity(count);
    for ordinal in 0..count {
        let ctx = match CudaContext::new(ordinal) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("device {ordinal} probe failed: {e:?}");
                continue;
            }
        };
        let name = ctx.name().unwrap_or_else(|_| format!("device {ordinal}"));
        let major = ctx
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .unwrap_or(0);
        let minor = ctx
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .unwrap_or(0);
        info!("found device {ordinal}: {name} (cc {major}.{minor})");
        devices.push(DeviceInfo {
            index: devices.len(),
            ordinal,
            name,
            compute_capability: (major, minor),
        });
    }
    devices
}
