//! Compute devices and the process-wide registry that owns them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::allocator::{AllocatorKind, AllocatorLease, AllocatorPool};
use crate::error::{Result, SrError};

const MIB: u64 = 1024 * 1024;

/// Static description of one compute device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub ordinal: u32,
    pub name: String,
    /// Device-local memory a single processing call may use, in MiB.
    pub heap_budget_mb: u64,
}

/// A device handle shared by every session created on it.
#[derive(Debug)]
pub struct GpuDevice {
    info: DeviceInfo,
    blob_pool: AllocatorPool,
    staging_pool: AllocatorPool,
    alive: Arc<AtomicBool>,
}

impl GpuDevice {
    fn new(info: DeviceInfo, alive: Arc<AtomicBool>) -> Self {
        let budget = usize::try_from(info.heap_budget_mb.saturating_mul(MIB)).unwrap_or(usize::MAX);
        Self {
            blob_pool: AllocatorPool::new(AllocatorKind::Blob, budget),
            staging_pool: AllocatorPool::new(AllocatorKind::Staging, budget),
            info,
            alive,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn ordinal(&self) -> u32 {
        self.info.ordinal
    }

    pub fn heap_budget_mb(&self) -> u64 {
        self.info.heap_budget_mb
    }

    pub fn blob_pool(&self) -> &AllocatorPool {
        &self.blob_pool
    }

    pub fn staging_pool(&self) -> &AllocatorPool {
        &self.staging_pool
    }

    pub fn acquire_blob_allocator(&self) -> AllocatorLease<'_> {
        self.blob_pool.acquire()
    }

    pub fn acquire_staging_allocator(&self) -> AllocatorLease<'_> {
        self.staging_pool.acquire()
    }

    /// Fails once the owning registry has been shut down.
    pub fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SrError::InvalidState(format!(
                "device {} used after registry shutdown",
                self.info.ordinal
            )))
        }
    }
}

/// Owner of the process-wide device state.
///
/// Sessions hold an `Arc<GpuDevice>`; [`DeviceRegistry::shutdown`] refuses to
/// tear down while any of those handles are still alive.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Vec<Arc<GpuDevice>>,
    alive: Arc<AtomicBool>,
}

impl DeviceRegistry {
    pub fn initialize(devices: Vec<DeviceInfo>) -> Result<Self> {
        if devices.is_empty() {
            return Err(SrError::device("no compute device available"));
        }

        let alive = Arc::new(AtomicBool::new(true));
        let devices: Vec<_> = devices
            .into_iter()
            .map(|info| {
                debug!(
                    ordinal = info.ordinal,
                    name = %info.name,
                    heap_budget_mb = info.heap_budget_mb,
                    "Registered device"
                );
                Arc::new(GpuDevice::new(info, Arc::clone(&alive)))
            })
            .collect();

        info!(count = devices.len(), "Device registry initialized");
        Ok(Self { devices, alive })
    }

    pub fn gpu_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.iter().map(|device| device.info())
    }

    pub fn heap_budget(&self, gpu_id: u32) -> Result<u64> {
        self.find(gpu_id).map(|device| device.heap_budget_mb())
    }

    /// Device by ordinal; `None` selects the platform default (the first
    /// registered device).
    pub fn device(&self, gpu_id: Option<u32>) -> Result<Arc<GpuDevice>> {
        self.ensure_alive()?;
        let device = match gpu_id {
            Some(ordinal) => self.find(ordinal)?,
            None => self
                .devices
                .first()
                .ok_or_else(|| SrError::device("no compute device available"))?,
        };
        Ok(Arc::clone(device))
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Release the device state. Must run after every session is dropped.
    pub fn shutdown(&self) -> Result<()> {
        self.ensure_alive()?;

        let in_use: Vec<u32> = self
            .devices
            .iter()
            .filter(|device| Arc::strong_count(device) > 1)
            .map(|device| device.ordinal())
            .collect();
        if !in_use.is_empty() {
            return Err(SrError::InvalidState(format!(
                "devices {in_use:?} still in use by live sessions"
            )));
        }

        self.alive.store(false, Ordering::Release);
        info!("Device registry shut down");
        Ok(())
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SrError::InvalidState("device registry has been shut down".into()))
        }
    }

    fn find(&self, ordinal: u32) -> Result<&Arc<GpuDevice>> {
        self.devices
            .iter()
            .find(|device| device.ordinal() == ordinal)
            .ok_or_else(|| {
                SrError::unsupported(format!(
                    "gpu {ordinal} does not exist ({} devices)",
                    self.devices.len()
                ))
            })
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            debug!("Device registry dropped without explicit shutdown");
        }
    }
}
