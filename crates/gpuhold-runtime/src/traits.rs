//! Device access trait definitions

use async_trait::async_trait;
use gpuhold_core::{DeviceIndex, GpuholdResult, WorkloadSpec};

/// Source of the idle-device list for a scan cycle
#[async_trait]
pub trait DeviceQuery: Send + Sync {
    /// Indices of devices with no active compute consumer, ascending
    ///
    /// Failures are absorbed: a query that cannot be answered yields an
    /// empty list for this cycle.
    async fn list_idle_devices(&self) -> Vec<DeviceIndex>;
}

/// Memory and compute capability of a family of devices
pub trait DeviceBackend: Send + Sync {
    /// Number of devices visible to the backend
    fn device_count(&self) -> GpuholdResult<u32>;

    /// Select the device, reserve its memory block and initialise the
    /// matrices, returning once the device has finished the setup
    fn open(&self, device: DeviceIndex, spec: &WorkloadSpec)
        -> GpuholdResult<Box<dyn DeviceWorkload>>;

    /// Get the backend name
    fn name(&self) -> &'static str;
}

/// Loaded device, owned by the thread that opened it
pub trait DeviceWorkload {
    /// One multiply-and-blend iteration
    fn step(&mut self) -> GpuholdResult<()>;

    /// Bytes held on the device for the workload's lifetime
    fn reserved_bytes(&self) -> u64;
}
