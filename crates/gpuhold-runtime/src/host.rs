//! Host (CPU) backend
//!
//! Stands in for accelerators on machines without one. Memory is reserved
//! in host RAM and the multiply runs on the calling thread in f32.

use gpuhold_core::{DeviceIndex, GpuholdError, GpuholdResult, WorkloadSpec, ELEMENT_BYTES};
use rand::Rng;
use tracing::debug;

use crate::traits::{DeviceBackend, DeviceWorkload};

/// Weight of the fresh product in the blended operand
pub(crate) const PRODUCT_WEIGHT: f32 = 0.999;
/// Weight of the previous operand in the blended operand
pub(crate) const CARRY_WEIGHT: f32 = 0.001;

/// CPU backend exposing a fixed number of pretend devices
#[derive(Debug, Clone)]
pub struct HostBackend {
    device_count: u32,
}

impl HostBackend {
    /// Create a host backend with `device_count` devices
    pub fn new(device_count: u32) -> Self {
        Self { device_count }
    }
}

impl DeviceBackend for HostBackend {
    fn device_count(&self) -> GpuholdResult<u32> {
        Ok(self.device_count)
    }

    fn open(
        &self,
        device: DeviceIndex,
        spec: &WorkloadSpec,
    ) -> GpuholdResult<Box<dyn DeviceWorkload>> {
        if device >= self.device_count {
            return Err(GpuholdError::Device(format!(
                "host device {} out of range (0..{})",
                device, self.device_count
            )));
        }

        let elements = spec.element_count();
        let mut block: Vec<f32> = Vec::new();
        block.try_reserve_exact(elements).map_err(|e| {
            GpuholdError::Allocation(format!(
                "cannot reserve {} bytes on host device {}: {}",
                spec.allocate_bytes(),
                device,
                e
            ))
        })?;
        block.resize(elements, 0.0);

        let mut rng = rand::thread_rng();
        let len = spec.matrix_len();
        let a = (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let b = (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect();

        debug!(device = device, elements = elements, "Host workload initialised");

        Ok(Box::new(HostWorkload::from_parts(block, spec.mat_dim, a, b)))
    }

    fn name(&self) -> &'static str {
        "host"
    }
}

/// Reserved block plus the two operands, row-major
pub struct HostWorkload {
    block: Vec<f32>,
    dim: usize,
    a: Vec<f32>,
    b: Vec<f32>,
    product: Vec<f32>,
}

impl HostWorkload {
    pub(crate) fn from_parts(block: Vec<f32>, dim: usize, a: Vec<f32>, b: Vec<f32>) -> Self {
        Self {
            block,
            dim,
            a,
            b,
            product: vec![0.0; dim * dim],
        }
    }

    /// Current left operand
    pub fn lhs(&self) -> &[f32] {
        &self.a
    }
}

impl DeviceWorkload for HostWorkload {
    fn step(&mut self) -> GpuholdResult<()> {
        let n = self.dim;
        self.product.iter_mut().for_each(|x| *x = 0.0);
        for i in 0..n {
            for k in 0..n {
                let aik = self.a[i * n + k];
                let row = &self.b[k * n..(k + 1) * n];
                let out = &mut self.product[i * n..(i + 1) * n];
                for (o, bkj) in out.iter_mut().zip(row) {
                    *o += aik * bkj;
                }
            }
        }

        for (a, p) in self.a.iter_mut().zip(&self.product) {
            *a = PRODUCT_WEIGHT * p + CARRY_WEIGHT * *a;
        }
        Ok(())
    }

    fn reserved_bytes(&self) -> u64 {
        self.block.len() as u64 * ELEMENT_BYTES
    }
}
