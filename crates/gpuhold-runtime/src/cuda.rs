//! CUDA backend
//!
//! Reserves device memory through the driver API and keeps the device busy
//! with cuBLAS half-precision GEMMs.

use std::sync::Arc;

use cudarc::cublas::{sys::cublasOperation_t, CudaBlas, Gemm, GemmConfig};
use cudarc::driver::{CudaContext, CudaSlice, CudaStream};
use gpuhold_core::{DeviceIndex, GpuholdError, GpuholdResult, WorkloadSpec, ELEMENT_BYTES};
use half::f16;
use rand::Rng;
use tracing::debug;

use crate::host::{CARRY_WEIGHT, PRODUCT_WEIGHT};
use crate::traits::{DeviceBackend, DeviceWorkload};

/// NVIDIA devices through the CUDA driver
#[derive(Debug, Clone, Default)]
pub struct CudaBackend;

impl CudaBackend {
    /// Create a CUDA backend
    pub fn new() -> Self {
        Self
    }
}

impl DeviceBackend for CudaBackend {
    fn device_count(&self) -> GpuholdResult<u32> {
        let count = CudaContext::device_count()
            .map_err(|e| GpuholdError::Device(format!("cannot count CUDA devices: {:?}", e)))?;
        Ok(count.max(0) as u32)
    }

    fn open(
        &self,
        device: DeviceIndex,
        spec: &WorkloadSpec,
    ) -> GpuholdResult<Box<dyn DeviceWorkload>> {
        let ctx = CudaContext::new(device as usize).map_err(|e| {
            GpuholdError::Device(format!("cannot select CUDA device {}: {:?}", device, e))
        })?;
        let stream = ctx.default_stream();

        // A zero-sized request still goes through the allocator
        let elements = spec.element_count().max(1);
        let block = stream.alloc_zeros::<f32>(elements).map_err(|e| {
            GpuholdError::Allocation(format!(
                "cannot reserve {} bytes on CUDA device {}: {:?}",
                spec.allocate_bytes(),
                device,
                e
            ))
        })?;

        let len = spec.matrix_len();
        let mut rng = rand::thread_rng();
        let host_a: Vec<f16> = (0..len)
            .map(|_| f16::from_f32(rng.gen_range(-1.0f32..1.0)))
            .collect();
        let host_b: Vec<f16> = (0..len)
            .map(|_| f16::from_f32(rng.gen_range(-1.0f32..1.0)))
            .collect();

        let a = stream.memcpy_stod(&host_a).map_err(|e| alloc_err(device, e))?;
        let b = stream.memcpy_stod(&host_b).map_err(|e| alloc_err(device, e))?;
        let next = stream.alloc_zeros::<f16>(len).map_err(|e| alloc_err(device, e))?;

        let blas = CudaBlas::new(stream.clone()).map_err(|e| {
            GpuholdError::Device(format!("cannot create cuBLAS handle on device {}: {:?}", device, e))
        })?;

        // Deferred allocation failures surface here
        stream.synchronize().map_err(|e| alloc_err(device, e))?;

        debug!(device = device, elements = elements, "CUDA workload initialised");

        Ok(Box::new(CudaWorkload {
            _ctx: ctx,
            stream,
            blas,
            block,
            dim: spec.mat_dim as i32,
            a,
            b,
            next,
        }))
    }

    fn name(&self) -> &'static str {
        "cuda"
    }
}

fn alloc_err(device: DeviceIndex, err: impl std::fmt::Debug) -> GpuholdError {
    GpuholdError::Allocation(format!("CUDA device {} setup failed: {:?}", device, err))
}

fn compute_err(err: impl std::fmt::Debug) -> GpuholdError {
    GpuholdError::Compute(format!("{:?}", err))
}

/// Reserved block and the f16 operands on one device
struct CudaWorkload {
    _ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    blas: CudaBlas,
    block: CudaSlice<f32>,
    dim: i32,
    a: CudaSlice<f16>,
    b: CudaSlice<f16>,
    next: CudaSlice<f16>,
}

impl DeviceWorkload for CudaWorkload {
    fn step(&mut self) -> GpuholdResult<()> {
        // next = 0.999 * (a x b) + 0.001 * a, then swap into a.
        // cuBLAS is column-major, so the row-major product a x b is b x a.
        self.stream
            .memcpy_dtod(&self.a, &mut self.next)
            .map_err(compute_err)?;

        let cfg = GemmConfig {
            transa: cublasOperation_t::CUBLAS_OP_N,
            transb: cublasOperation_t::CUBLAS_OP_N,
            m: self.dim,
            n: self.dim,
            k: self.dim,
            alpha: f16::from_f32(PRODUCT_WEIGHT),
            lda: self.dim,
            ldb: self.dim,
            beta: f16::from_f32(CARRY_WEIGHT),
            ldc: self.dim,
        };
        unsafe { self.blas.gemm(cfg, &self.b, &self.a, &mut self.next) }.map_err(compute_err)?;
        std::mem::swap(&mut self.a, &mut self.next);

        self.stream.synchronize().map_err(compute_err)
    }

    fn reserved_bytes(&self) -> u64 {
        self.block.len() as u64 * ELEMENT_BYTES
    }
}
