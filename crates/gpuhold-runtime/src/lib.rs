//! gpuhold-runtime: Device access layer
//!
//! This crate provides the pieces that touch devices:
//! - Device enumeration through an external query command
//! - Compute backends (host, and CUDA behind the `cuda` feature)
//! - The occupier task that holds one device busy

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod host;
pub mod occupier;
pub mod query;
pub mod traits;

#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;
pub use host::HostBackend;
pub use occupier::{Occupier, StopFlag};
pub use query::SmiDeviceQuery;
pub use traits::{DeviceBackend, DeviceQuery, DeviceWorkload};
