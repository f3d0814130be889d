//! gpuhold-scheduler: Decides which devices to occupy
//!
//! This crate provides the orchestration side of gpuhold:
//! - The occupancy registry of devices already under management
//! - The scan loop that finds idle devices and launches occupiers

pub mod registry;
pub mod scanner;

pub use registry::OccupancyRegistry;
pub use scanner::Scanner;
