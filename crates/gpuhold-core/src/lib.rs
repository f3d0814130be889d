//! gpuhold-core: Core types for the gpuhold daemon
//!
//! This crate provides the fundamental types used throughout gpuhold:
//! - Device indices and occupancy snapshots
//! - Parsing of the compute-apps query output
//! - Occupier reports
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod gpu;
pub mod report;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use report::*;
