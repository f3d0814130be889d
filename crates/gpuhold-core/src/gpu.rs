//! Device indices, occupancy snapshots and workload sizing

use serde::{Deserialize, Serialize};

use crate::{GpuholdError, GpuholdResult};

/// Index of an accelerator device, stable for the process lifetime
pub type DeviceIndex = u32;

/// Bytes in one GiB
pub const GIB: u64 = 1 << 30;

/// Size of one element of the reserved memory block
pub const ELEMENT_BYTES: u64 = 4;

/// Point-in-time view of which devices have an external compute consumer
///
/// Entry `i` is `true` when device `i` was reported busy by the query.
/// A snapshot is rebuilt from scratch every scan cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupancySnapshot {
    busy: Vec<bool>,
}

impl OccupancySnapshot {
    /// Snapshot where every device in `[0, device_count)` is free
    pub fn all_free(device_count: u32) -> Self {
        Self {
            busy: vec![false; device_count as usize],
        }
    }

    /// Build a snapshot from the indices reported busy
    ///
    /// Indices outside `[0, device_count)` are ignored.
    pub fn from_busy(device_count: u32, busy: &[DeviceIndex]) -> Self {
        let mut snapshot = Self::all_free(device_count);
        for &idx in busy {
            snapshot.mark_busy(idx);
        }
        snapshot
    }

    /// Flag a device as having an active consumer
    pub fn mark_busy(&mut self, idx: DeviceIndex) {
        if let Some(flag) = self.busy.get_mut(idx as usize) {
            *flag = true;
        }
    }

    /// Number of devices covered by the snapshot
    pub fn device_count(&self) -> u32 {
        self.busy.len() as u32
    }

    /// Whether the device has an active consumer
    pub fn is_busy(&self, idx: DeviceIndex) -> bool {
        self.busy.get(idx as usize).copied().unwrap_or(false)
    }

    /// Indices with no active consumer, ascending
    pub fn idle_indices(&self) -> Vec<DeviceIndex> {
        self.busy
            .iter()
            .enumerate()
            .filter(|(_, busy)| !**busy)
            .map(|(idx, _)| idx as DeviceIndex)
            .collect()
    }
}

/// Parse the output of the compute-apps query
///
/// Each non-blank line is `deviceIndex, consumerId`. Only the device index
/// is kept; the consumer identity does not matter. The result may contain
/// duplicates when a device runs several processes.
pub fn parse_compute_apps(output: &str) -> GpuholdResult<Vec<DeviceIndex>> {
    let mut busy = Vec::new();
    for (line_idx, raw_line) in output.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let (index, _consumer) = line.split_once(',').ok_or_else(|| {
            GpuholdError::Query(format!(
                "unexpected query output at line {}: '{}'",
                line_idx + 1,
                line
            ))
        })?;

        let index = index.trim().parse::<DeviceIndex>().map_err(|e| {
            GpuholdError::Query(format!(
                "invalid device index '{}' at line {}: {}",
                index.trim(),
                line_idx + 1,
                e
            ))
        })?;
        busy.push(index);
    }
    Ok(busy)
}

/// Size of the load placed on each device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// GiB of device memory to reserve
    pub allocate_gb: u64,
    /// Dimension of the square matrices multiplied each step
    pub mat_dim: usize,
}

impl WorkloadSpec {
    /// Bytes reserved on the device
    pub fn allocate_bytes(&self) -> u64 {
        self.allocate_gb.saturating_mul(GIB)
    }

    /// Number of 4-byte elements in the reserved block
    pub fn element_count(&self) -> usize {
        (self.allocate_bytes() / ELEMENT_BYTES) as usize
    }

    /// Number of elements in one matrix
    pub fn matrix_len(&self) -> usize {
        self.mat_dim * self.mat_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_all_free() {
        let snapshot = OccupancySnapshot::all_free(3);
        assert_eq!(snapshot.device_count(), 3);
        assert_eq!(snapshot.idle_indices(), vec![0, 1, 2]);
    }

    #[test]
    fn test_snapshot_from_busy() {
        let snapshot = OccupancySnapshot::from_busy(4, &[2]);
        assert!(snapshot.is_busy(2));
        assert!(!snapshot.is_busy(0));
        assert_eq!(snapshot.idle_indices(), vec![0, 1, 3]);
    }

    #[test]
    fn test_snapshot_ignores_out_of_range() {
        let snapshot = OccupancySnapshot::from_busy(2, &[1, 7]);
        assert_eq!(snapshot.device_count(), 2);
        assert!(!snapshot.is_busy(7));
        assert_eq!(snapshot.idle_indices(), vec![0]);
    }

    #[test]
    fn test_snapshot_no_devices() {
        let snapshot = OccupancySnapshot::from_busy(0, &[0, 1]);
        assert!(snapshot.idle_indices().is_empty());
    }

    #[test]
    fn test_idle_indices_match_flags() {
        // Every busy pattern over 5 devices
        for mask in 0u32..32 {
            let busy: Vec<DeviceIndex> = (0..5).filter(|i| mask & (1 << i) != 0).collect();
            let snapshot = OccupancySnapshot::from_busy(5, &busy);
            let expected: Vec<DeviceIndex> = (0..5).filter(|i| mask & (1 << i) == 0).collect();
            assert_eq!(snapshot.idle_indices(), expected);
        }
    }

    #[test]
    fn test_parse_compute_apps() {
        let output = "0, 1234\n2, 5678\n\n2, 9999\n";
        let busy = parse_compute_apps(output).unwrap();
        assert_eq!(busy, vec![0, 2, 2]);
    }

    #[test]
    fn test_parse_compute_apps_empty() {
        assert!(parse_compute_apps("").unwrap().is_empty());
        assert!(parse_compute_apps("  \n\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_compute_apps_missing_column() {
        let result = parse_compute_apps("0\n");
        assert!(matches!(result, Err(GpuholdError::Query(_))));
    }

    #[test]
    fn test_parse_compute_apps_bad_index() {
        let result = parse_compute_apps("No running processes found, -\n");
        assert!(matches!(result, Err(GpuholdError::Query(_))));
    }

    #[test]
    fn test_workload_sizes() {
        let spec = WorkloadSpec {
            allocate_gb: 30,
            mat_dim: 8192,
        };
        assert_eq!(spec.allocate_bytes(), 30 * 1024 * 1024 * 1024);
        assert_eq!(spec.element_count(), 30 * 1024 * 1024 * 1024 / 4);
        assert_eq!(spec.matrix_len(), 8192 * 8192);
    }

    #[test]
    fn test_workload_zero_allocation() {
        let spec = WorkloadSpec {
            allocate_gb: 0,
            mat_dim: 4,
        };
        assert_eq!(spec.allocate_bytes(), 0);
        assert_eq!(spec.element_count(), 0);
    }
}
