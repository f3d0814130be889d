//! Device query adapter
//!
//! Runs the external compute-apps query (`nvidia-smi` by default) and turns
//! its output into the list of idle devices for one scan cycle.

use async_trait::async_trait;
use gpuhold_core::{
    parse_compute_apps, DeviceIndex, GpuholdError, GpuholdResult, OccupancySnapshot, QueryConfig,
};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::traits::{DeviceBackend, DeviceQuery};

/// Idle-device query backed by an external command
pub struct SmiDeviceQuery {
    config: QueryConfig,
    backend: Arc<dyn DeviceBackend>,
}

impl SmiDeviceQuery {
    /// Create a query; `backend` supplies the device count
    pub fn new(config: QueryConfig, backend: Arc<dyn DeviceBackend>) -> Self {
        Self { config, backend }
    }

    /// Build the query command
    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Indices reported as having an active compute consumer
    pub async fn busy_devices(&self) -> GpuholdResult<Vec<DeviceIndex>> {
        let output = self.build_command().output().await.map_err(|e| {
            GpuholdError::Query(format!(
                "Failed to run {}: {}",
                self.config.program.display(),
                e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(GpuholdError::Query(format!(
                "{} exited with {}{}",
                self.config.program.display(),
                output.status,
                if stderr.is_empty() {
                    String::new()
                } else {
                    format!(": {}", stderr)
                }
            )));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| GpuholdError::Query(format!("Query output was not UTF-8: {}", e)))?;
        parse_compute_apps(&stdout)
    }

    /// Build this cycle's snapshot, `None` when the query gave no answer
    pub async fn snapshot(&self) -> Option<OccupancySnapshot> {
        let device_count = match self.backend.device_count() {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    error = %e,
                    "Cannot determine device count"
                );
                0
            }
        };

        match self.busy_devices().await {
            Ok(busy) => Some(OccupancySnapshot::from_busy(device_count, &busy)),
            Err(e) => {
                warn!(error = %e, "Device query failed, no devices considered idle this cycle");
                None
            }
        }
    }
}

#[async_trait]
impl DeviceQuery for SmiDeviceQuery {
    async fn list_idle_devices(&self) -> Vec<DeviceIndex> {
        let idle = self
            .snapshot()
            .await
            .map(|snapshot| snapshot.idle_indices())
            .unwrap_or_default();
        debug!(idle = ?idle, "Idle devices");
        idle
    }
}
