//! Configuration types for gpuhold

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{GpuholdError, GpuholdResult, WorkloadSpec};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuholdConfig {
    /// Scan loop configuration
    pub scan: ScanConfig,
    /// Per-device occupier configuration
    pub occupier: OccupierConfig,
    /// Device enumeration query
    pub query: QueryConfig,
    /// Compute backend selection
    pub backend: BackendConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl GpuholdConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> GpuholdResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GpuholdError::Config(format!("Failed to read config file: {}", e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| GpuholdError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the daemon misbehave
    pub fn validate(&self) -> GpuholdResult<()> {
        if self.scan.check_interval_secs == 0 {
            return Err(GpuholdError::Config(
                "scan.check_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.occupier.mat_dim == 0 {
            return Err(GpuholdError::Config(
                "occupier.mat_dim must be greater than zero".to_string(),
            ));
        }
        let sleep = self.occupier.sleep_between_compute_secs;
        if !sleep.is_finite() || sleep < 0.0 || Duration::try_from_secs_f64(sleep).is_err() {
            return Err(GpuholdError::Config(format!(
                "occupier.sleep_between_compute_secs must be a non-negative duration, got {}",
                sleep
            )));
        }
        if self.query.program.as_os_str().is_empty() {
            return Err(GpuholdError::Config(
                "query.program must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scan loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Seconds between scan cycles
    pub check_interval_secs: u64,
    /// Release a device's claim when its occupier fails, so a later
    /// cycle may try it again
    pub release_on_failure: bool,
    /// Capacity of the occupier report channel
    pub report_capacity: usize,
}

impl ScanConfig {
    /// Interval between scan cycles
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            release_on_failure: false,
            report_capacity: 64,
        }
    }
}

/// Per-device occupier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OccupierConfig {
    /// GiB of memory reserved on each device
    pub allocate_gb: u64,
    /// Square matrix dimension driving compute intensity
    pub mat_dim: usize,
    /// Seconds to sleep between compute iterations (0 = no yield)
    pub sleep_between_compute_secs: f64,
}

impl OccupierConfig {
    /// Size of the load placed on each device
    pub fn workload(&self) -> WorkloadSpec {
        WorkloadSpec {
            allocate_gb: self.allocate_gb,
            mat_dim: self.mat_dim,
        }
    }

    /// Pause between compute iterations, `None` when running at full throttle
    /// or when the value does not fit a `Duration`
    pub fn sleep_between_compute(&self) -> Option<Duration> {
        if self.sleep_between_compute_secs > 0.0 {
            Duration::try_from_secs_f64(self.sleep_between_compute_secs).ok()
        } else {
            None
        }
    }
}

impl Default for OccupierConfig {
    fn default() -> Self {
        Self {
            allocate_gb: 30,
            mat_dim: 8192,
            sleep_between_compute_secs: 0.0,
        }
    }
}

/// External enumeration command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Program to run
    pub program: PathBuf,
    /// Arguments; output must be `deviceIndex, consumerId` lines
    pub args: Vec<String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("nvidia-smi"),
            args: vec![
                "--query-compute-apps=gpu_index,pid".to_string(),
                "--format=csv,noheader".to_string(),
            ],
        }
    }
}

/// Compute backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend kind
    pub kind: BackendKind,
    /// Number of devices the host backend exposes
    pub host_devices: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Cuda,
            host_devices: 1,
        }
    }
}

/// Backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// NVIDIA devices through the CUDA driver
    Cuda,
    /// CPU stand-in for dry runs
    Host,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Cuda => write!(f, "cuda"),
            BackendKind::Host => write!(f, "host"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = GpuholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cuda" => Ok(BackendKind::Cuda),
            "host" => Ok(BackendKind::Host),
            other => Err(GpuholdError::Config(format!("Unknown backend: {}", other))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GpuholdConfig::default();
        assert_eq!(config.scan.check_interval_secs, 60);
        assert_eq!(config.occupier.allocate_gb, 30);
        assert_eq!(config.occupier.mat_dim, 8192);
        assert!(config.occupier.sleep_between_compute().is_none());
        assert!(!config.scan.release_on_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_parse() {
        let toml_str = r#"
[scan]
check_interval_secs = 5

[occupier]
allocate_gb = 2
sleep_between_compute_secs = 0.5

[backend]
kind = "host"
host_devices = 4
"#;
        let config: GpuholdConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scan.check_interval(), Duration::from_secs(5));
        assert_eq!(config.occupier.allocate_gb, 2);
        assert_eq!(config.occupier.mat_dim, 8192);
        assert_eq!(
            config.occupier.sleep_between_compute(),
            Some(Duration::from_millis(500))
        );
        assert_eq!(config.backend.kind, BackendKind::Host);
        assert_eq!(config.backend.host_devices, 4);
        assert_eq!(config.query.program, PathBuf::from("nvidia-smi"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GpuholdConfig::default();
        config.scan.check_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = GpuholdConfig::default();
        config.occupier.mat_dim = 0;
        assert!(config.validate().is_err());

        let mut config = GpuholdConfig::default();
        config.occupier.sleep_between_compute_secs = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_query_program() {
        let mut config = GpuholdConfig::default();
        config.query.program = PathBuf::new();
        assert!(matches!(config.validate(), Err(GpuholdError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_sleep() {
        let mut config = GpuholdConfig::default();
        config.occupier.sleep_between_compute_secs = 1e30;
        assert!(matches!(config.validate(), Err(GpuholdError::Config(_))));
        assert!(config.occupier.sleep_between_compute().is_none());
    }

    #[test]
    fn test_zero_allocation_is_valid() {
        let mut config = GpuholdConfig::default();
        config.occupier.allocate_gb = 0;
        assert!(config.validate().is_ok());
        assert_eq!(config.occupier.workload().element_count(), 0);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[occupier]\nmat_dim = 1024\n\n[logging]\nlevel = \"debug\"").unwrap();

        let config = GpuholdConfig::from_file(file.path()).unwrap();
        assert_eq!(config.occupier.mat_dim, 1024);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_from_file_missing() {
        let result = GpuholdConfig::from_file(std::path::Path::new("/nonexistent/gpuhold.toml"));
        assert!(matches!(result, Err(GpuholdError::Config(_))));
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("CUDA".parse::<BackendKind>().unwrap(), BackendKind::Cuda);
        assert_eq!("host".parse::<BackendKind>().unwrap(), BackendKind::Host);
        assert!("metal".parse::<BackendKind>().is_err());
    }
}
