//! gpuhold daemon
//!
//! Watches the local accelerators and keeps every idle one occupied.
//! Runs until the process is killed.

use anyhow::{bail, Context};
use clap::Parser;
use gpuhold_core::{BackendKind, GpuholdConfig};
use gpuhold_runtime::{DeviceBackend, HostBackend, SmiDeviceQuery};
use gpuhold_scheduler::{OccupancyRegistry, Scanner};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// gpuholdd - keep idle GPUs busy with a memory and compute load
#[derive(Parser, Debug)]
#[command(name = "gpuholdd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds between scan cycles
    #[arg(long)]
    check_interval: Option<u64>,

    /// GiB of memory to reserve on each device
    #[arg(long)]
    allocate_gb: Option<u64>,

    /// Square matrix dimension for the compute loop
    #[arg(long)]
    mat_dim: Option<usize>,

    /// Seconds to sleep between compute iterations (0 = full load)
    #[arg(long)]
    sleep_between_compute: Option<f64>,

    /// Compute backend (cuda or host)
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Load the config file (or defaults) and apply command-line overrides
    fn into_config(self) -> anyhow::Result<GpuholdConfig> {
        let mut config = match &self.config {
            Some(path) => GpuholdConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => GpuholdConfig::default(),
        };

        if let Some(secs) = self.check_interval {
            config.scan.check_interval_secs = secs;
        }
        if let Some(gb) = self.allocate_gb {
            config.occupier.allocate_gb = gb;
        }
        if let Some(dim) = self.mat_dim {
            config.occupier.mat_dim = dim;
        }
        if let Some(secs) = self.sleep_between_compute {
            config.occupier.sleep_between_compute_secs = secs;
        }
        if let Some(kind) = self.backend {
            config.backend.kind = kind;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(level: &str, format: &str) {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false);

    let installed = if format.eq_ignore_ascii_case("json") {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    if let Err(e) = installed {
        eprintln!("Failed to set subscriber: {}", e);
    }
}

fn build_backend(config: &GpuholdConfig) -> anyhow::Result<Arc<dyn DeviceBackend>> {
    match config.backend.kind {
        BackendKind::Host => Ok(Arc::new(HostBackend::new(config.backend.host_devices))),
        #[cfg(feature = "cuda")]
        BackendKind::Cuda => Ok(Arc::new(gpuhold_runtime::CudaBackend::new())),
        #[cfg(not(feature = "cuda"))]
        BackendKind::Cuda => {
            bail!("gpuholdd was built without the `cuda` feature; rebuild with it or use --backend host")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    init_logging(&config.logging.level, &config.logging.format);

    info!("Starting gpuhold daemon v{}", env!("CARGO_PKG_VERSION"));

    let backend = build_backend(&config)?;
    match backend.device_count() {
        Ok(count) => info!(backend = backend.name(), devices = count, "Backend ready"),
        Err(e) => bail!("backend {} is unusable: {}", backend.name(), e),
    }

    let query = Arc::new(SmiDeviceQuery::new(config.query.clone(), backend.clone()));
    let registry = Arc::new(OccupancyRegistry::new());
    let scanner = Scanner::new(query, backend, registry, &config);

    info!(
        "Scanning for idle devices every {}s",
        config.scan.check_interval_secs
    );
    scanner.run().await;

    Ok(())
}
