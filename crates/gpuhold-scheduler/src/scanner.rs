//! Scan loop
//!
//! Every cycle: drain occupier reports, ask the query for idle devices,
//! claim each one in the registry and launch an occupier for every new
//! claim. Occupiers are never awaited.

use gpuhold_core::{
    DeviceIndex, GpuholdConfig, OccupierConfig, OccupierEvent, OccupierReport, OccupierState,
    ScanConfig,
};
use gpuhold_runtime::{DeviceBackend, DeviceQuery, Occupier, StopFlag};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::registry::OccupancyRegistry;

type StatesMap = HashMap<DeviceIndex, OccupierState>;

/// Scanner owns the decision to launch occupiers
pub struct Scanner {
    /// Idle-device source
    query: Arc<dyn DeviceQuery>,
    /// Backend handed to every occupier
    backend: Arc<dyn DeviceBackend>,
    /// Devices already under management
    registry: Arc<OccupancyRegistry>,
    /// Scan loop settings
    scan: ScanConfig,
    /// Settings passed to each occupier
    occupier: OccupierConfig,
    /// Cloned into every occupier
    reports_tx: mpsc::Sender<OccupierReport>,
    /// Drained at the start of each cycle
    reports_rx: Mutex<mpsc::Receiver<OccupierReport>>,
    /// Last known state per launched device
    states: RwLock<StatesMap>,
    /// Shared with every occupier, never raised by `run`
    stop: StopFlag,
}

impl Scanner {
    /// Create a new scanner
    pub fn new(
        query: Arc<dyn DeviceQuery>,
        backend: Arc<dyn DeviceBackend>,
        registry: Arc<OccupancyRegistry>,
        config: &GpuholdConfig,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::channel(config.scan.report_capacity.max(1));

        info!(
            backend = backend.name(),
            check_interval_secs = config.scan.check_interval_secs,
            allocate_gb = config.occupier.allocate_gb,
            mat_dim = config.occupier.mat_dim,
            release_on_failure = config.scan.release_on_failure,
            "Scanner initialized"
        );

        Self {
            query,
            backend,
            registry,
            scan: config.scan.clone(),
            occupier: config.occupier.clone(),
            reports_tx,
            reports_rx: Mutex::new(reports_rx),
            states: RwLock::new(HashMap::new()),
            stop: StopFlag::new(),
        }
    }

    /// Registry this scanner claims devices in
    pub fn registry(&self) -> &Arc<OccupancyRegistry> {
        &self.registry
    }

    /// Run one scan cycle, returning the devices it launched occupiers on
    pub async fn scan_once(&self) -> Vec<DeviceIndex> {
        self.drain_reports().await;

        let idle = self.query.list_idle_devices().await;
        let mut launched = Vec::new();

        for device in idle {
            debug!(device = device, "Idle device discovered");
            if !self.registry.try_claim(device).await {
                debug!(device = device, "Device already managed, skipping");
                continue;
            }

            info!(device = device, "Found idle device, launching occupier");

            let occupier = Occupier::new(device, self.backend.clone(), &self.occupier)
                .with_reports(self.reports_tx.clone())
                .with_stop_flag(self.stop.clone());

            match occupier.spawn() {
                Ok(_detached) => {
                    self.states
                        .write()
                        .await
                        .insert(device, OccupierState::Starting);
                    launched.push(device);
                }
                Err(e) => {
                    error!(device = device, error = %e, "Failed to launch occupier");
                    self.states.write().await.insert(device, OccupierState::Failed);
                    self.settle_failure(device).await;
                }
            }
        }

        launched
    }

    /// Apply every pending occupier report, returning how many were read
    pub async fn drain_reports(&self) -> usize {
        let mut rx = self.reports_rx.lock().await;
        let mut count = 0;

        while let Ok(report) = rx.try_recv() {
            count += 1;
            self.states
                .write()
                .await
                .insert(report.device, report.event.state());

            match report.event {
                OccupierEvent::Started { reserved_bytes } => {
                    debug!(
                        device = report.device,
                        reserved_bytes = reserved_bytes,
                        at = %report.at,
                        "Occupier running"
                    );
                }
                OccupierEvent::Failed { error } => {
                    debug!(
                        device = report.device,
                        error = %error,
                        at = %report.at,
                        "Occupier failed"
                    );
                    self.settle_failure(report.device).await;
                }
                OccupierEvent::Stopped => {
                    debug!(device = report.device, at = %report.at, "Occupier stopped");
                }
            }
        }

        count
    }

    async fn settle_failure(&self, device: DeviceIndex) {
        if self.scan.release_on_failure {
            self.registry.release(device).await;
            info!(device = device, "Released failed device for a later cycle");
        } else {
            warn!(device = device, "Failed device stays claimed and will not be retried");
        }
    }

    /// Last known state of the occupier on `device`
    pub async fn device_state(&self, device: DeviceIndex) -> Option<OccupierState> {
        self.states.read().await.get(&device).copied()
    }

    /// Devices whose occupier is known to be in `state`, ascending
    pub async fn devices_in_state(&self, state: OccupierState) -> Vec<DeviceIndex> {
        let mut devices: Vec<DeviceIndex> = self
            .states
            .read()
            .await
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(d, _)| *d)
            .collect();
        devices.sort_unstable();
        devices
    }

    /// Scan forever
    pub async fn run(&self) {
        loop {
            self.scan_once().await;
            tokio::time::sleep(self.scan.check_interval()).await;
        }
    }

    /// Scan until `shutdown` resolves, then ask every occupier to stop
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            self.scan_once().await;
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.scan.check_interval()) => {}
            }
        }
        info!("Scan loop stopped");
        self.stop();
    }

    /// Ask every occupier launched by this scanner to leave its loop
    pub fn stop(&self) {
        self.stop.raise();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuhold_runtime::HostBackend;

    struct FixedQuery(Vec<DeviceIndex>);

    #[async_trait::async_trait]
    impl DeviceQuery for FixedQuery {
        async fn list_idle_devices(&self) -> Vec<DeviceIndex> {
            self.0.clone()
        }
    }

    fn test_config() -> GpuholdConfig {
        let mut config = GpuholdConfig::default();
        config.scan.check_interval_secs = 1;
        config.occupier.allocate_gb = 0;
        config.occupier.mat_dim = 2;
        config.occupier.sleep_between_compute_secs = 0.01;
        config
    }

    fn scanner(idle: Vec<DeviceIndex>) -> Scanner {
        Scanner::new(
            Arc::new(FixedQuery(idle)),
            Arc::new(HostBackend::new(4)),
            Arc::new(OccupancyRegistry::new()),
            &test_config(),
        )
    }

    #[tokio::test]
    async fn test_scan_launches_idle_devices() {
        let scanner = scanner(vec![0, 1, 3]);

        let launched = scanner.scan_once().await;
        assert_eq!(launched, vec![0, 1, 3]);
        assert_eq!(scanner.registry().claimed().await, vec![0, 1, 3]);
        assert_eq!(scanner.device_state(1).await, Some(OccupierState::Starting));

        scanner.stop();
    }

    #[tokio::test]
    async fn test_no_idle_devices() {
        let scanner = scanner(Vec::new());
        assert!(scanner.scan_once().await.is_empty());
        assert!(scanner.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_run_until_stops_occupiers() {
        let scanner = scanner(vec![2]);

        scanner
            .run_until(tokio::time::sleep(std::time::Duration::from_millis(50)))
            .await;

        // Occupier on device 2 sees the stop flag and reports Stopped
        let mut state = None;
        for _ in 0..200 {
            scanner.drain_reports().await;
            state = scanner.device_state(2).await;
            if state == Some(OccupierState::Stopped) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(state, Some(OccupierState::Stopped));
        assert!(scanner.registry().contains(2).await);
    }
}
