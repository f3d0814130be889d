//! Occupier task
//!
//! One occupier holds one device: it reserves the device's memory block,
//! then multiplies forever on its own thread. Errors end the task; they are
//! logged and reported but never retried here.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gpuhold_core::{
    DeviceIndex, GpuholdError, GpuholdResult, OccupierConfig, OccupierEvent, OccupierReport,
    OccupierState, WorkloadSpec,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::traits::DeviceBackend;

/// Shared flag that asks occupiers to leave their compute loop
///
/// Nothing raises it during normal operation; occupiers then run until
/// they fail or the process exits.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// Create a lowered flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this flag to stop
    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether the flag has been raised
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Occupier bound to a single device
pub struct Occupier {
    device: DeviceIndex,
    backend: Arc<dyn DeviceBackend>,
    workload: WorkloadSpec,
    pause: Option<Duration>,
    reports: Option<mpsc::Sender<OccupierReport>>,
    stop: StopFlag,
}

impl Occupier {
    /// Create an occupier for `device`
    pub fn new(device: DeviceIndex, backend: Arc<dyn DeviceBackend>, config: &OccupierConfig) -> Self {
        Self {
            device,
            backend,
            workload: config.workload(),
            pause: config.sleep_between_compute(),
            reports: None,
            stop: StopFlag::new(),
        }
    }

    /// Send lifecycle reports on `tx`
    pub fn with_reports(mut self, tx: mpsc::Sender<OccupierReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Watch `stop` between compute iterations
    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Device this occupier is bound to
    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    /// Run on a new named thread, detached from the caller
    pub fn spawn(self) -> GpuholdResult<JoinHandle<OccupierState>> {
        let name = format!("occupier-{}", self.device);
        thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .map_err(|e| GpuholdError::Internal(format!("Failed to spawn occupier thread: {}", e)))
    }

    /// Run on the current thread until failure or stop
    pub fn run(self) -> OccupierState {
        let device = self.device;
        let outcome = catch_unwind(AssertUnwindSafe(|| self.occupy()))
            .unwrap_or_else(|panic| Err(GpuholdError::Internal(panic_message(panic.as_ref()))));

        let event = match outcome {
            Ok(()) => {
                info!(device = device, "Occupier stopped");
                OccupierEvent::Stopped
            }
            Err(e) => {
                error!(device = device, error = %e, "Occupation failed");
                OccupierEvent::Failed {
                    error: e.to_string(),
                }
            }
        };
        let state = event.state();
        self.report(event);
        state
    }

    /// Returns `Ok` only when the stop flag ends the loop
    fn occupy(&self) -> GpuholdResult<()> {
        debug!(
            device = self.device,
            backend = self.backend.name(),
            state = %OccupierState::Starting,
            "Opening device"
        );

        let mut workload = self.backend.open(self.device, &self.workload)?;
        let reserved_bytes = workload.reserved_bytes();

        info!(
            device = self.device,
            allocate_gb = self.workload.allocate_gb,
            reserved_bytes = reserved_bytes,
            "Occupation started"
        );
        self.report(OccupierEvent::Started { reserved_bytes });

        loop {
            if self.stop.is_raised() {
                return Ok(());
            }
            workload.step()?;
            if let Some(pause) = self.pause {
                thread::sleep(pause);
            }
        }
    }

    /// `Started` is best effort; terminal events wait for channel room
    fn report(&self, event: OccupierEvent) {
        let Some(tx) = &self.reports else {
            return;
        };
        let report = OccupierReport::new(self.device, event);
        if report.event.state().is_terminal() {
            if tx.blocking_send(report).is_err() {
                debug!(device = self.device, "Scanner gone, final report not delivered");
            }
        } else if let Err(e) = tx.try_send(report) {
            warn!(device = self.device, error = %e, "Dropped occupier report");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("occupier panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("occupier panicked: {}", s)
    } else {
        "occupier panicked".to_string()
    }
}
