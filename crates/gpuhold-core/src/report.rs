//! Occupier lifecycle states and the reports occupiers send back

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DeviceIndex;

/// Occupier task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OccupierState {
    /// Allocating memory and initialising the matrices
    Starting,
    /// Running the compute loop
    Running,
    /// Ended on an unrecoverable error
    Failed,
    /// Ended because the stop flag was raised
    Stopped,
}

impl OccupierState {
    /// Whether the task has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, OccupierState::Failed | OccupierState::Stopped)
    }
}

impl std::fmt::Display for OccupierState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OccupierState::Starting => write!(f, "Starting"),
            OccupierState::Running => write!(f, "Running"),
            OccupierState::Failed => write!(f, "Failed"),
            OccupierState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What happened to an occupier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OccupierEvent {
    /// Memory reserved and compute loop entered
    Started { reserved_bytes: u64 },
    /// Allocation, initialisation or a compute step failed
    Failed { error: String },
    /// Compute loop left because the stop flag was raised
    Stopped,
}

impl OccupierEvent {
    /// State the occupier is in after this event
    pub fn state(&self) -> OccupierState {
        match self {
            OccupierEvent::Started { .. } => OccupierState::Running,
            OccupierEvent::Failed { .. } => OccupierState::Failed,
            OccupierEvent::Stopped => OccupierState::Stopped,
        }
    }
}

/// Message from an occupier to the scan loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupierReport {
    /// Device the occupier is bound to
    pub device: DeviceIndex,
    /// Reported event
    pub event: OccupierEvent,
    /// When the event happened
    pub at: DateTime<Utc>,
}

impl OccupierReport {
    /// Create a report stamped with the current time
    pub fn new(device: DeviceIndex, event: OccupierEvent) -> Self {
        Self {
            device,
            event,
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_state() {
        let started = OccupierEvent::Started { reserved_bytes: 1024 };
        assert_eq!(started.state(), OccupierState::Running);
        assert!(!started.state().is_terminal());

        let failed = OccupierEvent::Failed {
            error: "out of memory".to_string(),
        };
        assert_eq!(failed.state(), OccupierState::Failed);
        assert!(failed.state().is_terminal());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(OccupierState::Starting.to_string(), "Starting");
        assert_eq!(OccupierState::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_report_new() {
        let report = OccupierReport::new(3, OccupierEvent::Stopped);
        assert_eq!(report.device, 3);
        assert!(report.at <= Utc::now());
    }
}
