use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::HealthStatus;
use crate::devices::DeviceSnapshot;
use crate::state::ObsState;
use crate::timer::ScanTimerStatus;
use crate::tracker::PendingSummary;

/// Read-only attributes of one observation, computed at the time of the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub ts: DateTime<Utc>,
    pub observation_id: String,
    pub observation_state: ObsState,
    pub aggregated_status: HealthStatus,
    pub last_activity: Option<String>,
    pub devices: Vec<DeviceSnapshot>,
    pub scan_timer: ScanTimerStatus,
    pub pending: Vec<PendingSummary>,
    pub activity: Vec<ActivityEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityEntry {
    pub ts: DateTime<Utc>,
    pub message: String,
}
