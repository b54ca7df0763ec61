use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::aggregate::HealthStatus;
use crate::config::SubordinateConfig;
use crate::state::ObsState;

/// Last known view of one subordinate.
#[derive(Debug, Clone)]
pub struct SubordinateDevice {
    pub id: String,
    pub required: bool,
    pub status: HealthStatus,
    pub obs_state: Option<ObsState>,
    pub last_contact: Option<Instant>,
    pub last_update_ts: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl SubordinateDevice {
    fn new(config: &SubordinateConfig) -> Self {
        Self {
            id: config.id.clone(),
            required: config.required,
            status: HealthStatus::Unknown,
            obs_state: None,
            last_contact: None,
            last_update_ts: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    pub fn is_responsive(&self, now: Instant, liveness: &Liveness) -> bool {
        let Some(contact) = self.last_contact else {
            return false;
        };
        now.saturating_duration_since(contact) <= liveness.stale_after
            && self.consecutive_failures < liveness.error_threshold
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    pub stale_after: Duration,
    pub error_threshold: u32,
}

/// Read-only copy of a subordinate record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub required: bool,
    pub status: HealthStatus,
    pub obs_state: Option<ObsState>,
    pub responsive: bool,
    pub last_update_ts: Option<DateTime<Utc>>,
    pub age_ms: Option<u128>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// The only handle allowed to mutate a subordinate record.
///
/// Not `Clone`: each record has exactly one writer.
#[derive(Debug)]
pub struct DeviceWriter {
    record: Arc<RwLock<SubordinateDevice>>,
}

impl DeviceWriter {
    pub fn id(&self) -> String {
        self.record.read().id.clone()
    }

    pub fn record_status(&self, status: HealthStatus) {
        let mut record = self.record.write();
        record.status = status;
        Self::touch(&mut record);
    }

    pub fn record_obs_state(&self, state: ObsState) {
        let mut record = self.record.write();
        record.obs_state = Some(state);
        Self::touch(&mut record);
    }

    pub fn record_contact(&self) {
        Self::touch(&mut self.record.write());
    }

    pub fn record_failure(&self, error: String) -> u32 {
        let mut record = self.record.write();
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.last_error = Some(error);
        record.consecutive_failures
    }

    fn touch(record: &mut SubordinateDevice) {
        record.last_contact = Some(Instant::now());
        record.last_update_ts = Some(Utc::now());
        record.consecutive_failures = 0;
        record.last_error = None;
    }
}

/// Subordinate records, in configuration order.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    records: Arc<Vec<Arc<RwLock<SubordinateDevice>>>>,
    liveness: Liveness,
}

impl DeviceRegistry {
    /// Creates the records and hands out one writer per record.
    pub fn new(subordinates: &[SubordinateConfig], liveness: Liveness) -> (Self, Vec<DeviceWriter>) {
        let records: Vec<_> = subordinates
            .iter()
            .map(|cfg| Arc::new(RwLock::new(SubordinateDevice::new(cfg))))
            .collect();
        let writers = records
            .iter()
            .map(|record| DeviceWriter {
                record: Arc::clone(record),
            })
            .collect();

        (
            Self {
                records: Arc::new(records),
                liveness,
            },
            writers,
        )
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.read().id.clone()).collect()
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    /// Point-in-time copy of every record.
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let now = Instant::now();
        self.records
            .iter()
            .map(|record| {
                let record = record.read();
                DeviceSnapshot {
                    id: record.id.clone(),
                    required: record.required,
                    status: record.status,
                    obs_state: record.obs_state,
                    responsive: record.is_responsive(now, &self.liveness),
                    last_update_ts: record.last_update_ts,
                    age_ms: record
                        .last_contact
                        .map(|t| now.saturating_duration_since(t).as_millis()),
                    consecutive_failures: record.consecutive_failures,
                    last_error: record.last_error.clone(),
                }
            })
            .collect()
    }
}
