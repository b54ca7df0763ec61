use std::collections::BTreeMap;
use std::time::Duration;

use crate::aggregate::DominanceOrder;
use crate::command::CommandKind;

#[derive(Debug, Clone)]
pub struct SubordinateConfig {
    pub id: String,
    /// Only required subordinates gate command admission.
    pub required: bool,
}

impl SubordinateConfig {
    pub fn required(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            required: true,
        }
    }

    pub fn optional(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            required: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub observation_id: String,
    pub subordinates: Vec<SubordinateConfig>,
    pub command_timeout: Duration,
    pub timeout_overrides: BTreeMap<CommandKind, Duration>,
    pub late_reply_grace: Duration,
    pub max_scan_duration: Duration,
    pub watch: WatchConfig,
    pub dominance: DominanceOrder,
    pub follow_subordinate_obs_state: bool,
    pub activity_history: usize,
}

impl ControllerConfig {
    pub fn timeout_for(&self, kind: CommandKind) -> Duration {
        self.timeout_overrides
            .get(&kind)
            .copied()
            .unwrap_or(self.command_timeout)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            observation_id: "observation".to_string(),
            subordinates: Vec::new(),
            command_timeout: Duration::from_secs(10),
            timeout_overrides: BTreeMap::new(),
            late_reply_grace: Duration::from_secs(30),
            max_scan_duration: Duration::from_secs(6 * 3600),
            watch: WatchConfig::default(),
            dominance: DominanceOrder::default(),
            follow_subordinate_obs_state: true,
            activity_history: 64,
        }
    }
}

/// Liveness policy applied to every subordinate.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub probe_interval: Duration,
    pub probe_interval_min: Duration,
    pub probe_interval_max: Duration,
    pub probe_timeout: Duration,
    pub stale_after: Duration,
    pub error_threshold: u32,
    pub health_signal: String,
    pub obs_state_signal: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_interval_min: Duration::from_secs(1),
            probe_interval_max: Duration::from_secs(3),
            probe_timeout: Duration::from_millis(700),
            stale_after: Duration::from_millis(5000),
            error_threshold: 3,
            health_signal: "healthState".to_string(),
            obs_state_signal: "obsState".to_string(),
        }
    }
}
