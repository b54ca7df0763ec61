use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use obsctl_core::{
    CommandKind, ControllerConfig, DominanceOrder, SubordinateConfig, WatchConfig,
};
use serde::{Deserialize, Serialize};

/// On-disk description of one observation and where its subordinates live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub observation_id: String,
    pub subordinates: Vec<SubordinateEntry>,
    pub command_timeout_ms: u64,
    /// Keyed by command name, e.g. `"Scan"`.
    pub timeout_overrides_ms: BTreeMap<String, u64>,
    pub late_reply_grace_ms: u64,
    pub max_scan_duration_ms: u64,
    pub connect_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_interval_min_ms: u64,
    pub probe_interval_max_ms: u64,
    pub probe_timeout_ms: u64,
    pub stale_after_ms: u64,
    pub error_threshold: u32,
    pub health_signal: String,
    pub obs_state_signal: String,
    pub dominance: DominanceOrder,
    pub follow_subordinate_obs_state: bool,
    pub activity_history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubordinateEntry {
    pub id: String,
    pub address: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl Default for FileConfig {
    fn default() -> Self {
        let controller = ControllerConfig::default();
        let watch = WatchConfig::default();
        Self {
            observation_id: controller.observation_id,
            subordinates: Vec::new(),
            command_timeout_ms: millis(controller.command_timeout),
            timeout_overrides_ms: BTreeMap::new(),
            late_reply_grace_ms: millis(controller.late_reply_grace),
            max_scan_duration_ms: millis(controller.max_scan_duration),
            connect_timeout_ms: 2000,
            probe_interval_ms: millis(watch.probe_interval),
            probe_interval_min_ms: millis(watch.probe_interval_min),
            probe_interval_max_ms: millis(watch.probe_interval_max),
            probe_timeout_ms: millis(watch.probe_timeout),
            stale_after_ms: millis(watch.stale_after),
            error_threshold: watch.error_threshold,
            health_signal: watch.health_signal,
            obs_state_signal: watch.obs_state_signal,
            dominance: controller.dominance,
            follow_subordinate_obs_state: controller.follow_subordinate_obs_state,
            activity_history: controller.activity_history,
        }
    }
}

/// Timing values given on the command line win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub command_timeout_ms: Option<u64>,
    pub probe_interval_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub stale_after_ms: Option<u64>,
    pub error_threshold: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = Vec::with_capacity(self.subordinates.len());
        for entry in &self.subordinates {
            if entry.id.trim().is_empty() {
                bail!("subordinate with empty id");
            }
            if entry.address.trim().is_empty() {
                bail!("subordinate {} has no address", entry.id);
            }
            if seen.contains(&entry.id.as_str()) {
                bail!("subordinate {} listed twice", entry.id);
            }
            seen.push(entry.id.as_str());
        }
        for name in self.timeout_overrides_ms.keys() {
            if command_kind(name).is_none() {
                bail!("timeout override for unknown command {name}");
            }
        }
        if self.probe_interval_min_ms > self.probe_interval_max_ms {
            bail!("probe_interval_min_ms exceeds probe_interval_max_ms");
        }
        if self.error_threshold == 0 {
            bail!("error_threshold must be at least 1");
        }
        Ok(())
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(ms) = overrides.command_timeout_ms {
            self.command_timeout_ms = ms;
        }
        if let Some(ms) = overrides.probe_interval_ms {
            self.probe_interval_ms = ms;
            self.probe_interval_min_ms = self.probe_interval_min_ms.min(ms);
            self.probe_interval_max_ms = self.probe_interval_max_ms.max(ms);
        }
        if let Some(ms) = overrides.probe_timeout_ms {
            self.probe_timeout_ms = ms;
        }
        if let Some(ms) = overrides.stale_after_ms {
            self.stale_after_ms = ms;
        }
        if let Some(threshold) = overrides.error_threshold {
            self.error_threshold = threshold;
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let timeout_overrides = self
            .timeout_overrides_ms
            .iter()
            .filter_map(|(name, ms)| Some((command_kind(name)?, Duration::from_millis(*ms))))
            .collect();

        ControllerConfig {
            observation_id: self.observation_id.clone(),
            subordinates: self
                .subordinates
                .iter()
                .map(|entry| SubordinateConfig {
                    id: entry.id.clone(),
                    required: entry.required,
                })
                .collect(),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            timeout_overrides,
            late_reply_grace: Duration::from_millis(self.late_reply_grace_ms),
            max_scan_duration: Duration::from_millis(self.max_scan_duration_ms),
            watch: WatchConfig {
                probe_interval: Duration::from_millis(self.probe_interval_ms),
                probe_interval_min: Duration::from_millis(self.probe_interval_min_ms),
                probe_interval_max: Duration::from_millis(self.probe_interval_max_ms),
                probe_timeout: Duration::from_millis(self.probe_timeout_ms),
                stale_after: Duration::from_millis(self.stale_after_ms),
                error_threshold: self.error_threshold,
                health_signal: self.health_signal.clone(),
                obs_state_signal: self.obs_state_signal.clone(),
            },
            dominance: self.dominance,
            follow_subordinate_obs_state: self.follow_subordinate_obs_state,
            activity_history: self.activity_history,
        }
    }

    pub fn endpoints(&self) -> HashMap<String, String> {
        self.subordinates
            .iter()
            .map(|entry| (entry.id.clone(), entry.address.clone()))
            .collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn command_kind(name: &str) -> Option<CommandKind> {
    CommandKind::ALL
        .into_iter()
        .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
