use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::ObsState;

/// Health reported by a subordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Failed,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "OK",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Failed => "FAILED",
            HealthStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OK" => Some(HealthStatus::Ok),
            "DEGRADED" => Some(HealthStatus::Degraded),
            "FAILED" => Some(HealthStatus::Failed),
            "UNKNOWN" => Some(HealthStatus::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relative severity of DEGRADED and UNKNOWN. FAILED always dominates and OK
/// never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DominanceOrder {
    #[default]
    DegradedOverUnknown,
    UnknownOverDegraded,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusAggregator {
    order: DominanceOrder,
}

impl StatusAggregator {
    pub fn new(order: DominanceOrder) -> Self {
        Self { order }
    }

    pub fn order(&self) -> DominanceOrder {
        self.order
    }

    fn severity(&self, status: HealthStatus) -> u8 {
        match (status, self.order) {
            (HealthStatus::Ok, _) => 0,
            (HealthStatus::Unknown, DominanceOrder::DegradedOverUnknown) => 1,
            (HealthStatus::Degraded, DominanceOrder::DegradedOverUnknown) => 2,
            (HealthStatus::Degraded, DominanceOrder::UnknownOverDegraded) => 1,
            (HealthStatus::Unknown, DominanceOrder::UnknownOverDegraded) => 2,
            (HealthStatus::Failed, _) => 3,
        }
    }

    /// Most severe status in the set, UNKNOWN when the set is empty.
    pub fn aggregate<I>(&self, statuses: I) -> HealthStatus
    where
        I: IntoIterator<Item = HealthStatus>,
    {
        statuses
            .into_iter()
            .max_by_key(|s| self.severity(*s))
            .unwrap_or(HealthStatus::Unknown)
    }
}

const OBS_STATE_DOMINANCE: [ObsState; 7] = [
    ObsState::Fault,
    ObsState::Aborting,
    ObsState::Aborted,
    ObsState::Resetting,
    ObsState::Restarting,
    ObsState::Resourcing,
    ObsState::Configuring,
];

/// Combines observation states reported by composed coordinators.
///
/// Returns `None` for an empty set or a mix of stable states that no single
/// state describes.
pub fn aggregate_obs_states<I>(states: I) -> Option<ObsState>
where
    I: IntoIterator<Item = ObsState>,
{
    let states: Vec<ObsState> = states.into_iter().collect();
    let first = *states.first()?;

    if let Some(dominant) = OBS_STATE_DOMINANCE
        .iter()
        .find(|candidate| states.contains(candidate))
    {
        return Some(*dominant);
    }

    if states.iter().all(|s| *s == first) {
        Some(first)
    } else {
        None
    }
}
