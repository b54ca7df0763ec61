use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::command::CommandKind;

/// Lifecycle stage of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObsState {
    Empty,
    Resourcing,
    Idle,
    Configuring,
    Ready,
    Scanning,
    Aborting,
    Aborted,
    Resetting,
    Restarting,
    Fault,
}

impl ObsState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObsState::Empty => "EMPTY",
            ObsState::Resourcing => "RESOURCING",
            ObsState::Idle => "IDLE",
            ObsState::Configuring => "CONFIGURING",
            ObsState::Ready => "READY",
            ObsState::Scanning => "SCANNING",
            ObsState::Aborting => "ABORTING",
            ObsState::Aborted => "ABORTED",
            ObsState::Resetting => "RESETTING",
            ObsState::Restarting => "RESTARTING",
            ObsState::Fault => "FAULT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let state = match raw.trim().to_ascii_uppercase().as_str() {
            "EMPTY" => ObsState::Empty,
            "RESOURCING" => ObsState::Resourcing,
            "IDLE" => ObsState::Idle,
            "CONFIGURING" => ObsState::Configuring,
            "READY" => ObsState::Ready,
            "SCANNING" => ObsState::Scanning,
            "ABORTING" => ObsState::Aborting,
            "ABORTED" => ObsState::Aborted,
            "RESETTING" => ObsState::Resetting,
            "RESTARTING" => ObsState::Restarting,
            "FAULT" => ObsState::Fault,
            _ => return None,
        };
        Some(state)
    }
}

impl fmt::Display for ObsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub allowed_from: &'static [ObsState],
    pub provisional: ObsState,
    pub on_success: ObsState,
}

pub fn transition(kind: CommandKind) -> Transition {
    use ObsState::*;

    match kind {
        CommandKind::AssignResources => Transition {
            allowed_from: &[Empty, Idle],
            provisional: Resourcing,
            on_success: Idle,
        },
        CommandKind::ReleaseAllResources => Transition {
            allowed_from: &[Idle],
            provisional: Resourcing,
            on_success: Empty,
        },
        CommandKind::Configure => Transition {
            allowed_from: &[Idle, Ready],
            provisional: Configuring,
            on_success: Ready,
        },
        CommandKind::Scan => Transition {
            allowed_from: &[Ready],
            provisional: Scanning,
            on_success: Scanning,
        },
        CommandKind::EndScan => Transition {
            allowed_from: &[Scanning],
            provisional: Scanning,
            on_success: Ready,
        },
        CommandKind::Abort => Transition {
            allowed_from: &[Idle, Ready, Configuring, Resourcing, Scanning, Resetting],
            provisional: Aborting,
            on_success: Aborted,
        },
        CommandKind::ObsReset => Transition {
            allowed_from: &[Aborted, Fault],
            provisional: Resetting,
            on_success: Idle,
        },
        CommandKind::Restart => Transition {
            allowed_from: &[Aborted, Fault],
            provisional: Restarting,
            on_success: Empty,
        },
    }
}

/// Why an operation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum FailureCause {
    Remote(String),
    Timeout,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Remote(reason) => write!(f, "remote command failed: {reason}"),
            FailureCause::Timeout => f.write_str("timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accepted { provisional: ObsState },
    Rejected { state: ObsState, reason: String },
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accepted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlight {
    command: CommandKind,
    from: ObsState,
}

/// Owns the canonical observation state.
#[derive(Debug)]
pub struct ObservationStateMachine {
    current: ObsState,
    in_flight: Option<InFlight>,
}

impl Default for ObservationStateMachine {
    fn default() -> Self {
        Self::new(ObsState::Empty)
    }
}

impl ObservationStateMachine {
    pub fn new(initial: ObsState) -> Self {
        Self {
            current: initial,
            in_flight: None,
        }
    }

    pub fn current(&self) -> ObsState {
        self.current
    }

    /// The command whose provisional transition has not been settled yet.
    pub fn in_flight(&self) -> Option<CommandKind> {
        self.in_flight.map(|f| f.command)
    }

    /// Table lookup without side effects.
    pub fn evaluate(&self, kind: CommandKind) -> Decision {
        let row = transition(kind);
        if row.allowed_from.contains(&self.current) {
            Decision::Accepted {
                provisional: row.provisional,
            }
        } else {
            Decision::Rejected {
                state: self.current,
                reason: format!("{kind} is not allowed in {}", self.current),
            }
        }
    }

    /// Evaluates and, on acceptance, applies the provisional transition.
    pub fn request(&mut self, kind: CommandKind) -> Decision {
        let decision = self.evaluate(kind);
        if let Decision::Accepted { provisional } = decision {
            info!(command = %kind, from = %self.current, to = %provisional, "provisional transition");
            self.in_flight = Some(InFlight {
                command: kind,
                from: self.current,
            });
            self.current = provisional;
        }
        decision
    }

    /// Applies the definitive post-command state.
    pub fn complete(&mut self, kind: CommandKind) -> ObsState {
        let target = transition(kind).on_success;
        info!(command = %kind, from = %self.current, to = %target, "command completed");
        self.current = target;
        self.clear_in_flight(kind);
        self.current
    }

    /// Applies the recovery transition for a failed command that started in `from`.
    pub fn fail(&mut self, kind: CommandKind, from: ObsState, cause: &FailureCause) -> ObsState {
        let target = match cause {
            FailureCause::Timeout => ObsState::Fault,
            FailureCause::Remote(_) => match kind {
                CommandKind::AssignResources
                | CommandKind::ReleaseAllResources
                | CommandKind::Configure
                | CommandKind::Scan => from,
                CommandKind::EndScan
                | CommandKind::Abort
                | CommandKind::ObsReset
                | CommandKind::Restart => ObsState::Fault,
            },
        };
        warn!(command = %kind, from = %self.current, to = %target, cause = %cause, "command failed");
        self.current = target;
        self.clear_in_flight(kind);
        self.current
    }

    /// Forgets the in-flight command without touching the state. Used when an
    /// Abort supersedes it.
    pub fn supersede(&mut self) {
        self.in_flight = None;
    }

    /// Folds the aggregate reported by composed coordinators into this node.
    pub fn on_subordinate_obs_state(&mut self, aggregate: ObsState) -> Option<ObsState> {
        if aggregate == self.current {
            return None;
        }
        if aggregate != ObsState::Fault && self.in_flight.is_some() {
            return None;
        }
        info!(from = %self.current, to = %aggregate, "following subordinate observation state");
        self.current = aggregate;
        if aggregate == ObsState::Fault {
            self.in_flight = None;
        }
        Some(self.current)
    }

    fn clear_in_flight(&mut self, kind: CommandKind) {
        if self.in_flight.map(|f| f.command) == Some(kind) {
            self.in_flight = None;
        }
    }
}
