//! Command admission: every check that can reject a command before anything
//! is dispatched.

use std::time::Duration;

use thiserror::Error;

use crate::command::{Command, CommandKind};
use crate::devices::DeviceSnapshot;
use crate::state::{Decision, ObsState, ObservationStateMachine};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("{command} not allowed in {state}")]
    CommandNotAllowed { command: CommandKind, state: ObsState },
    #[error("{command} rejected: subordinate {device} is unresponsive (state {state})")]
    DeviceUnresponsive {
        command: CommandKind,
        device: String,
        state: ObsState,
    },
    #[error("{command} rejected in {state}: {reason}")]
    InvalidObservationState {
        command: CommandKind,
        state: ObsState,
        reason: String,
    },
    #[error("{command} rejected: {reason}")]
    InvalidPayload { command: CommandKind, reason: String },
}

impl AdmissionError {
    pub fn command(&self) -> CommandKind {
        match self {
            AdmissionError::CommandNotAllowed { command, .. }
            | AdmissionError::DeviceUnresponsive { command, .. }
            | AdmissionError::InvalidObservationState { command, .. }
            | AdmissionError::InvalidPayload { command, .. } => *command,
        }
    }
}

/// Everything the guard needs to know besides the state machine.
pub struct AdmissionContext<'a> {
    pub devices: &'a [DeviceSnapshot],
    /// Command of the operation still awaiting completions, if any.
    pub busy_with: Option<CommandKind>,
    /// Subordinates that still hold an unresolved command of the same kind.
    pub conflicting_targets: &'a [String],
    pub max_scan_duration: Duration,
}

/// Result of a successful check, before commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub command: CommandKind,
    pub from: ObsState,
    pub provisional: ObsState,
    /// An operation in flight that this command replaces.
    pub supersedes: Option<CommandKind>,
}

pub struct CommandAdmissionGuard;

impl CommandAdmissionGuard {
    /// Runs every check without touching the state machine.
    pub fn check(
        machine: &ObservationStateMachine,
        command: &Command,
        ctx: &AdmissionContext<'_>,
    ) -> Result<Admission, AdmissionError> {
        let kind = command.kind();
        let state = machine.current();

        command
            .validate(ctx.max_scan_duration)
            .map_err(|problem| AdmissionError::InvalidPayload {
                command: kind,
                reason: problem.0,
            })?;

        let provisional = match machine.evaluate(kind) {
            Decision::Accepted { provisional } => provisional,
            Decision::Rejected { state, .. } => {
                return Err(AdmissionError::CommandNotAllowed {
                    command: kind,
                    state,
                })
            }
        };

        let mut supersedes = None;
        if let Some(busy) = ctx.busy_with {
            if kind == CommandKind::Abort {
                supersedes = Some(busy);
            } else {
                return Err(AdmissionError::InvalidObservationState {
                    command: kind,
                    state,
                    reason: format!("{busy} is still in progress"),
                });
            }
        }

        if let Some(target) = ctx.conflicting_targets.first() {
            return Err(AdmissionError::InvalidObservationState {
                command: kind,
                state,
                reason: format!("a previous {kind} on {target} has not resolved"),
            });
        }

        if kind.requires_responsive() {
            if let Some(stale) = ctx
                .devices
                .iter()
                .find(|device| device.required && !device.responsive)
            {
                return Err(AdmissionError::DeviceUnresponsive {
                    command: kind,
                    device: stale.id.clone(),
                    state,
                });
            }
        }

        Ok(Admission {
            command: kind,
            from: state,
            provisional,
            supersedes,
        })
    }

    /// Checks, then commits the provisional transition.
    pub fn admit(
        machine: &mut ObservationStateMachine,
        command: &Command,
        ctx: &AdmissionContext<'_>,
    ) -> Result<Admission, AdmissionError> {
        let admission = Self::check(machine, command, ctx)?;
        if admission.supersedes.is_some() {
            machine.supersede();
        }
        match machine.request(admission.command) {
            Decision::Accepted { .. } => Ok(admission),
            Decision::Rejected { state, .. } => Err(AdmissionError::CommandNotAllowed {
                command: admission.command,
                state,
            }),
        }
    }
}
