pub mod aggregate;
pub mod command;
pub mod config;
pub mod controller;
pub mod devices;
pub mod guard;
pub mod json_line;
pub mod state;
pub mod status;
pub mod timer;
pub mod tracker;
pub mod transport;
pub mod watcher;

#[cfg(test)]
mod json_line_tests;
#[cfg(test)]
mod state_tests;
#[cfg(test)]
mod timer_tests;
#[cfg(test)]
mod watcher_tests;

pub use aggregate::{aggregate_obs_states, DominanceOrder, HealthStatus, StatusAggregator};
pub use command::{Command, CommandKind, Origin};
pub use config::{ControllerConfig, SubordinateConfig, WatchConfig};
pub use controller::{CommandAck, ObservationController};
pub use devices::{DeviceRegistry, DeviceSnapshot, Liveness};
pub use guard::{Admission, AdmissionContext, AdmissionError, CommandAdmissionGuard};
pub use json_line::JsonLineTransport;
pub use state::{Decision, FailureCause, ObsState, ObservationStateMachine};
pub use status::{ActivityEntry, ControllerStatus};
pub use timer::{ScanTimer, ScanTimerStatus};
pub use tracker::{CommandHandle, CommandOutcome, Completion, CompletionTracker, PendingSummary, TrackerError};
pub use transport::{SignalUpdate, TransportAdapter, TransportError};
