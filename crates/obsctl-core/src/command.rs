use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Name of a command without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommandKind {
    AssignResources,
    ReleaseAllResources,
    Configure,
    Scan,
    EndScan,
    Abort,
    ObsReset,
    Restart,
}

impl CommandKind {
    pub const ALL: [CommandKind; 8] = [
        CommandKind::AssignResources,
        CommandKind::ReleaseAllResources,
        CommandKind::Configure,
        CommandKind::Scan,
        CommandKind::EndScan,
        CommandKind::Abort,
        CommandKind::ObsReset,
        CommandKind::Restart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::AssignResources => "AssignResources",
            CommandKind::ReleaseAllResources => "ReleaseAllResources",
            CommandKind::Configure => "Configure",
            CommandKind::Scan => "Scan",
            CommandKind::EndScan => "EndScan",
            CommandKind::Abort => "Abort",
            CommandKind::ObsReset => "ObsReset",
            CommandKind::Restart => "Restart",
        }
    }

    /// Recovery commands must stay usable while a subordinate is stale.
    pub fn requires_responsive(&self) -> bool {
        !matches!(self, CommandKind::Abort | CommandKind::Restart)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a command came from. Internal commands are routed through the same
/// admission path as operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Operator,
    ScanTimer,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Operator => f.write_str("operator"),
            Origin::ScanTimer => f.write_str("scan timer expired"),
        }
    }
}

/// A command together with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AssignResources { resources: Value },
    ReleaseAllResources,
    Configure { configuration: Value },
    Scan { scan: Value, duration_secs: f64 },
    EndScan,
    Abort,
    ObsReset,
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadProblem(pub String);

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::AssignResources { .. } => CommandKind::AssignResources,
            Command::ReleaseAllResources => CommandKind::ReleaseAllResources,
            Command::Configure { .. } => CommandKind::Configure,
            Command::Scan { .. } => CommandKind::Scan,
            Command::EndScan => CommandKind::EndScan,
            Command::Abort => CommandKind::Abort,
            Command::ObsReset => CommandKind::ObsReset,
            Command::Restart => CommandKind::Restart,
        }
    }

    /// Payload forwarded to every subordinate.
    pub fn payload(&self) -> Value {
        match self {
            Command::AssignResources { resources } => resources.clone(),
            Command::Configure { configuration } => configuration.clone(),
            Command::Scan { scan, duration_secs } => json!({
                "scan": scan,
                "duration_s": duration_secs,
            }),
            _ => Value::Null,
        }
    }

    pub fn scan_duration(&self) -> Option<Duration> {
        match self {
            Command::Scan { duration_secs, .. } => Some(Duration::from_secs_f64(*duration_secs)),
            _ => None,
        }
    }

    /// Checks the payload shape. Called before any state is consulted.
    pub fn validate(&self, max_scan: Duration) -> Result<(), PayloadProblem> {
        match self {
            Command::AssignResources { resources } => require_object("resources", resources),
            Command::Configure { configuration } => require_object("configuration", configuration),
            Command::Scan { scan, duration_secs } => {
                require_object("scan", scan)?;
                if !duration_secs.is_finite() || *duration_secs <= 0.0 {
                    return Err(PayloadProblem(format!(
                        "scan duration must be a positive number of seconds, got {duration_secs}"
                    )));
                }
                if *duration_secs > max_scan.as_secs_f64() {
                    return Err(PayloadProblem(format!(
                        "scan duration {duration_secs}s exceeds the {}s limit",
                        max_scan.as_secs_f64()
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn require_object(field: &str, value: &Value) -> Result<(), PayloadProblem> {
    if value.is_object() {
        Ok(())
    } else {
        Err(PayloadProblem(format!("{field} must be a JSON object")))
    }
}
