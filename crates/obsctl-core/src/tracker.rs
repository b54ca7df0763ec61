use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::command::CommandKind;
use crate::state::FailureCause;
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandHandle(pub u64);

impl fmt::Display for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandOutcome {
    Succeeded { message: Option<String> },
    Failed { cause: FailureCause },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded { .. })
    }
}

/// A resolved command, delivered once through the continuation channel.
#[derive(Debug, Clone)]
pub struct Completion {
    pub handle: CommandHandle,
    pub command: CommandKind,
    pub target: String,
    pub outcome: CommandOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("{command} is already pending on {target}")]
    AlreadyPending { command: CommandKind, target: String },
}

struct PendingCommand {
    command: CommandKind,
    target: String,
    submitted_at: Instant,
    submitted_ts: DateTime<Utc>,
    deadline: Instant,
    deadline_task: Option<JoinHandle<()>>,
}

/// Serializable view of an outstanding command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSummary {
    pub handle: CommandHandle,
    pub command: CommandKind,
    pub target: String,
    pub submitted_ts: DateTime<Utc>,
    pub remaining_ms: u128,
}

struct TrackerInner {
    pending: Mutex<HashMap<CommandHandle, PendingCommand>>,
    next_handle: AtomicU64,
    completions: mpsc::UnboundedSender<Completion>,
    late_reply_grace: Duration,
}

/// Correlates asynchronous invocations with their outcome. Each handle is
/// resolved exactly once, by whichever of callback and deadline comes first.
#[derive(Clone)]
pub struct CompletionTracker {
    inner: Arc<TrackerInner>,
}

impl CompletionTracker {
    pub fn new(completions: mpsc::UnboundedSender<Completion>, late_reply_grace: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                pending: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                completions,
                late_reply_grace,
            }),
        }
    }

    /// Starts `call` on its own task and arms the deadline. Never blocks.
    pub fn dispatch<F>(
        &self,
        command: CommandKind,
        target: &str,
        deadline_after: Duration,
        call: F,
    ) -> Result<CommandHandle, TrackerError>
    where
        F: Future<Output = Result<Option<String>, TransportError>> + Send + 'static,
    {
        let handle = self.register(command, target, deadline_after)?;

        let tracker = self.clone();
        let bound = deadline_after + self.inner.late_reply_grace;
        tokio::spawn(async move {
            match timeout(bound, call).await {
                Ok(result) => {
                    tracker.on_callback(handle, result);
                }
                Err(_) => {
                    debug!(%handle, "call abandoned without a reply");
                }
            }
        });

        Ok(handle)
    }

    /// Creates the pending record and its deadline task.
    pub fn register(
        &self,
        command: CommandKind,
        target: &str,
        deadline_after: Duration,
    ) -> Result<CommandHandle, TrackerError> {
        let mut pending = self.inner.pending.lock();
        if pending
            .values()
            .any(|p| p.command == command && p.target == target)
        {
            return Err(TrackerError::AlreadyPending {
                command,
                target: target.to_string(),
            });
        }

        let handle = CommandHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();

        let tracker = self.clone();
        let deadline_task = tokio::spawn(async move {
            sleep(deadline_after).await;
            tracker.on_timeout(handle);
        });

        pending.insert(
            handle,
            PendingCommand {
                command,
                target: target.to_string(),
                submitted_at: now,
                submitted_ts: Utc::now(),
                deadline: now + deadline_after,
                deadline_task: Some(deadline_task),
            },
        );
        info!(%handle, command = %command, target, timeout_ms = %deadline_after.as_millis(), "dispatched");

        Ok(handle)
    }

    /// Resolves from the subordinate's reply. Returns false when the handle was
    /// already resolved, in which case the reply is discarded.
    pub fn on_callback(&self, handle: CommandHandle, result: Result<Option<String>, TransportError>) -> bool {
        let outcome = match result {
            Ok(message) => CommandOutcome::Succeeded { message },
            Err(TransportError::Remote { reason, .. }) => CommandOutcome::Failed {
                cause: FailureCause::Remote(reason),
            },
            Err(err) => CommandOutcome::Failed {
                cause: FailureCause::Remote(err.to_string()),
            },
        };
        self.resolve(handle, outcome, "callback")
    }

    /// Resolves as timed out if still pending.
    pub fn on_timeout(&self, handle: CommandHandle) -> bool {
        self.resolve(
            handle,
            CommandOutcome::Failed {
                cause: FailureCause::Timeout,
            },
            "deadline",
        )
    }

    fn resolve(&self, handle: CommandHandle, outcome: CommandOutcome, source: &'static str) -> bool {
        let Some(mut entry) = self.inner.pending.lock().remove(&handle) else {
            warn!(%handle, source, ?outcome, "discarding resolution of an already resolved command");
            return false;
        };

        if source == "callback" {
            if let Some(task) = entry.deadline_task.take() {
                task.abort();
            }
        }

        let completion = Completion {
            handle,
            command: entry.command,
            target: entry.target,
            outcome,
            elapsed: entry.submitted_at.elapsed(),
        };
        debug!(%handle, source, success = completion.outcome.is_success(), "resolved");

        if self.inner.completions.send(completion).is_err() {
            warn!(%handle, "completion receiver dropped");
        }
        true
    }

    pub fn is_pending(&self, command: CommandKind, target: &str) -> bool {
        self.inner
            .pending
            .lock()
            .values()
            .any(|p| p.command == command && p.target == target)
    }

    pub fn outstanding(&self) -> Vec<PendingSummary> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .inner
            .pending
            .lock()
            .iter()
            .map(|(handle, p)| PendingSummary {
                handle: *handle,
                command: p.command,
                target: p.target.clone(),
                submitted_ts: p.submitted_ts,
                remaining_ms: p.deadline.saturating_duration_since(now).as_millis(),
            })
            .collect();
        out.sort_by_key(|p| p.handle);
        out
    }
}
