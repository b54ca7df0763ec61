use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate_obs_states, HealthStatus, StatusAggregator};
use crate::command::{Command, CommandKind, Origin};
use crate::config::ControllerConfig;
use crate::devices::{DeviceRegistry, DeviceSnapshot, Liveness};
use crate::guard::{AdmissionContext, AdmissionError, CommandAdmissionGuard};
use crate::state::{FailureCause, ObsState, ObservationStateMachine};
use crate::status::{ActivityEntry, ControllerStatus};
use crate::timer::{ScanTimer, ScanTimerStatus};
use crate::tracker::{CommandHandle, CommandOutcome, CompletionTracker, Completion};
use crate::transport::TransportAdapter;
use crate::watcher::{DeviceChanged, DeviceWatcher};

/// Returned when a command has been admitted and dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandAck {
    pub operation: u64,
    pub command: CommandKind,
    pub origin: Origin,
    pub from: ObsState,
    pub provisional: ObsState,
    pub targets: usize,
}

/// One admitted command fanned out to every subordinate.
struct Operation {
    id: u64,
    command: CommandKind,
    origin: Origin,
    from: ObsState,
    waiting: HashSet<CommandHandle>,
    succeeded: usize,
}

struct ControlState {
    machine: ObservationStateMachine,
    operation: Option<Operation>,
    next_operation: u64,
    /// Scan window that expired while its Scan was still awaiting replies.
    end_scan_due: Option<u64>,
}

enum ControllerEvent {
    ScanExpired { window: u64 },
}

struct Inner<T: TransportAdapter> {
    config: ControllerConfig,
    transport: Arc<T>,
    devices: DeviceRegistry,
    aggregator: StatusAggregator,
    tracker: CompletionTracker,
    timer: ScanTimer,
    control: Mutex<ControlState>,
    activity: Mutex<VecDeque<ActivityEntry>>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    changes: watch::Sender<u64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Supervises one observation. Cloning yields another handle to the same
/// observation.
pub struct ObservationController<T: TransportAdapter> {
    inner: Arc<Inner<T>>,
}

impl<T: TransportAdapter> Clone for ObservationController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: TransportAdapter> ObservationController<T> {
    /// Builds the controller and spawns its event loop and one watcher per
    /// subordinate. Must be called from within a tokio runtime.
    pub fn start(config: ControllerConfig, transport: Arc<T>) -> Self {
        let liveness = Liveness {
            stale_after: config.watch.stale_after,
            error_threshold: config.watch.error_threshold,
        };
        let (devices, writers) = DeviceRegistry::new(&config.subordinates, liveness);

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let (changes, _) = watch::channel(0_u64);

        let inner = Arc::new(Inner {
            aggregator: StatusAggregator::new(config.dominance),
            tracker: CompletionTracker::new(completions_tx, config.late_reply_grace),
            timer: ScanTimer::new(),
            control: Mutex::new(ControlState {
                machine: ObservationStateMachine::default(),
                operation: None,
                next_operation: 1,
                end_scan_due: None,
            }),
            activity: Mutex::new(VecDeque::with_capacity(config.activity_history)),
            events: events_tx,
            changes,
            tasks: Mutex::new(Vec::new()),
            devices,
            transport: Arc::clone(&transport),
            config,
        });

        let mut tasks = Vec::with_capacity(writers.len() + 1);
        tasks.push(tokio::spawn(run_events(
            Arc::downgrade(&inner),
            completions_rx,
            events_rx,
            device_rx,
        )));
        for writer in writers {
            let watcher = DeviceWatcher::new(
                Arc::clone(&transport),
                writer,
                inner.config.watch.clone(),
                device_tx.clone(),
            );
            tasks.push(tokio::spawn(watcher.run()));
        }
        *inner.tasks.lock() = tasks;

        if inner.devices.is_empty() {
            warn!(observation = %inner.config.observation_id, "no subordinates configured, commands complete immediately");
        }

        info!(
            observation = %inner.config.observation_id,
            subordinates = inner.devices.len(),
            "observation controller started"
        );

        Self { inner }
    }

    /// Admits and dispatches a command. Returns as soon as the subordinate
    /// calls are in flight; their outcome is applied asynchronously.
    pub fn submit(&self, command: Command) -> Result<CommandAck, AdmissionError> {
        self.inner.submit(command, Origin::Operator)
    }

    pub fn assign_resources(&self, resources: Value) -> Result<CommandAck, AdmissionError> {
        self.submit(Command::AssignResources { resources })
    }

    pub fn release_all_resources(&self) -> Result<CommandAck, AdmissionError> {
        self.submit(Command::ReleaseAllResources)
    }

    pub fn configure(&self, configuration: Value) -> Result<CommandAck, AdmissionError> {
        self.submit(Command::Configure { configuration })
    }

    pub fn scan(&self, scan: Value, duration_secs: f64) -> Result<CommandAck, AdmissionError> {
        self.submit(Command::Scan { scan, duration_secs })
    }

    pub fn end_scan(&self) -> Result<CommandAck, AdmissionError> {
        self.submit(Command::EndScan)
    }

    pub fn abort(&self) -> Result<CommandAck, AdmissionError> {
        self.submit(Command::Abort)
    }

    pub fn obs_reset(&self) -> Result<CommandAck, AdmissionError> {
        self.submit(Command::ObsReset)
    }

    pub fn restart(&self) -> Result<CommandAck, AdmissionError> {
        self.submit(Command::Restart)
    }

    pub fn observation_state(&self) -> ObsState {
        self.inner.control.lock().machine.current()
    }

    /// Recomputed from the current subordinate records on every call.
    pub fn aggregated_status(&self) -> HealthStatus {
        self.inner.aggregated_status(&self.inner.devices.snapshot())
    }

    pub fn last_activity(&self) -> Option<String> {
        self.inner.activity.lock().back().map(|e| e.message.clone())
    }

    pub fn activity(&self) -> Vec<ActivityEntry> {
        self.inner.activity.lock().iter().cloned().collect()
    }

    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.inner.devices.snapshot()
    }

    pub fn scan_timer(&self) -> ScanTimerStatus {
        self.inner.timer.status()
    }

    pub fn status(&self) -> ControllerStatus {
        let devices = self.inner.devices.snapshot();
        ControllerStatus {
            ts: Utc::now(),
            observation_id: self.inner.config.observation_id.clone(),
            observation_state: self.observation_state(),
            aggregated_status: self.inner.aggregated_status(&devices),
            last_activity: self.last_activity(),
            devices,
            scan_timer: self.scan_timer(),
            pending: self.inner.tracker.outstanding(),
            activity: self.activity(),
        }
    }

    /// Bumped after every applied event; pair with [`Self::status`].
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    /// Stops the event loop and watchers. In-flight tracking is lost.
    pub fn shutdown(&self) {
        self.inner.timer.cancel();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!(observation = %self.inner.config.observation_id, "observation controller stopped");
    }
}

impl<T: TransportAdapter> Inner<T> {
    fn aggregated_status(&self, devices: &[DeviceSnapshot]) -> HealthStatus {
        self.aggregator.aggregate(devices.iter().map(|d| d.status))
    }

    fn submit(&self, command: Command, origin: Origin) -> Result<CommandAck, AdmissionError> {
        let kind = command.kind();
        let devices = self.devices.snapshot();
        let targets = self.devices.ids();

        let mut control = self.control.lock();
        let conflicting: Vec<String> = targets
            .iter()
            .filter(|target| self.tracker.is_pending(kind, target))
            .cloned()
            .collect();
        let ctx = AdmissionContext {
            devices: &devices,
            busy_with: control.operation.as_ref().map(|op| op.command),
            conflicting_targets: &conflicting,
            max_scan_duration: self.config.max_scan_duration,
        };

        let admission = match CommandAdmissionGuard::admit(&mut control.machine, &command, &ctx) {
            Ok(admission) => admission,
            Err(err) => {
                drop(control);
                warn!(command = %kind, %origin, error = %err, "command rejected");
                self.record_activity(format!("{kind} rejected ({origin}): {err}"));
                self.bump();
                return Err(err);
            }
        };

        if let Some(previous) = control.operation.take() {
            info!(operation = previous.id, command = %previous.command, "operation superseded");
            self.record_activity(format!("{kind} supersedes in-flight {}", previous.command));
        }

        match kind {
            CommandKind::EndScan | CommandKind::Abort => {
                self.timer.cancel();
                control.end_scan_due = None;
            }
            CommandKind::Scan => {
                if let Some(duration) = command.scan_duration() {
                    let events = self.events.clone();
                    self.timer.start(duration, move |window| {
                        let _ = events.send(ControllerEvent::ScanExpired { window });
                    });
                }
            }
            _ => {}
        }

        let id = control.next_operation;
        control.next_operation += 1;

        let deadline = self.config.timeout_for(kind);
        let payload = command.payload();
        let mut waiting = HashSet::with_capacity(targets.len());
        let mut dispatch_error = None;

        for target in &targets {
            let transport = Arc::clone(&self.transport);
            let device = target.clone();
            let payload = payload.clone();
            let call = async move { transport.call(&device, kind.as_str(), payload).await };

            match self.tracker.dispatch(kind, target, deadline, call) {
                Ok(handle) => {
                    waiting.insert(handle);
                }
                Err(err) => {
                    dispatch_error = Some(err);
                    break;
                }
            }
        }

        let ack = CommandAck {
            operation: id,
            command: kind,
            origin,
            from: admission.from,
            provisional: admission.provisional,
            targets: targets.len(),
        };

        if let Some(err) = dispatch_error {
            let to = control
                .machine
                .fail(kind, admission.from, &FailureCause::Remote(err.to_string()));
            self.settle_timer(to);
            drop(control);
            self.record_activity(format!("{kind} dispatch failed: {err}; now {to}"));
        } else if waiting.is_empty() {
            let to = control.machine.complete(kind);
            self.settle_timer(to);
            drop(control);
            self.record_activity(format!("{kind} completed with no subordinates; now {to}"));
        } else {
            control.operation = Some(Operation {
                id,
                command: kind,
                origin,
                from: admission.from,
                waiting,
                succeeded: 0,
            });
            drop(control);
            info!(operation = id, command = %kind, %origin, from = %admission.from, to = %admission.provisional, "command admitted");
            self.record_activity(format!(
                "{kind} accepted ({origin}): {} -> {}",
                admission.from, admission.provisional
            ));
        }

        self.bump();
        Ok(ack)
    }

    fn on_completion(&self, completion: Completion) {
        let mut control = self.control.lock();
        let belongs = control
            .operation
            .as_ref()
            .is_some_and(|op| op.waiting.contains(&completion.handle));
        if !belongs {
            debug!(handle = %completion.handle, command = %completion.command, "completion for a settled operation ignored");
            return;
        }

        let mut deferred_end_scan = None;
        let message = match completion.outcome {
            CommandOutcome::Succeeded { message: reply } => {
                let Some(op) = control.operation.as_mut() else {
                    return;
                };
                op.waiting.remove(&completion.handle);
                op.succeeded += 1;
                debug!(
                    operation = op.id,
                    target = %completion.target,
                    reply = ?reply,
                    remaining = op.waiting.len(),
                    "subordinate completed"
                );
                if !op.waiting.is_empty() {
                    return;
                }
                let Some(op) = control.operation.take() else {
                    return;
                };
                let to = control.machine.complete(op.command);
                self.settle_timer(to);
                let due = control.end_scan_due.take();
                if op.command == CommandKind::Scan && to == ObsState::Scanning {
                    deferred_end_scan = due;
                }
                match op.origin {
                    Origin::Operator => format!(
                        "{} completed on {} subordinate(s); now {to}",
                        op.command, op.succeeded
                    ),
                    origin => format!(
                        "{} ({origin}) completed on {} subordinate(s); now {to}",
                        op.command, op.succeeded
                    ),
                }
            }
            CommandOutcome::Failed { cause } => {
                let Some(op) = control.operation.take() else {
                    return;
                };
                let to = control.machine.fail(op.command, op.from, &cause);
                self.settle_timer(to);
                control.end_scan_due = None;
                warn!(
                    operation = op.id,
                    command = %op.command,
                    target = %completion.target,
                    elapsed_ms = %completion.elapsed.as_millis(),
                    %cause,
                    "operation failed"
                );
                format!("{} failed on {}: {cause}; now {to}", op.command, completion.target)
            }
        };

        drop(control);
        self.record_activity(message);
        self.bump();

        if let Some(window) = deferred_end_scan {
            info!(window, "scan settled after its window expired, ending scan");
            self.end_scan_from_timer(window);
        }
    }

    fn on_scan_expired(&self, window: u64) {
        let mut control = self.control.lock();
        let scan_in_flight = control
            .operation
            .as_ref()
            .is_some_and(|op| op.command == CommandKind::Scan);
        if scan_in_flight {
            control.end_scan_due = Some(window);
            drop(control);
            info!(window, "scan timer expired while Scan is in progress, EndScan deferred");
            self.record_activity(format!(
                "scan timer expired (window {window}) while Scan is in progress; EndScan deferred"
            ));
            self.bump();
            return;
        }
        drop(control);

        info!(window, "scan timer expired, ending scan");
        self.record_activity(format!("scan timer expired (window {window})"));
        self.end_scan_from_timer(window);
    }

    fn end_scan_from_timer(&self, window: u64) {
        match self.submit(Command::EndScan, Origin::ScanTimer) {
            Ok(ack) => debug!(window, operation = ack.operation, "timer EndScan admitted"),
            Err(err) => debug!(window, error = %err, "timer EndScan not admitted"),
        }
    }

    fn on_device_changed(&self, changed: DeviceChanged) {
        if !self.config.follow_subordinate_obs_state {
            self.bump();
            return;
        }

        let devices = self.devices.snapshot();
        let reported: Vec<ObsState> = devices.iter().filter_map(|d| d.obs_state).collect();
        if reported.is_empty() {
            self.bump();
            return;
        }

        let Some(aggregate) = aggregate_obs_states(reported) else {
            debug!(device = %changed.device_id, "subordinate observation states are mixed");
            self.bump();
            return;
        };

        let mut control = self.control.lock();
        let Some(to) = control.machine.on_subordinate_obs_state(aggregate) else {
            drop(control);
            self.bump();
            return;
        };
        if to == ObsState::Fault {
            if let Some(op) = control.operation.take() {
                warn!(operation = op.id, command = %op.command, "operation dropped, subordinates in FAULT");
            }
            control.end_scan_due = None;
        }
        self.settle_timer(to);
        drop(control);

        self.record_activity(format!("following subordinates (after {}): now {to}", changed.device_id));
        self.bump();
    }

    fn settle_timer(&self, state: ObsState) {
        if state != ObsState::Scanning {
            self.timer.cancel();
        }
    }

    fn record_activity(&self, message: String) {
        info!(observation = %self.config.observation_id, activity = %message);
        let mut activity = self.activity.lock();
        activity.push_back(ActivityEntry {
            ts: Utc::now(),
            message,
        });
        while activity.len() > self.config.activity_history.max(1) {
            activity.pop_front();
        }
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }
}

async fn run_events<T: TransportAdapter>(
    inner: Weak<Inner<T>>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
    mut events: mpsc::UnboundedReceiver<ControllerEvent>,
    mut device_changes: mpsc::UnboundedReceiver<DeviceChanged>,
) {
    loop {
        tokio::select! {
            Some(completion) = completions.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.on_completion(completion);
            }
            Some(event) = events.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match event {
                    ControllerEvent::ScanExpired { window } => inner.on_scan_expired(window),
                }
            }
            Some(changed) = device_changes.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.on_device_changed(changed);
            }
            else => break,
        }
    }
    debug!("controller event loop stopped");
}
