use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::aggregate::HealthStatus;
use crate::config::WatchConfig;
use crate::devices::DeviceWriter;
use crate::state::ObsState;
use crate::transport::{SignalUpdate, TransportAdapter, TransportError};

/// Sent after every write to a subordinate record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChanged {
    pub device_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalKind {
    Health,
    ObsState,
}

/// Keeps one subordinate record current. This task is the record's only
/// writer: push notifications and liveness probes both land here.
pub struct DeviceWatcher<T: TransportAdapter> {
    transport: Arc<T>,
    writer: DeviceWriter,
    device_id: String,
    config: WatchConfig,
    notify: mpsc::UnboundedSender<DeviceChanged>,
    effective_interval: Duration,
    probes_ok: u64,
}

impl<T: TransportAdapter> DeviceWatcher<T> {
    pub fn new(
        transport: Arc<T>,
        writer: DeviceWriter,
        config: WatchConfig,
        notify: mpsc::UnboundedSender<DeviceChanged>,
    ) -> Self {
        let device_id = writer.id();
        Self {
            transport,
            writer,
            device_id,
            effective_interval: config.probe_interval,
            config,
            notify,
            probes_ok: 0,
        }
    }

    pub fn effective_interval(&self) -> Duration {
        self.effective_interval
    }

    pub async fn run(mut self) {
        let mut health_rx: Option<mpsc::Receiver<SignalUpdate>> = None;
        let mut obs_rx: Option<mpsc::Receiver<SignalUpdate>> = None;

        self.ensure_subscribed(&mut health_rx, SignalKind::Health).await;
        self.ensure_subscribed(&mut obs_rx, SignalKind::ObsState).await;
        self.probe().await;

        let mut ticker = self.ticker();

        loop {
            tokio::select! {
                update = recv_or_wait(&mut health_rx) => {
                    self.on_update(SignalKind::Health, update, &mut health_rx);
                }
                update = recv_or_wait(&mut obs_rx) => {
                    self.on_update(SignalKind::ObsState, update, &mut obs_rx);
                }
                _ = ticker.tick() => {
                    let before = self.effective_interval;
                    self.probe().await;
                    self.ensure_subscribed(&mut health_rx, SignalKind::Health).await;
                    self.ensure_subscribed(&mut obs_rx, SignalKind::ObsState).await;
                    if self.notify.is_closed() {
                        debug!(device = %self.device_id, "controller gone, watcher exiting");
                        return;
                    }
                    if self.effective_interval != before {
                        ticker = self.ticker();
                    }
                }
            }
        }
    }

    fn ticker(&self) -> tokio::time::Interval {
        let mut ticker = interval_at(Instant::now() + self.effective_interval, self.effective_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn ensure_subscribed(&self, slot: &mut Option<mpsc::Receiver<SignalUpdate>>, kind: SignalKind) {
        if slot.is_some() {
            return;
        }
        let signal = match kind {
            SignalKind::Health => &self.config.health_signal,
            SignalKind::ObsState => &self.config.obs_state_signal,
        };
        match timeout(self.config.probe_timeout, self.transport.subscribe(&self.device_id, signal)).await {
            Ok(Ok(rx)) => {
                info!(device = %self.device_id, signal = %signal, "subscribed");
                *slot = Some(rx);
            }
            Ok(Err(err)) => {
                debug!(device = %self.device_id, signal = %signal, error = %err, "subscribe failed");
            }
            Err(_) => {
                debug!(device = %self.device_id, signal = %signal, "subscribe timed out");
            }
        }
    }

    fn on_update(
        &mut self,
        kind: SignalKind,
        update: Option<SignalUpdate>,
        slot: &mut Option<mpsc::Receiver<SignalUpdate>>,
    ) {
        let Some(update) = update else {
            warn!(device = %self.device_id, signal = ?kind, "subscription ended");
            *slot = None;
            return;
        };

        match update {
            Ok(value) => self.apply_value(kind, &value),
            Err(err) => {
                let failures = self.writer.record_failure(err.to_string());
                warn!(device = %self.device_id, signal = ?kind, error = %err, failures, "push notification error");
            }
        }
        self.changed();
    }

    fn apply_value(&self, kind: SignalKind, value: &serde_json::Value) {
        let Some(raw) = value.as_str() else {
            warn!(device = %self.device_id, signal = ?kind, %value, "non-string signal value ignored");
            return;
        };
        match kind {
            SignalKind::Health => match HealthStatus::parse(raw) {
                Some(status) => {
                    debug!(device = %self.device_id, %status, "health update");
                    self.writer.record_status(status);
                }
                None => {
                    warn!(device = %self.device_id, value = raw, "unrecognised health value");
                    self.writer.record_status(HealthStatus::Unknown);
                }
            },
            SignalKind::ObsState => match ObsState::parse(raw) {
                Some(state) => {
                    debug!(device = %self.device_id, %state, "observation state update");
                    self.writer.record_obs_state(state);
                }
                None => {
                    warn!(device = %self.device_id, value = raw, "unrecognised observation state");
                }
            },
        }
    }

    pub(crate) async fn probe(&mut self) {
        let started = Instant::now();
        let result = match timeout(self.config.probe_timeout, self.transport.ping(&self.device_id)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match result {
            Ok(()) => {
                self.probes_ok += 1;
                self.writer.record_contact();
                self.tune_interval(started.elapsed(), true);
            }
            Err(err) => {
                let failures = self.writer.record_failure(err.to_string());
                if failures == self.config.error_threshold {
                    warn!(device = %self.device_id, error = %err, failures, "subordinate unresponsive");
                } else {
                    debug!(device = %self.device_id, error = %err, failures, "probe failed");
                }
                self.tune_interval(self.config.probe_timeout, false);
            }
        }
        self.changed();
    }

    fn tune_interval(&mut self, rtt: Duration, ok: bool) {
        if !ok {
            self.effective_interval = (self.effective_interval + Duration::from_millis(250))
                .min(self.config.probe_interval_max);
            return;
        }

        let threshold = self.effective_interval.mul_f64(0.6);
        if rtt > threshold {
            self.effective_interval = (self.effective_interval + Duration::from_millis(200))
                .min(self.config.probe_interval_max);
            return;
        }

        if self.probes_ok % 30 == 0 || self.effective_interval > self.config.probe_interval {
            self.effective_interval = self
                .effective_interval
                .saturating_sub(Duration::from_millis(100))
                .max(self.config.probe_interval_min);
        }
    }

    fn changed(&self) {
        let _ = self.notify.send(DeviceChanged {
            device_id: self.device_id.clone(),
        });
    }
}

async fn recv_or_wait(slot: &mut Option<mpsc::Receiver<SignalUpdate>>) -> Option<SignalUpdate> {
    match slot.as_mut() {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}
