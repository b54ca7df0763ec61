use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obsctl_core::{
    ControllerConfig, ObservationController, SignalUpdate, SubordinateConfig, TransportAdapter,
    TransportError, WatchConfig,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;

#[derive(Default)]
struct Script {
    unreachable: Vec<String>,
    delays: HashMap<(String, String), Duration>,
    failures: HashMap<(String, String), String>,
    subscribers: HashMap<(String, String), Vec<mpsc::Sender<SignalUpdate>>>,
    calls: Vec<(String, String)>,
}

/// In-process subordinates whose replies and pushes are driven by the test.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn set_reachable(&self, device: &str, reachable: bool) {
        let mut script = self.script.lock();
        script.unreachable.retain(|d| d != device);
        if !reachable {
            script.unreachable.push(device.to_string());
        }
    }

    pub fn reply_after(&self, device: &str, command: &str, delay: Duration) {
        self.script
            .lock()
            .delays
            .insert((device.to_string(), command.to_string()), delay);
    }

    pub fn fail(&self, device: &str, command: &str, reason: &str) {
        self.script
            .lock()
            .failures
            .insert((device.to_string(), command.to_string()), reason.to_string());
    }

    pub fn calls_of(&self, command: &str) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|(_, c)| c == command)
            .count()
    }

    pub async fn push(&self, device: &str, signal: &str, value: &str) {
        let senders = self
            .script
            .lock()
            .subscribers
            .get(&(device.to_string(), signal.to_string()))
            .cloned()
            .unwrap_or_default();
        for tx in senders {
            let _ = tx.send(Ok(json!(value))).await;
        }
    }
}

#[async_trait]
impl TransportAdapter for ScriptedTransport {
    async fn call(
        &self,
        device_id: &str,
        command: &str,
        _payload: Value,
    ) -> Result<Option<String>, TransportError> {
        let key = (device_id.to_string(), command.to_string());
        let (delay, failure, reachable) = {
            let mut script = self.script.lock();
            script.calls.push(key.clone());
            (
                script.delays.get(&key).copied(),
                script.failures.get(&key).cloned(),
                !script.unreachable.iter().any(|d| d == device_id),
            )
        };

        if let Some(delay) = delay {
            sleep(delay).await;
        }
        if !reachable {
            return Err(TransportError::Disconnected);
        }
        match failure {
            Some(reason) => Err(TransportError::Remote {
                command: command.to_string(),
                reason,
            }),
            None => Ok(None),
        }
    }

    async fn subscribe(
        &self,
        device_id: &str,
        signal: &str,
    ) -> Result<mpsc::Receiver<SignalUpdate>, TransportError> {
        let (tx, rx) = mpsc::channel(16);
        self.script
            .lock()
            .subscribers
            .entry((device_id.to_string(), signal.to_string()))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn ping(&self, device_id: &str) -> Result<(), TransportError> {
        if self.script.lock().unreachable.iter().any(|d| d == device_id) {
            Err(TransportError::Timeout)
        } else {
            Ok(())
        }
    }
}

pub fn config(devices: &[&str]) -> ControllerConfig {
    ControllerConfig {
        observation_id: "subarray-01".to_string(),
        subordinates: devices.iter().map(|d| SubordinateConfig::required(*d)).collect(),
        command_timeout: Duration::from_secs(2),
        watch: WatchConfig {
            probe_interval: Duration::from_secs(1),
            probe_interval_min: Duration::from_secs(1),
            probe_interval_max: Duration::from_secs(3),
            probe_timeout: Duration::from_millis(500),
            stale_after: Duration::from_secs(5),
            error_threshold: 3,
            ..WatchConfig::default()
        },
        ..ControllerConfig::default()
    }
}

pub fn start(devices: &[&str]) -> (ObservationController<ScriptedTransport>, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::default());
    let controller = ObservationController::start(config(devices), Arc::clone(&transport));
    (controller, transport)
}

/// Lets spawned tasks run. Time is paused in these tests, so this is instant.
pub async fn settle() {
    sleep(Duration::from_millis(100)).await;
}
