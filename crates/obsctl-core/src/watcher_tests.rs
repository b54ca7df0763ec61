use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::aggregate::HealthStatus;
use crate::config::{SubordinateConfig, WatchConfig};
use crate::devices::{DeviceRegistry, Liveness};
use crate::transport::{SignalUpdate, TransportAdapter, TransportError};
use crate::watcher::{DeviceChanged, DeviceWatcher};

#[derive(Default)]
struct FakePeer {
    unreachable: AtomicBool,
    subscribes: AtomicU32,
    senders: Mutex<Vec<(String, mpsc::Sender<SignalUpdate>)>>,
}

impl FakePeer {
    fn sender(&self, signal: &str) -> mpsc::Sender<SignalUpdate> {
        self.senders
            .lock()
            .iter()
            .rev()
            .find(|(s, _)| s == signal)
            .map(|(_, tx)| tx.clone())
            .expect("subscribed")
    }

    fn end_subscriptions(&self) {
        self.senders.lock().clear();
    }
}

#[async_trait]
impl TransportAdapter for FakePeer {
    async fn call(&self, _device_id: &str, _command: &str, _payload: Value) -> Result<Option<String>, TransportError> {
        Ok(None)
    }

    async fn subscribe(&self, _device_id: &str, signal: &str) -> Result<mpsc::Receiver<SignalUpdate>, TransportError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(8);
        self.senders.lock().push((signal.to_string(), tx));
        Ok(rx)
    }

    async fn ping(&self, _device_id: &str) -> Result<(), TransportError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(TransportError::Timeout)
        } else {
            Ok(())
        }
    }
}

struct Fixture {
    peer: Arc<FakePeer>,
    registry: DeviceRegistry,
    watcher: DeviceWatcher<FakePeer>,
    changes: mpsc::UnboundedReceiver<DeviceChanged>,
}

fn fixture() -> Fixture {
    let peer = Arc::new(FakePeer::default());
    let liveness = Liveness {
        stale_after: Duration::from_secs(5),
        error_threshold: 3,
    };
    let (registry, mut writers) = DeviceRegistry::new(&[SubordinateConfig::required("csp")], liveness);
    let (tx, changes) = mpsc::unbounded_channel();
    let writer = writers.pop().expect("one writer");
    let watcher = DeviceWatcher::new(Arc::clone(&peer), writer, WatchConfig::default(), tx);
    Fixture {
        peer,
        registry,
        watcher,
        changes,
    }
}

fn drain(changes: &mut mpsc::UnboundedReceiver<DeviceChanged>) -> usize {
    let mut count = 0;
    while let Ok(changed) = changes.try_recv() {
        assert_eq!(changed.device_id, "csp");
        count += 1;
    }
    count
}

#[tokio::test(start_paused = true)]
async fn failed_probes_back_off_then_recover() {
    // Arrange
    let mut f = fixture();
    f.peer.unreachable.store(true, Ordering::SeqCst);

    // Act
    for _ in 0..10 {
        f.watcher.probe().await;
    }
    let backed_off = f.watcher.effective_interval();
    let while_down = f.registry.snapshot().remove(0);

    f.peer.unreachable.store(false, Ordering::SeqCst);
    f.watcher.probe().await;
    let after_first_success = f.watcher.effective_interval();
    for _ in 0..24 {
        f.watcher.probe().await;
    }

    // Assert
    assert_eq!(backed_off, Duration::from_secs(3), "capped at probe_interval_max");
    assert_eq!(while_down.consecutive_failures, 10);
    assert!(while_down.consecutive_failures >= f.registry.liveness().error_threshold);
    assert!(!while_down.responsive);
    assert_eq!(after_first_success, Duration::from_millis(2_900));
    assert_eq!(f.watcher.effective_interval(), Duration::from_secs(1), "decays to probe_interval_min");
    let recovered = f.registry.snapshot().remove(0);
    assert!(recovered.responsive);
    assert_eq!(recovered.consecutive_failures, 0);
    assert_eq!(drain(&mut f.changes), 35, "one notification per probe");
}

#[tokio::test(start_paused = true)]
async fn push_errors_count_as_failures_until_the_next_value() {
    // Arrange
    let f = fixture();
    let registry = f.registry.clone();
    let peer = Arc::clone(&f.peer);
    let mut changes = f.changes;
    tokio::spawn(f.watcher.run());
    sleep(Duration::from_millis(100)).await;
    drain(&mut changes);

    // Act
    peer.sender("healthState")
        .send(Err(TransportError::Disconnected))
        .await
        .expect("send");
    sleep(Duration::from_millis(100)).await;
    let after_error = registry.snapshot().remove(0);

    peer.sender("healthState")
        .send(Ok(json!("DEGRADED")))
        .await
        .expect("send");
    sleep(Duration::from_millis(100)).await;
    let after_value = registry.snapshot().remove(0);

    // Assert
    assert_eq!(after_error.consecutive_failures, 1);
    assert_eq!(after_error.last_error.as_deref(), Some("subordinate disconnected"));
    assert_eq!(after_value.status, HealthStatus::Degraded);
    assert_eq!(after_value.consecutive_failures, 0);
    assert_eq!(drain(&mut changes), 2, "each write is announced");
}

#[tokio::test(start_paused = true)]
async fn ended_subscriptions_are_renewed_on_the_next_tick() {
    // Arrange
    let f = fixture();
    let registry = f.registry.clone();
    let peer = Arc::clone(&f.peer);
    let _changes = f.changes;
    tokio::spawn(f.watcher.run());
    sleep(Duration::from_millis(100)).await;
    let initial = peer.subscribes.load(Ordering::SeqCst);

    // Act
    peer.end_subscriptions();
    sleep(Duration::from_millis(1_500)).await;
    peer.sender("obsState")
        .send(Ok(json!("READY")))
        .await
        .expect("send");
    sleep(Duration::from_millis(100)).await;

    // Assert
    assert_eq!(initial, 2, "health and obsState");
    assert_eq!(peer.subscribes.load(Ordering::SeqCst), 4);
    assert_eq!(
        registry.snapshot().remove(0).obs_state,
        Some(crate::state::ObsState::Ready)
    );
}

#[tokio::test(start_paused = true)]
async fn watcher_exits_once_nobody_listens() {
    let f = fixture();
    let handle = tokio::spawn(f.watcher.run());
    drop(f.changes);

    sleep(Duration::from_millis(1_500)).await;

    assert!(handle.is_finished());
}
