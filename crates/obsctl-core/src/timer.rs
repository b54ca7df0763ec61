use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

struct ScanWindow {
    id: u64,
    deadline: Instant,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct TimerSlot {
    window: Option<ScanWindow>,
    next_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanTimerStatus {
    pub active: bool,
    pub window_id: Option<u64>,
    pub remaining_ms: Option<u128>,
}

/// One-shot scan deadline. Firing and cancellation take the window out of the
/// same slot under one lock, so only the first of the two has any effect.
#[derive(Clone, Default)]
pub struct ScanTimer {
    slot: Arc<Mutex<TimerSlot>>,
}

impl ScanTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a new window, cancelling any previous one. `on_fire` runs at most
    /// once, and only if the window is still armed at the deadline.
    pub fn start<F>(&self, duration: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(previous) = slot.window.take() {
            previous.task.abort();
            debug!(window = previous.id, "replaced scan window");
        }

        slot.next_id += 1;
        let id = slot.next_id;
        let deadline = Instant::now() + duration;

        let timer_slot = Arc::clone(&self.slot);
        let task = tokio::spawn(async move {
            sleep(duration).await;
            let fired = {
                let mut slot = timer_slot.lock();
                match slot.window.as_ref() {
                    Some(window) if window.id == id => slot.window.take().is_some(),
                    _ => false,
                }
            };
            if fired {
                info!(window = id, "scan window expired");
                on_fire(id);
            }
        });

        slot.window = Some(ScanWindow { id, deadline, task });
        info!(window = id, duration_ms = %duration.as_millis(), "scan window armed");
        id
    }

    /// Returns true if an armed window was cancelled, false if there was none
    /// or it had already fired.
    pub fn cancel(&self) -> bool {
        let Some(window) = self.slot.lock().window.take() else {
            return false;
        };
        window.task.abort();
        info!(window = window.id, "scan window cancelled");
        true
    }

    pub fn is_active(&self) -> bool {
        self.slot.lock().window.is_some()
    }

    pub fn status(&self) -> ScanTimerStatus {
        let slot = self.slot.lock();
        match slot.window.as_ref() {
            Some(window) => ScanTimerStatus {
                active: true,
                window_id: Some(window.id),
                remaining_ms: Some(
                    window
                        .deadline
                        .saturating_duration_since(Instant::now())
                        .as_millis(),
                ),
            },
            None => ScanTimerStatus {
                active: false,
                window_id: None,
                remaining_ms: None,
            },
        }
    }
}
