use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::timer::ScanTimer;

fn counter() -> (Arc<AtomicU32>, impl FnOnce(u64) + Send + 'static) {
    let fired = Arc::new(AtomicU32::new(0));
    let hook = Arc::clone(&fired);
    (fired, move |_| {
        hook.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test(start_paused = true)]
async fn fires_exactly_once_at_deadline() {
    // Arrange
    let timer = ScanTimer::new();
    let (fired, on_fire) = counter();

    // Act
    timer.start(Duration::from_secs(10), on_fire);
    sleep(Duration::from_millis(9_900)).await;
    let before_deadline = fired.load(Ordering::SeqCst);
    sleep(Duration::from_secs(5)).await;

    // Assert
    assert_eq!(before_deadline, 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!timer.is_active());
    assert!(!timer.cancel(), "cancel after firing is a no-op");
}

#[tokio::test(start_paused = true)]
async fn cancel_before_deadline_prevents_firing() {
    let timer = ScanTimer::new();
    let (fired, on_fire) = counter();

    timer.start(Duration::from_secs(10), on_fire);
    sleep(Duration::from_secs(3)).await;
    assert!(timer.cancel());
    sleep(Duration::from_secs(10)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(!timer.cancel());
}

#[tokio::test(start_paused = true)]
async fn restarting_replaces_the_previous_window() {
    // Arrange
    let timer = ScanTimer::new();
    let (first, first_hook) = counter();
    let (second, second_hook) = counter();

    // Act
    let first_id = timer.start(Duration::from_secs(5), first_hook);
    let second_id = timer.start(Duration::from_secs(8), second_hook);
    sleep(Duration::from_secs(10)).await;

    // Assert
    assert_ne!(first_id, second_id);
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn status_reports_remaining_time() {
    let timer = ScanTimer::new();
    let (_fired, on_fire) = counter();

    let id = timer.start(Duration::from_secs(10), on_fire);
    sleep(Duration::from_secs(4)).await;
    let status = timer.status();

    assert!(status.active);
    assert_eq!(status.window_id, Some(id));
    let remaining = status.remaining_ms.expect("remaining");
    assert!((5_000..=6_000).contains(&remaining), "remaining {remaining}");
}
