//! Cancelable one-shot timer for GUI notification dismissal.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// A one-shot timer where scheduling supersedes any pending shot.
///
/// Cancellation is generation-based: `cancel` (or a new `schedule`) bumps
/// the generation, and a shot only fires if its generation is still current
/// when the delay elapses. A late fire after cancel is tolerated and no-ops.
#[derive(Debug, Default)]
pub struct OneShotTimer {
    generation: Arc<AtomicU64>,
}

impl OneShotTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) {
        let armed = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if generation.load(Ordering::SeqCst) == armed {
                action();
            }
        });
    }

    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_after_delay() {
        let timer = OneShotTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        timer.schedule(Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_suppresses_the_shot() {
        let timer = OneShotTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        timer.schedule(Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reschedule_replaces_pending_shot() {
        let timer = OneShotTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let first = fired.clone();
        timer.schedule(Duration::from_millis(20), move || {
            first.fetch_add(10, Ordering::SeqCst);
        });
        let second = fired.clone();
        timer.schedule(Duration::from_millis(30), move || {
            second.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
