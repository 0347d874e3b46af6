use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SLEEP_CHUNK: Duration = Duration::from_secs(1);

/// Shared running flag observed by every background loop.
///
/// Clones share the same flag. Sleeps are split into one-second chunks so a
/// stop request is noticed within a second whatever the interval.
#[derive(Debug, Clone)]
pub struct Shutdown {
    running: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Sleeps up to `duration`. Returns `false` if shutdown was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO && self.is_running() {
            let step = remaining.min(SLEEP_CHUNK);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        self.is_running()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_clones_share_flag() {
        let a = Shutdown::new();
        let b = a.clone();
        assert!(b.is_running());
        a.request();
        assert!(!b.is_running());
    }

    #[test]
    fn test_sleep_returns_early_after_request() {
        let shutdown = Shutdown::new();
        let remote = shutdown.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.request();
        });

        let started = Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_zero_sleep() {
        assert!(Shutdown::new().sleep(Duration::ZERO));
    }
}
