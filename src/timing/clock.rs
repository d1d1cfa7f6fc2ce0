use std::sync::atomic::{AtomicI64, Ordering};
use tokio::time::Instant;

/// Source of local epoch-millisecond time
pub trait LocalClock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall time anchored once, then advanced by the monotonic tokio clock.
///
/// Immune to wall-clock steps after construction, and follows a paused tokio
/// clock in tests.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor_wall_ms: i64,
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::anchored_at(chrono::Utc::now().timestamp_millis())
    }

    pub fn anchored_at(wall_ms: i64) -> Self {
        Self {
            anchor_wall_ms: wall_ms,
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalClock for MonotonicClock {
    fn now_ms(&self) -> i64 {
        self.anchor_wall_ms + self.anchor.elapsed().as_millis() as i64
    }
}

/// Manually driven clock for deterministic tests and replay
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl LocalClock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn monotonic_clock_follows_tokio_time() {
        let clock = MonotonicClock::anchored_at(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(clock.now_ms(), 2_500);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(10);
        clock.advance(5);
        assert_eq!(clock.now_ms(), 15);
        clock.set(100);
        assert_eq!(clock.now_ms(), 100);
    }
}
