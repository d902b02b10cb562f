//! Abstract source of current wall time, injected so tests can control it.

use std::time::SystemTime;

/// A source of "now", abstracted so the engine never calls `SystemTime::now()` directly.
///
/// Mirrors the teacher's pattern of injecting collaborators (storage manager, keyer)
/// rather than reaching for ambient globals.
pub trait Clock: Send + Sync + 'static {
    /// The current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock fixed to one instant, advanceable for tests.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: std::sync::Arc<std::sync::Mutex<SystemTime>>,
}

impl FixedClock {
    /// Create a clock fixed at `at`.
    pub fn new(at: SystemTime) -> Self {
        Self { now: std::sync::Arc::new(std::sync::Mutex::new(at)) }
    }

    /// Move the clock forward by `duration`.
    pub fn advance(&self, duration: std::time::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fixed_clock_advances() {
        let start = SystemTime::UNIX_EPOCH;
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.now(), start + Duration::from_secs(30));
    }
}
