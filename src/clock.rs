//! Monotonic millisecond clock, zero-based at process start.

use rustix::time::{clock_gettime, ClockId};

fn monotonic_ms() -> i64 {
    let ts = clock_gettime(ClockId::Monotonic);
    ts.tv_sec * 1000 + ts.tv_nsec / 1_000_000
}

/// Clock handing out milliseconds elapsed since it was created.
///
/// All scheduling deadlines in the event queue are expressed on this
/// timeline, which also becomes the timestamp domain of replayed events.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    base: i64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            base: monotonic_ms(),
        }
    }

    pub fn now(&self) -> i64 {
        monotonic_ms() - self.base
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_decreasing() {
        let clock = Clock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn starts_near_zero() {
        let clock = Clock::new();
        assert!(clock.now() < 100);
    }
}
