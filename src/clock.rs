use std::time::{Duration, Instant};

/// A monotonic time source.
///
/// Every deadline in the crate is expressed as the `Duration` elapsed since an arbitrary epoch
/// chosen by the clock, so timeouts can be driven by a fake clock in tests.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// Clock backed by `std::time::Instant`, with its epoch at construction.
#[derive(Debug, Copy, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> MonotonicClock {
        MonotonicClock::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Duration {
        (**self).now()
    }
}
