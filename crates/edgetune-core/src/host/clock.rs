use std::time::Instant;

/// Monotonic time source.
///
/// The diagnostics service reads time only through this trait so that rate
/// limiting and cache expiry can be tested without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
