//! Global minimum-interval rate limiter.
//!
//! One limiter is shared by every caller; it is not keyed by client.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Accepted,
    Limited { retry_after: Duration },
}

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_accepted_at: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_accepted_at: None,
        }
    }

    /// Accepts the request and records `now`, or reports the remaining wait.
    /// Rejected requests do not move the window.
    pub fn check_and_update(&mut self, now: Instant) -> RateDecision {
        if let Some(last) = self.last_accepted_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.min_interval {
                return RateDecision::Limited {
                    retry_after: self.min_interval - elapsed,
                };
            }
        }
        self.last_accepted_at = Some(now);
        RateDecision::Accepted
    }
}
