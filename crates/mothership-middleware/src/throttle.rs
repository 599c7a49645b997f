//! Inbound message throttling for a single agent connection.
//!
//! Heartbeats and reports arrive over a long-lived socket, so the server keeps
//! one [`InboundThrottle`] per connection and drops frames past the quota
//! instead of letting a misbehaving agent starve the orchestrator.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct InboundThrottle {
    limiter: DirectRateLimiter,
}

impl InboundThrottle {
    /// `per_second` sustained messages with bursts of up to `burst`. Zero
    /// values are raised to one.
    pub fn new(per_second: u32, burst: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: RateLimiter::direct(quota),
        }
    }

    /// `true` when the next frame may be processed.
    pub fn allow(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl Default for InboundThrottle {
    fn default() -> Self {
        Self::new(20, 40)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_rejects() {
        let throttle = InboundThrottle::new(1, 3);
        assert!(throttle.allow());
        assert!(throttle.allow());
        assert!(throttle.allow());
        assert!(!throttle.allow());
    }

    #[test]
    fn zero_quota_still_admits_one() {
        let throttle = InboundThrottle::new(0, 0);
        assert!(throttle.allow());
    }
}
