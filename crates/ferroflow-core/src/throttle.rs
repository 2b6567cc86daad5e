use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Client-side request pacing shared by every call a connector makes.
#[derive(Clone)]
pub struct Throttle {
    limiter: Arc<DirectRateLimiter>,
}

impl Throttle {
    /// Returns `None` for a zero rate, which disables pacing.
    pub fn per_second(requests_per_second: u32) -> Option<Self> {
        let rate = NonZeroU32::new(requests_per_second)?;
        Some(Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
        })
    }

    /// Waits until the quota admits one more request.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_disables_pacing() {
        assert!(Throttle::per_second(0).is_none());
    }

    #[test]
    fn burst_is_bounded_by_quota() {
        let throttle = Throttle::per_second(2).expect("non-zero rate");

        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(!throttle.try_acquire());
    }
}
