use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Paces requests to the photo search service. Callers wait rather than fail.
#[derive(Clone)]
pub struct OutboundLimiter {
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl OutboundLimiter {
    pub fn new(requests: u32, window: Duration) -> Self {
        let burst = NonZeroU32::new(requests).unwrap_or(nonzero!(1u32));
        let period = window.max(Duration::from_millis(1)) / burst.get();
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Effectively unlimited, for tests and local fakes.
    pub fn unlimited() -> Self {
        Self::new(u32::MAX, Duration::from_secs(1))
    }

    pub async fn acquire(&self) {
        if self.limiter.check().is_err() {
            debug!("Outbound rate limit reached, waiting for capacity");
            self.limiter.until_ready().await;
        }
    }
}
