use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter, clock};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::errors::BurnerError;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, clock::DefaultClock, NoOpMiddleware>;

/// Token bucket gating API dispatch: capacity `burst`, refilling at `qps`
/// tokens per second. Each job owns one; the wait engine owns a separate one
/// so readiness polling does not steal tokens from mutations.
#[derive(Clone)]
pub struct DispatchLimiter {
    limiter: Arc<DirectLimiter>,
}

impl DispatchLimiter {
    pub fn new(qps: u32, burst: u32) -> Self {
        let qps = NonZeroU32::new(qps).unwrap_or(nonzero!(1_u32));
        let burst = NonZeroU32::new(burst).unwrap_or(nonzero!(1_u32));
        let quota = Quota::per_second(qps).allow_burst(burst);
        DispatchLimiter {
            limiter: Arc::from(RateLimiter::direct(quota)),
        }
    }

    /// Suspend until a token is available or the run is cancelled.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), BurnerError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BurnerError::Cancelled),
            _ = self.limiter.until_ready() => Ok(()),
        }
    }
}
