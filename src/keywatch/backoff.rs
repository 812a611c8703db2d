//! Reconnect pacing for the pub/sub listener.
//!
//! The shared store drops subscriptions on restart or failover; the
//! listener retries forever, backing off from 100 ms up to a minute.
//! Jitter keeps a fleet of proxies from reconnecting in lockstep.

use std::time::Duration;

use rand::Rng;

const MIN_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 60_000;

/// Doubling backoff, reset after every healthy subscription.
pub struct ReconnectBackoff {
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Call once the subscription is established again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next connection attempt, with up to 10% jitter.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);

        let delay = MIN_DELAY_MS
            .saturating_mul(2u64.saturating_pow(self.attempt - 1))
            .min(MAX_DELAY_MS);

        let jitter_range = delay / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };

        Duration::from_millis(delay + jitter)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}
