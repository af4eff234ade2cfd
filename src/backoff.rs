//! The exponential back-off formula shared, with different defaults, by the
//! call-side retry loop (§4.4) and the dial-side reconnect loop (§4.5).
//! The two layers intentionally keep separate retry counters — this type is
//! the formula, not the state.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_delay: Duration,
}

impl BackoffConfig {
    /// Defaults for `Client::new_stream`'s call-side retry loop.
    pub fn client_default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max_delay: Duration::from_secs(120),
        }
    }

    /// Defaults for a remote client's dial-side reconnect loop.
    pub fn connect_default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max_delay: Duration::from_secs(5),
        }
    }

    /// `delay(retries) = min(MaxDelay, BaseDelay * Multiplier^retries) * (1 ± Jitter * U(-1,1))`,
    /// clamped to be non-negative. The exponent is computed iteratively so a
    /// large `retries` cannot overflow `f64` into infinity/NaN before the cap
    /// is applied.
    pub fn delay(&self, retries: u32) -> Duration {
        let mut backoff = self.base_delay.as_secs_f64();
        for _ in 0..retries {
            backoff *= self.multiplier;
            if backoff >= self.max_delay.as_secs_f64() {
                backoff = self.max_delay.as_secs_f64();
                break;
            }
        }
        let jittered = self.jittered(backoff);
        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(Duration::ZERO)
    }

    fn jittered(&self, backoff: f64) -> f64 {
        if self.jitter <= 0.0 {
            return backoff;
        }
        let spread = self.jitter * backoff;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        backoff + offset
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::client_default()
    }
}
