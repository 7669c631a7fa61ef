//! Reconnect backoff: `min(base * 2^attempt, cap)`, bounded attempt count

use std::time::Duration;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base: config.reconnect_base,
            cap: config.reconnect_cap,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-based), saturating at the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Delay for the next retry, bumping `attempts`; `None` once the budget is spent
    pub fn next_delay(&self, attempts: &mut u32) -> Option<Duration> {
        if *attempts >= self.max_attempts {
            return None;
        }
        let delay = self.delay_for(*attempts);
        *attempts += 1;
        Some(delay)
    }
}
