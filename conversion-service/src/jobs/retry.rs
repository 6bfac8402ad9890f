//! Backoff between automatic retries.

use std::time::Duration;

use crate::config::{JobsConfig, RetryBackoff};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: RetryBackoff,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            backoff: config.retry_backoff,
            base_delay: config.retry_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    #[cfg(test)]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff: RetryBackoff::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// Delay before retry number `retry` (1-based), capped at `max_delay`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = match self.backoff {
            RetryBackoff::Fixed => self.base_delay,
            RetryBackoff::Exponential => {
                let exponent = retry.saturating_sub(1).min(31);
                self.base_delay.saturating_mul(1u32 << exponent)
            }
        };
        delay.min(self.max_delay.max(self.base_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(3), Duration::from_secs(30));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy {
            backoff: RetryBackoff::Exponential,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(100));
        assert_eq!(policy.delay_for(40), Duration::from_secs(100));
    }

    #[test]
    fn test_from_config_defaults() {
        let policy = RetryPolicy::from_config(&JobsConfig::default());
        assert_eq!(policy.backoff, RetryBackoff::Fixed);
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
    }
}
