//! Reconnection delay policy (pure state, no I/O)

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Behavior once a failed attempt was already waiting the maximum delay
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AtMaxPolicy {
    /// Start over from the initial delay
    #[default]
    Reset,
    /// Keep retrying at the maximum delay
    Plateau,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub at_max: AtMaxPolicy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(1_800_000),
            at_max: AtMaxPolicy::Reset,
        }
    }
}

/// Exponential backoff whose current delay stays within
/// `[initial_delay, max_delay]`
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: ReconnectConfig,
    current: Duration,
}

impl ReconnectBackoff {
    /// `max_delay` below `initial_delay` is raised to `initial_delay`
    pub fn new(mut config: ReconnectConfig) -> Self {
        config.max_delay = config.max_delay.max(config.initial_delay);
        Self {
            current: config.initial_delay,
            config,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Back to the initial delay after a successful connection
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }

    /// Advance after a failed retry and return the next delay to wait
    pub fn on_retry_failed(&mut self) -> Duration {
        self.current = if self.current >= self.config.max_delay {
            match self.config.at_max {
                AtMaxPolicy::Reset => {
                    info!("Max attempts reached. Resetting reconnection delay.");
                    self.config.initial_delay
                }
                AtMaxPolicy::Plateau => self.config.max_delay,
            }
        } else {
            self.current.saturating_mul(2).min(self.config.max_delay)
        };
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn backoff(initial_ms: u64, max_ms: u64, at_max: AtMaxPolicy) -> ReconnectBackoff {
        ReconnectBackoff::new(ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            at_max,
        })
    }

    #[test]
    fn test_default_delays() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30 * 60));
        assert_eq!(config.at_max, AtMaxPolicy::Reset);
    }

    #[test]
    fn test_doubles_until_cap() {
        let mut b = backoff(1_000, 5_000, AtMaxPolicy::Reset);
        assert_eq!(b.current(), Duration::from_millis(1_000));
        assert_eq!(b.on_retry_failed(), Duration::from_millis(2_000));
        assert_eq!(b.on_retry_failed(), Duration::from_millis(4_000));
        assert_eq!(b.on_retry_failed(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_reset_policy_wraps_after_max() {
        let mut b = backoff(1_000, 4_000, AtMaxPolicy::Reset);
        b.on_retry_failed();
        b.on_retry_failed();
        assert_eq!(b.current(), Duration::from_millis(4_000));

        assert_eq!(b.on_retry_failed(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_plateau_policy_stays_at_max() {
        let mut b = backoff(1_000, 4_000, AtMaxPolicy::Plateau);
        b.on_retry_failed();
        b.on_retry_failed();

        assert_eq!(b.on_retry_failed(), Duration::from_millis(4_000));
        assert_eq!(b.on_retry_failed(), Duration::from_millis(4_000));
    }

    #[test]
    fn test_reset_after_success() {
        let mut b = backoff(500, 10_000, AtMaxPolicy::Reset);
        b.on_retry_failed();
        b.on_retry_failed();
        b.reset();
        assert_eq!(b.current(), Duration::from_millis(500));
    }

    #[test]
    fn test_max_below_initial_is_clamped() {
        let b = backoff(2_000, 1_000, AtMaxPolicy::Reset);
        assert_eq!(b.config().max_delay, Duration::from_millis(2_000));
    }

    #[test]
    fn test_at_max_policy_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            at_max: AtMaxPolicy,
        }
        let w: Wrapper = toml::from_str("at_max = \"plateau\"").unwrap();
        assert_eq!(w.at_max, AtMaxPolicy::Plateau);
    }

    proptest! {
        #[test]
        fn prop_delay_stays_within_bounds(
            initial in 1u64..10_000,
            factor in 1u64..64,
            failures in 0usize..200,
            plateau in any::<bool>(),
        ) {
            let policy = if plateau { AtMaxPolicy::Plateau } else { AtMaxPolicy::Reset };
            let mut b = backoff(initial, initial * factor, policy);
            for _ in 0..failures {
                let delay = b.on_retry_failed();
                prop_assert!(delay >= Duration::from_millis(initial));
                prop_assert!(delay <= Duration::from_millis(initial * factor));
            }
        }

        #[test]
        fn prop_failure_at_max_resets(initial in 1u64..10_000, factor in 1u64..64) {
            let mut b = backoff(initial, initial * factor, AtMaxPolicy::Reset);
            while b.current() < Duration::from_millis(initial * factor) {
                b.on_retry_failed();
            }
            prop_assert_eq!(b.on_retry_failed(), Duration::from_millis(initial));
        }
    }
}
