//! Backoff policy for re-establishing broker consumers after connection loss.
//!
//! A [`ReconnectPolicy`] is static configuration. Each consumption loop drives its
//! own [`Backoff`], which counts consecutive failures and forgets them once a
//! connection has stayed up for [`ReconnectPolicy::healthy_after`].

use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff strategy between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// base * 2^(failures - 1)
    #[default]
    Exponential,
    /// base * failures
    Linear,
}

/// Reconnect policy. Consumption loops retry forever; the policy only shapes the
/// delay between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    /// Cap on the nominal delay. Jitter may push a single wait slightly past it.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Random spread applied to each delay, as a fraction of it (0.0-1.0).
    pub jitter: f64,
    /// A connection that survives this long resets the failure count.
    pub healthy_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        // Settles at one attempt every 5s.
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            healthy_after: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Same delay after every failure, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
            ..Self::default()
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Delay after `failures` consecutive failures, before jitter.
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(failures),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Nominal delay spread uniformly by `jitter` in both directions.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let nominal = self.nominal_delay(failures);
        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
        nominal.mul_f64(factor)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            failures: 0,
            connected_at: None,
        }
    }
}

/// Per-loop reconnect state.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
    connected_at: Option<Instant>,
}

impl Backoff {
    /// Consecutive failures since the last healthy connection.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a successful (re)connect.
    pub fn connected(&mut self) {
        self.connected_at = Some(Instant::now());
    }

    /// Record a failure (open failed, or an established connection dropped) and
    /// return how long to wait before the next attempt.
    pub fn failed(&mut self) -> Duration {
        if let Some(since) = self.connected_at.take() {
            if since.elapsed() >= self.policy.healthy_after {
                self.failures = 0;
            }
        }
        self.failures = self.failures.saturating_add(1);
        self.policy.delay_for(self.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_jitter(policy: ReconnectPolicy) -> ReconnectPolicy {
        ReconnectPolicy { jitter: 0.0, ..policy }
    }

    #[test]
    fn fixed_policy_is_constant() {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(7), Duration::from_millis(100));
    }

    #[test]
    fn exponential_policy_grows_and_caps() {
        let policy = ReconnectPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.nominal_delay(0), Duration::ZERO);
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(100));
        assert_eq!(policy.nominal_delay(2), Duration::from_millis(200));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(400));
        assert_eq!(policy.nominal_delay(10), Duration::from_secs(1));
        assert_eq!(policy.nominal_delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn linear_policy() {
        let policy = ReconnectPolicy {
            strategy: BackoffStrategy::Linear,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(750));
        assert_eq!(policy.nominal_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn jitter_spreads_delays_within_range() {
        let policy = ReconnectPolicy::exponential(Duration::from_millis(1000), Duration::from_secs(60));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let got = policy.delay_for(2);
            assert!(got >= Duration::from_millis(1800), "{got:?}");
            assert!(got <= Duration::from_millis(2200), "{got:?}");
            seen.insert(got);
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn failures_accumulate_while_connections_are_short_lived() {
        let mut backoff = without_jitter(ReconnectPolicy::exponential(
            Duration::from_millis(10),
            Duration::from_secs(1),
        ))
        .backoff();

        assert_eq!(backoff.failed(), Duration::from_millis(10));
        backoff.connected();
        assert_eq!(backoff.failed(), Duration::from_millis(20));
        backoff.connected();
        assert_eq!(backoff.failed(), Duration::from_millis(40));
        assert_eq!(backoff.failures(), 3);
    }

    #[test]
    fn healthy_connection_resets_failures() {
        let policy = ReconnectPolicy {
            healthy_after: Duration::from_millis(20),
            ..without_jitter(ReconnectPolicy::exponential(
                Duration::from_millis(10),
                Duration::from_secs(1),
            ))
        };
        let mut backoff = policy.backoff();
        backoff.failed();
        backoff.failed();
        assert_eq!(backoff.failures(), 2);

        backoff.connected();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(backoff.failed(), Duration::from_millis(10));
        assert_eq!(backoff.failures(), 1);
    }
}
