//! Bounded exponential backoff.
//!
//! [`Backoff`] is a plain state machine (attempt count, next delay, ceiling);
//! it never sleeps itself. The gateway asks it for the next delay and hands that
//! to a [`Sleeper`], which tests replace with a recording fake.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(*self)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self::new(
            cfg.max_attempts,
            Duration::from_millis(cfg.initial_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
        )
    }
}

/// Retry bookkeeping for one statement.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
    next_delay: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            next_delay: policy.initial_delay,
        }
    }

    /// Record that an attempt is being made.
    pub fn start_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    /// Delay to wait before the next attempt, or `None` once the attempt budget
    /// is spent. Each call doubles the following delay up to the ceiling.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let delay = self.next_delay;
        self.next_delay = self
            .next_delay
            .checked_mul(2)
            .unwrap_or(self.policy.max_delay)
            .min(self.policy.max_delay);
        Some(delay)
    }
}

/// Source of waiting for the retry loop.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Fake clock that returns immediately and remembers every requested delay.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut guard) = self.slept.lock() {
            guard.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn delays_double_up_to_ceiling() {
        let policy = RetryPolicy::new(6, ms(1000), ms(4000));
        let mut backoff = policy.backoff();
        let mut delays = Vec::new();
        loop {
            backoff.start_attempt();
            match backoff.next_delay() {
                Some(d) => delays.push(d),
                None => break,
            }
        }
        assert_eq!(delays, vec![ms(1000), ms(2000), ms(4000), ms(4000), ms(4000)]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn single_attempt_policy_never_waits() {
        let mut backoff = RetryPolicy::new(1, ms(10), ms(10)).backoff();
        backoff.start_attempt();
        assert!(backoff.exhausted());
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::new(0, ms(5), ms(1));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_delay, ms(5));
    }

    #[test]
    fn policy_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, ms(1000));
        assert_eq!(policy.max_delay, ms(16_000));
    }

    #[tokio::test]
    async fn recording_sleeper_keeps_history() {
        let sleeper = RecordingSleeper::new();
        sleeper.sleep(ms(1)).await;
        sleeper.sleep(ms(2)).await;
        assert_eq!(sleeper.delays(), vec![ms(1), ms(2)]);
    }
}
