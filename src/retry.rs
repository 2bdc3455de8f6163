//! Reconnect retry policies.
//!
//! A policy maps the reconnect attempt counter (0-indexed, reset on every
//! successful connect) to the delay before the next attempt, or `None` to give
//! up. Policies are stateless; the connection owns the counter.

// Rust guideline compliant 2026-02

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempt-indexed reconnect delay function.
pub trait RetryPolicy: Send + Sync + Debug {
    /// Delay before reconnect attempt `attempt`, or `None` to stop retrying.
    fn next_retry_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Fixed ladder for the first attempts, then a constant ceiling forever.
///
/// Never returns `None`: reconnection continues until the caller stops the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    ladder: Vec<Duration>,
    ceiling: Duration,
}

impl ExponentialBackoff {
    /// Ladder entries above `ceiling` are capped to it.
    #[must_use]
    pub fn new(ladder: Vec<Duration>, ceiling: Duration) -> Self {
        Self { ladder, ceiling }
    }
}

impl Default for ExponentialBackoff {
    /// Immediate, 2 s, 10 s, 30 s, then every 60 s.
    fn default() -> Self {
        Self::new(
            vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            Duration::from_secs(60),
        )
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_retry_delay(&self, attempt: u32) -> Option<Duration> {
        let delay = self
            .ladder
            .get(attempt as usize)
            .copied()
            .unwrap_or(self.ceiling);
        Some(delay.min(self.ceiling))
    }
}

/// Constant delay for a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedInterval {
    interval: Duration,
    max_retries: u32,
}

impl FixedInterval {
    /// Retry every `interval`, at most `max_retries` times.
    #[must_use]
    pub fn new(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
        }
    }
}

impl RetryPolicy for FixedInterval {
    fn next_retry_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_retries).then_some(self.interval)
    }
}

/// Single connection attempt, no reconnection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_retry_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Caller-supplied delay list.
///
/// Once the list is exhausted it either stops or keeps repeating its last
/// entry, depending on `repeat_last`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomLadder {
    delays: Vec<Duration>,
    repeat_last: bool,
}

impl CustomLadder {
    /// An empty `delays` list never retries, whatever `repeat_last` says.
    #[must_use]
    pub fn new(delays: Vec<Duration>, repeat_last: bool) -> Self {
        Self {
            delays,
            repeat_last,
        }
    }
}

impl RetryPolicy for CustomLadder {
    fn next_retry_delay(&self, attempt: u32) -> Option<Duration> {
        match self.delays.get(attempt as usize) {
            Some(delay) => Some(*delay),
            None if self.repeat_last => self.delays.last().copied(),
            None => None,
        }
    }
}

/// Serializable policy description, as found in config files.
///
/// Durations are milliseconds.
///
/// ```json
/// {"kind": "fixed", "interval_ms": 5000, "max_retries": 3}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryConfig {
    /// [`ExponentialBackoff`].
    Exponential {
        /// Delays for the first attempts.
        ladder_ms: Vec<u64>,
        /// Delay for every later attempt.
        ceiling_ms: u64,
    },
    /// [`FixedInterval`].
    Fixed {
        /// Delay between attempts.
        interval_ms: u64,
        /// Attempt limit.
        max_retries: u32,
    },
    /// [`NoRetry`].
    None,
    /// [`CustomLadder`].
    Custom {
        /// Explicit delays.
        delays_ms: Vec<u64>,
        /// Repeat the final delay forever.
        #[serde(default)]
        repeat_last: bool,
    },
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::Exponential {
            ladder_ms: vec![0, 2_000, 10_000, 30_000],
            ceiling_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Build the policy this description names.
    #[must_use]
    pub fn build(&self) -> Arc<dyn RetryPolicy> {
        match self {
            Self::Exponential {
                ladder_ms,
                ceiling_ms,
            } => Arc::new(ExponentialBackoff::new(
                millis(ladder_ms),
                Duration::from_millis(*ceiling_ms),
            )),
            Self::Fixed {
                interval_ms,
                max_retries,
            } => Arc::new(FixedInterval::new(
                Duration::from_millis(*interval_ms),
                *max_retries,
            )),
            Self::None => Arc::new(NoRetry),
            Self::Custom {
                delays_ms,
                repeat_last,
            } => Arc::new(CustomLadder::new(millis(delays_ms), *repeat_last)),
        }
    }
}

fn millis(values: &[u64]) -> Vec<Duration> {
    values.iter().copied().map(Duration::from_millis).collect()
}
