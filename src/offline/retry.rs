//! # Retry Logic and Backoff Strategies
//!
//! Decides what happens to a queued operation after a failed delivery
//! attempt: back off and try again, or give up permanently.
//!
//! ## Features
//!
//! - **Backoff Table**: Delay indexed by retry count (1s, 5s, 15s, 30s, 60s by default)
//! - **Exponential Backoff**: Doubling delay capped at a maximum
//! - **Max Retries**: Items are exhausted once `retry_count >= max_retries`
//!
//! ## Usage
//!
//! ```rust
//! use schedsync::offline::retry::{BackoffStrategy, FailureOutcome, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(3, BackoffStrategy::default());
//! assert_eq!(policy.outcome(1), FailureOutcome::Retry { delay: Duration::from_secs(1) });
//! assert_eq!(policy.outcome(3), FailureOutcome::Exhausted);
//! ```

use crate::shared::config::{QueueConfig, DEFAULT_BACKOFF_TABLE};
use std::time::Duration;

/// Backoff strategy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed interval between retries
    Fixed {
        /// Delay between attempts
        interval: Duration,
    },
    /// Doubling delay starting at `base`, capped at `max`
    Exponential {
        /// First delay
        base: Duration,
        /// Upper bound
        max: Duration,
    },
    /// Explicit delay per retry count; the last entry repeats
    Table(Vec<Duration>),
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Table(DEFAULT_BACKOFF_TABLE.to_vec())
    }
}

impl BackoffStrategy {
    /// Delay before the next attempt of an item that has failed
    /// `retry_count` times (1-based)
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let index = retry_count.saturating_sub(1);
        match self {
            BackoffStrategy::Fixed { interval } => *interval,
            BackoffStrategy::Exponential { base, max } => base
                .checked_mul(2u32.saturating_pow(index))
                .unwrap_or(*max)
                .min(*max),
            BackoffStrategy::Table(table) => {
                let last = table.len().saturating_sub(1);
                table
                    .get((index as usize).min(last))
                    .copied()
                    .unwrap_or(Duration::ZERO)
            }
        }
    }
}

/// What the queue does with an item after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Item went back to `pending`, available again after `delay`
    Retry {
        /// Backoff before the item can be claimed again
        delay: Duration,
    },
    /// Retries exhausted, item is permanently `failed`
    Exhausted,
}

/// Retry budget plus backoff strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures tolerated before an item is exhausted
    pub max_retries: u32,
    /// Backoff strategy between attempts
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Outcome for an item whose retry count has just been incremented to
    /// `retry_count`
    pub fn outcome(&self, retry_count: u32) -> FailureOutcome {
        Self::outcome_with(retry_count, self.max_retries, &self.backoff)
    }

    /// Same as [`outcome`](Self::outcome) with a per-item retry budget
    pub fn outcome_with(
        retry_count: u32,
        max_retries: u32,
        backoff: &BackoffStrategy,
    ) -> FailureOutcome {
        if retry_count >= max_retries {
            FailureOutcome::Exhausted
        } else {
            FailureOutcome::Retry {
                delay: backoff.delay_for(retry_count),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self::new(config.max_retries, BackoffStrategy::Table(config.backoff_table.clone()))
    }
}
