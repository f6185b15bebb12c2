//! # Retry Policy
//!
//! Decides whether a failed push is retried and when.
//!
//! ## Retry Schedule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  attempt:   1 ──fail──► 2 ──fail──► 3 ──fail──► Abandon                │
//! │                 delay       delay                                       │
//! │                                                                         │
//! │  Fixed:        delay, delay, ...                                        │
//! │  Exponential:  delay, 2·delay, 4·delay, ... capped at max_delay        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `max_attempts` counts push attempts: with the default of 3 an action
//! that always fails is pushed three times and then abandoned.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_MS};

/// Spacing between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Exponential {
        #[serde(with = "millis")]
        max_delay: Duration,
    },
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep the action; do not push it again before this instant.
    RetryAt(DateTime<Utc>),
    /// The ceiling is reached; drop the action.
    Abandon,
}

/// Retry ceiling and spacing for queued pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub delay: Duration,
    #[serde(default)]
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::fixed(
            DEFAULT_MAX_ATTEMPTS,
            Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        )
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            delay,
            strategy: BackoffStrategy::Exponential { max_delay },
        }
    }

    /// Delay after the `failures`-th failed attempt (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential { max_delay } => {
                let shift = failures.saturating_sub(1).min(31);
                self.delay
                    .checked_mul(1u32 << shift)
                    .map_or(max_delay, |d| d.min(max_delay))
            }
        }
    }

    /// Decision after `failures` failed attempts, made at `now`.
    pub fn decide(&self, failures: u32, now: DateTime<Utc>) -> RetryDecision {
        if failures >= self.max_attempts {
            return RetryDecision::Abandon;
        }

        let delay = self.delay_for(failures);
        let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        match now.checked_add_signed(chrono::Duration::milliseconds(millis)) {
            Some(at) => RetryDecision::RetryAt(at),
            None => RetryDecision::Abandon,
        }
    }
}

/// Serde helper: `Duration` as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
