//! Retry policy for chunk-list fetches.
//!
//! A [`RetryPolicy`] bounds how many times a single fetch position is retried
//! and how long to wait between attempts. The budget is per fetch position:
//! the donkey pipeline starts every new position with a fresh counter.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use snapfetch::retry::RetryPolicy;
//!
//! let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
//! assert_eq!(policy.max_retries(), 3);
//! assert_eq!(policy.delay_for_retry(3), Some(Duration::from_millis(500)));
//! assert_eq!(policy.delay_for_retry(4), None);
//! ```

use std::time::Duration;

// =============================================================================
// Retry Policy Constants
// =============================================================================

/// Default number of retries per fetch position.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between fetch retries (1 second).
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Default maximum delay for exponential backoff (30 seconds).
pub const DEFAULT_MAX_DELAY_SECS: u64 = 30;

/// Default multiplier for exponential backoff.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// How a fetch handles transient failures.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryPolicy {
    /// No retries - the first transient failure aborts the chunk list.
    None,

    /// Fixed number of retries with constant delay between attempts.
    Fixed {
        /// Retries allowed after the initial attempt.
        max_retries: u32,
        /// Delay before each retry.
        delay: Duration,
    },

    /// Exponential backoff.
    ///
    /// The delay grows by `multiplier` after each failed attempt, capped at
    /// `max_delay`.
    ExponentialBackoff {
        /// Retries allowed after the initial attempt.
        max_retries: u32,
        /// Delay before the first retry.
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
        /// Multiplier applied to the delay after each failure.
        multiplier: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(
            DEFAULT_MAX_RETRIES,
            Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        )
    }
}

impl RetryPolicy {
    /// Creates a fixed retry policy.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::Fixed { max_retries, delay }
    }

    /// Creates an exponential backoff policy starting at `initial_delay`.
    ///
    /// Uses a 30 second cap ([`DEFAULT_MAX_DELAY_SECS`]) and a multiplier of
    /// 2.0 ([`DEFAULT_BACKOFF_MULTIPLIER`]).
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        Self::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Calculates the delay before a given retry.
    ///
    /// # Arguments
    ///
    /// * `retry` - The retry number (1-based, where 1 is the first retry)
    ///
    /// # Returns
    ///
    /// The delay to wait, or `None` if the retry exceeds the budget.
    pub fn delay_for_retry(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries() {
            return None;
        }
        match self {
            Self::None => None,
            Self::Fixed { delay, .. } => Some(*delay),
            Self::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let factor = multiplier.powi((retry - 1) as i32);
                let delay_ms = initial_delay.as_millis() as f64 * factor;
                let capped = delay_ms.min(max_delay.as_millis() as f64) as u64;
                Some(Duration::from_millis(capped).min(*max_delay))
            }
        }
    }

    /// Retries allowed after the initial attempt.
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_retries, .. } => *max_retries,
            Self::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }
}
