//! Shrinking time budget shared by all attempts of one action.

use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::error::FenceError;

/// Fraction of the original timeout after which no new attempt is started.
const RETRY_WINDOW: f64 = 0.7;

/// Tracks attempts and the time left for an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    total: Duration,
    remaining: Duration,
    tries: u32,
    max_tries: u32,
    started: Option<Instant>,
}

impl RetryBudget {
    pub fn new(total: Duration, max_tries: u32) -> Self {
        Self {
            total,
            remaining: total,
            tries: 0,
            max_tries,
            started: None,
        }
    }

    /// Record the start of an attempt and return its 1-based number.
    pub fn begin_attempt(&mut self, now: Instant) -> u32 {
        if self.tries == 0 {
            self.started = Some(now);
        }
        self.tries += 1;
        self.tries
    }

    /// Recompute the budget after a failed attempt.
    ///
    /// Returns `true` when another attempt may be started. The remaining time
    /// only becomes `total - elapsed` while fewer than 70% of the original
    /// timeout has elapsed, attempts are left, and the failure was not our own
    /// escalation timeout; otherwise it drops to zero and stays there.
    pub fn update_after_failure(&mut self, now: Instant, last_error: &FenceError) -> bool {
        let elapsed = self
            .started
            .map_or(Duration::ZERO, |started| now.saturating_duration_since(started));
        self.update_with_elapsed(elapsed, last_error)
    }

    /// Same as [`update_after_failure`](Self::update_after_failure) with an explicit elapsed time.
    pub fn update_with_elapsed(&mut self, elapsed: Duration, last_error: &FenceError) -> bool {
        if self.tries >= self.max_tries {
            info!(
                tries = self.tries,
                max = self.max_tries,
                "Agent executed the maximum number of times allowed"
            );
            self.remaining = Duration::ZERO;
        } else if *last_error != FenceError::TimedOut
            && elapsed.as_secs_f64() < self.total.as_secs_f64() * RETRY_WINDOW
        {
            self.remaining = self.remaining.min(self.total.saturating_sub(elapsed));
        } else {
            self.remaining = Duration::ZERO;
        }
        !self.remaining.is_zero()
    }

    /// Time left for the next attempt.
    pub const fn remaining(&self) -> Duration {
        self.remaining
    }

    /// Original timeout.
    pub const fn total(&self) -> Duration {
        self.total
    }

    /// Attempts started so far.
    pub const fn tries(&self) -> u32 {
        self.tries
    }

    /// Maximum number of attempts.
    pub const fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Whether the next attempt is a retry.
    pub const fn is_retry(&self) -> bool {
        self.tries > 0
    }
}
