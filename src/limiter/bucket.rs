//! Continuously refilled token bucket.

use std::time::Duration;

use tokio::time::Instant;

/// Absorbs float drift from fractional refills.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Starts full.
    pub(crate) fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            last_refill: now,
        }
    }

    pub(crate) fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    pub(crate) fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 - EPSILON {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// Give back a token taken for a caller that went away.
    pub(crate) fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    /// Time until one whole token is available, `None` if it never will be
    /// or the wait does not fit in a [`Duration`].
    pub(crate) fn time_to_next(&self) -> Option<Duration> {
        if self.tokens >= 1.0 - EPSILON {
            return Some(Duration::ZERO);
        }
        if self.refill_per_sec <= 0.0 || self.capacity < 1.0 {
            return None;
        }
        Duration::try_from_secs_f64((1.0 - self.tokens) / self.refill_per_sec).ok()
    }

    /// Apply new limits. Accrued tokens are kept but clamped to the new ceiling.
    pub(crate) fn reconfigure(&mut self, capacity: f64, refill_per_sec: f64, now: Instant) {
        self.refill(now);
        self.capacity = capacity.max(0.0);
        self.refill_per_sec = refill_per_sec.max(0.0);
        self.tokens = self.tokens.min(self.capacity);
    }

    pub(crate) fn available(&self) -> f64 {
        self.tokens
    }

    pub(crate) fn capacity(&self) -> f64 {
        self.capacity
    }
}
