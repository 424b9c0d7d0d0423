//! Three-state circuit breaker.
//!
//! ```text
//!            failures >= threshold
//!   Closed ──────────────────────────▶ Open
//!     ▲                                 │  recovery timeout elapsed
//!     │ successes >= success_threshold  ▼
//!     └──────────────────────────── HalfOpen ──▶ Open (any failure)
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// A state change, reported to the caller so it can be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone)]
pub(crate) struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    pub success_threshold: u32,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    pub(crate) settings: BreakerSettings,
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub(crate) fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }

    /// Move Open → HalfOpen once the recovery timeout has elapsed.
    pub(crate) fn poll(&mut self, now: Instant) -> Option<Transition> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened))
                if now.saturating_duration_since(opened) >= self.settings.recovery_timeout =>
            {
                self.half_open_successes = 0;
                self.half_open_in_flight = 0;
                Some(self.set(CircuitState::HalfOpen))
            }
            _ => None,
        }
    }

    /// Whether a trial slot is free while half-open.
    pub(crate) fn trial_available(&self) -> bool {
        self.state != CircuitState::HalfOpen
            || self.half_open_in_flight < self.settings.half_open_max_calls.max(1)
    }

    /// Record that a call was admitted.
    pub(crate) fn on_admit(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.half_open_in_flight += 1;
        }
    }

    /// An admitted call ended without an outcome. Frees its trial slot.
    pub(crate) fn on_abandon(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }

    pub(crate) fn on_success(&mut self) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                self.half_open_successes += 1;
                if self.half_open_successes >= self.settings.success_threshold.max(1) {
                    self.consecutive_failures = 0;
                    self.opened_at = None;
                    Some(self.set(CircuitState::Closed))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    pub(crate) fn on_failure(&mut self, now: Instant) -> Option<Transition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::Closed
                if self.consecutive_failures >= self.settings.failure_threshold.max(1) =>
            {
                self.opened_at = Some(now);
                Some(self.set(CircuitState::Open))
            }
            CircuitState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                self.opened_at = Some(now);
                Some(self.set(CircuitState::Open))
            }
            _ => None,
        }
    }

    /// Force the breaker closed and forget past failures.
    pub(crate) fn reset(&mut self) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.half_open_in_flight = 0;
        self.opened_at = None;
        (self.state != CircuitState::Closed).then(|| self.set(CircuitState::Closed))
    }

    fn set(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        self.state = to;
        Transition { from, to }
    }
}
