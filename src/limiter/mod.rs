//! Admission control for the classifier: token bucket + circuit breaker.
//!
//! Closed: each call takes a token. With no token available the caller waits
//! in a bounded FIFO queue and is served as tokens refill, or dropped as
//! timed out once it has waited `request_timeout`. Open: calls are rejected
//! immediately without touching the bucket. HalfOpen: at most
//! `half_open_max_calls` trial calls are in flight at once.
//!
//! [`RateLimiter::admit`] hands out an [`Admission`] that reports the
//! outcome of the protected call. Dropping it unreported gives its half-open
//! trial slot back, so a cancelled caller cannot wedge the breaker.
//! [`RateLimiter::acquire`] leaves reporting to the caller through
//! [`RateLimiter::record_success`] and [`RateLimiter::record_failure`].
//! State changes are published on the [`EventBus`].
//!
//! Queued callers drive refill themselves: each one sleeps until the next
//! token is due and then services the queue head-first, so no background
//! task is needed and FIFO order holds.

mod breaker;
mod bucket;

pub use breaker::{CircuitState, Transition};

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::event::{EventBus, EventKind};
use crate::telemetry::metrics;
use breaker::{BreakerSettings, CircuitBreaker};
use bucket::TokenBucket;

/// Runtime-updatable limiter configuration.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub tokens_per_second: f64,
    pub bucket_capacity: f64,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub recovery_timeout: Duration,
    /// Concurrent trial calls allowed while half-open.
    pub half_open_max_calls: u32,
    /// Consecutive half-open successes needed to close.
    pub success_threshold: u32,
    /// Waiting callers beyond this are rejected.
    pub max_queue_size: usize,
    /// How long a caller may wait for a token.
    pub request_timeout: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 10.0,
            bucket_capacity: 20.0,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            success_threshold: 2,
            max_queue_size: 100,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Slowest refill accepted. Anything slower is indistinguishable from a
/// stopped bucket and overflows wait-time arithmetic.
pub const MIN_TOKENS_PER_SECOND: f64 = 1e-3;

impl LimiterConfig {
    /// Reject limits that would never admit a call.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !self.tokens_per_second.is_finite() || self.tokens_per_second < MIN_TOKENS_PER_SECOND {
            return Err(crate::error::Error::Config(format!(
                "token rate must be at least {MIN_TOKENS_PER_SECOND} per second, got {}",
                self.tokens_per_second
            )));
        }
        if !self.bucket_capacity.is_finite() || self.bucket_capacity < 1.0 {
            return Err(crate::error::Error::Config(format!(
                "bucket capacity must be at least 1, got {}",
                self.bucket_capacity
            )));
        }
        Ok(())
    }

    fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout,
            half_open_max_calls: self.half_open_max_calls,
            success_threshold: self.success_threshold,
        }
    }
}

/// Why a call was not admitted. These are expected degraded-mode signals,
/// not failures of the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("circuit open")]
    CircuitOpen,
    #[error("half-open trial slots exhausted")]
    HalfOpenSaturated,
    #[error("admission queue full")]
    QueueFull,
    #[error("no tokens available")]
    NoTokens,
    #[error("timed out waiting for a token")]
    TimedOut,
}

/// Error from [`RateLimiter::call`].
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error("not admitted: {0}")]
    Rejected(AdmissionError),
    #[error("call failed: {0}")]
    Failed(E),
}

/// Point-in-time limiter statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterMetrics {
    pub tokens_available: f64,
    pub bucket_capacity: f64,
    pub accepted: u64,
    pub rejected: u64,
    /// Callers currently waiting for a token.
    pub queued: usize,
    /// Callers that ever had to wait.
    pub queued_total: u64,
    pub timed_out: u64,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub avg_queue_wait_ms: f64,
    /// Admitted calls per second since the limiter was created.
    pub throughput_per_sec: f64,
}

type Grant = Result<(), AdmissionError>;

/// One admitted call. Report its outcome with [`Admission::success`] or
/// [`Admission::failure`]; dropping it unreported frees any half-open trial
/// slot it holds without counting for or against the circuit.
#[must_use = "dropping an admission abandons the call"]
pub struct Admission<'a> {
    limiter: &'a RateLimiter,
    settled: bool,
}

impl Admission<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.limiter.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.limiter.record_failure();
    }

    /// Leave outcome reporting to the caller.
    pub fn forget(mut self) {
        self.settled = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.limiter.abandon();
        }
    }
}

/// A queued caller. Dropping it before it resolves leaves the queue, or
/// hands back a grant that arrived too late to be seen.
struct Queued<'a> {
    limiter: &'a RateLimiter,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    resolved: bool,
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let still_queued = {
            let mut st = self.limiter.lock();
            match st.queue.iter().position(|w| w.id == self.id) {
                Some(pos) => {
                    st.queue.remove(pos);
                    true
                }
                None => false,
            }
        };
        if !still_queued && matches!(self.rx.try_recv(), Ok(Ok(()))) {
            self.limiter.abandon();
        }
    }
}

struct Waiter {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Grant>,
}

struct State {
    config: LimiterConfig,
    bucket: TokenBucket,
    breaker: CircuitBreaker,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
    accepted: u64,
    rejected: u64,
    queued_total: u64,
    timed_out: u64,
    total_wait: Duration,
    waited: u64,
    started_at: Instant,
}

impl State {
    /// Refill, advance the breaker clock, and hand tokens to waiters in order.
    fn service(&mut self, now: Instant, transitions: &mut Vec<Transition>) {
        self.bucket.refill(now);
        transitions.extend(self.breaker.poll(now));

        if self.breaker.state() == CircuitState::Open {
            self.reject_all_waiting(AdmissionError::CircuitOpen);
            return;
        }

        while let Some(front) = self.queue.front() {
            if now.saturating_duration_since(front.enqueued_at) >= self.config.request_timeout {
                if let Some(expired) = self.queue.pop_front() {
                    self.timed_out += 1;
                    let _ = expired.tx.send(Err(AdmissionError::TimedOut));
                }
                continue;
            }
            if !self.breaker.trial_available() || !self.bucket.try_take() {
                break;
            }
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            if waiter.tx.send(Ok(())).is_ok() {
                self.accepted += 1;
                self.breaker.on_admit();
                self.total_wait += now.saturating_duration_since(waiter.enqueued_at);
                self.waited += 1;
            } else {
                // Caller gave up (its future was dropped).
                self.bucket.refund();
            }
        }
    }

    fn reject_all_waiting(&mut self, reason: AdmissionError) {
        for waiter in self.queue.drain(..) {
            self.rejected += 1;
            let _ = waiter.tx.send(Err(reason));
        }
    }

    /// When the head of the queue could next be served. `None` while all
    /// half-open trial slots are taken; reported outcomes service the queue.
    fn next_wake(&self, now: Instant) -> Option<Instant> {
        if !self.breaker.trial_available() {
            return None;
        }
        self.bucket.time_to_next().map(|d| now + d)
    }
}

/// Token-bucket limiter with an embedded circuit breaker.
pub struct RateLimiter {
    state: Mutex<State>,
    events: EventBus,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self::with_events(config, EventBus::default())
    }

    pub fn with_events(config: LimiterConfig, events: EventBus) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(State {
                bucket: TokenBucket::new(config.bucket_capacity, config.tokens_per_second, now),
                breaker: CircuitBreaker::new(config.breaker_settings()),
                config,
                queue: VecDeque::new(),
                next_waiter_id: 0,
                accepted: 0,
                rejected: 0,
                queued_total: 0,
                timed_out: 0,
                total_wait: Duration::ZERO,
                waited: 0,
                started_at: now,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, transitions: Vec<Transition>) {
        for Transition { from, to } in transitions {
            match to {
                CircuitState::Open => warn!(%from, %to, "circuit breaker opened"),
                _ => info!(%from, %to, "circuit breaker transition"),
            }
            metrics::circuit_transitions().add(
                1,
                &[
                    KeyValue::new("from", from.to_string()),
                    KeyValue::new("to", to.to_string()),
                ],
            );
            self.events.publish(EventKind::CircuitTransition { from, to });
        }
    }

    fn record_admission(result: &'static str) {
        metrics::admission_decisions().add(1, &[KeyValue::new("result", result)]);
    }

    /// Current breaker state, advancing Open → HalfOpen if the recovery
    /// timeout has passed.
    pub fn circuit_state(&self) -> CircuitState {
        let mut transitions = Vec::new();
        let state = {
            let mut st = self.lock();
            transitions.extend(st.breaker.poll(Instant::now()));
            st.breaker.state()
        };
        self.publish(transitions);
        state
    }

    /// Take a token without waiting. Outcomes are reported by the caller.
    pub fn try_acquire(&self) -> Result<(), AdmissionError> {
        self.try_admit().map(Admission::forget)
    }

    /// Take a token without waiting.
    pub fn try_admit(&self) -> Result<Admission<'_>, AdmissionError> {
        let mut transitions = Vec::new();
        let result = {
            let mut st = self.lock();
            let now = Instant::now();
            st.service(now, &mut transitions);
            Self::admit_now(&mut st).and_then(|admitted| {
                if admitted {
                    Ok(())
                } else {
                    st.rejected += 1;
                    Err(AdmissionError::NoTokens)
                }
            })
        };
        self.publish(transitions);
        Self::record_admission(if result.is_ok() { "accepted" } else { "rejected" });
        result.map(|()| self.admission())
    }

    fn admission(&self) -> Admission<'_> {
        Admission {
            limiter: self,
            settled: false,
        }
    }

    /// Gate checks shared by both acquire paths. `Ok(false)` means the caller
    /// has to queue.
    fn admit_now(st: &mut State) -> Result<bool, AdmissionError> {
        match st.breaker.state() {
            CircuitState::Open => {
                st.rejected += 1;
                return Err(AdmissionError::CircuitOpen);
            }
            CircuitState::HalfOpen if !st.breaker.trial_available() => {
                st.rejected += 1;
                return Err(AdmissionError::HalfOpenSaturated);
            }
            _ => {}
        }
        if st.queue.is_empty() && st.bucket.try_take() {
            st.accepted += 1;
            st.breaker.on_admit();
            return Ok(true);
        }
        Ok(false)
    }

    /// Wait for admission. Outcomes are reported by the caller.
    pub async fn acquire(&self) -> Result<(), AdmissionError> {
        self.admit().await.map(Admission::forget)
    }

    /// Wait for admission. Resolves within `request_timeout` at the latest.
    pub async fn admit(&self) -> Result<Admission<'_>, AdmissionError> {
        let mut transitions = Vec::new();
        let enqueued = {
            let mut st = self.lock();
            let now = Instant::now();
            st.service(now, &mut transitions);
            match Self::admit_now(&mut st) {
                Ok(true) => Ok(None),
                Err(e) => Err(e),
                Ok(false) if st.queue.len() >= st.config.max_queue_size => {
                    st.rejected += 1;
                    Err(AdmissionError::QueueFull)
                }
                Ok(false) => {
                    let (tx, rx) = oneshot::channel();
                    st.next_waiter_id += 1;
                    let id = st.next_waiter_id;
                    st.queue.push_back(Waiter {
                        id,
                        enqueued_at: now,
                        tx,
                    });
                    st.queued_total += 1;
                    Ok(Some((id, rx, now + st.config.request_timeout)))
                }
            }
        };
        self.publish(transitions);

        let (id, rx, deadline) = match enqueued {
            Ok(None) => {
                Self::record_admission("accepted");
                return Ok(self.admission());
            }
            Ok(Some(waiting)) => waiting,
            Err(e) => {
                Self::record_admission("rejected");
                return Err(e);
            }
        };

        let mut queued = Queued {
            limiter: self,
            id,
            rx,
            resolved: false,
        };

        let result = loop {
            let wake = {
                let st = self.lock();
                st.next_wake(Instant::now())
                    .map_or(deadline, |w| w.min(deadline))
            };

            tokio::select! {
                biased;
                grant = &mut queued.rx => break grant.unwrap_or(Err(AdmissionError::TimedOut)),
                _ = tokio::time::sleep_until(wake) => {
                    let mut transitions = Vec::new();
                    let expired = {
                        let mut st = self.lock();
                        let now = Instant::now();
                        st.service(now, &mut transitions);
                        if now >= deadline {
                            // Still waiting means nobody served us: we time out.
                            if let Some(pos) = st.queue.iter().position(|w| w.id == id) {
                                st.queue.remove(pos);
                                st.timed_out += 1;
                                true
                            } else {
                                false
                            }
                        } else {
                            false
                        }
                    };
                    self.publish(transitions);
                    if expired {
                        break Err(AdmissionError::TimedOut);
                    }
                }
            }
        };

        queued.resolved = true;

        Self::record_admission(match result {
            Ok(()) => "accepted",
            Err(AdmissionError::TimedOut) => "timed_out",
            Err(_) => "rejected",
        });
        result.map(|()| self.admission())
    }

    /// Report a successful protected call.
    pub fn record_success(&self) {
        let mut transitions = Vec::new();
        {
            let mut st = self.lock();
            transitions.extend(st.breaker.on_success());
            st.service(Instant::now(), &mut transitions);
        }
        self.publish(transitions);
    }

    /// Report a failed protected call. Opening the circuit rejects everyone
    /// still waiting in the queue.
    pub fn record_failure(&self) {
        let mut transitions = Vec::new();
        {
            let mut st = self.lock();
            let now = Instant::now();
            transitions.extend(st.breaker.on_failure(now));
            st.service(now, &mut transitions);
        }
        self.publish(transitions);
    }

    /// An admitted call went away without an outcome.
    fn abandon(&self) {
        let mut transitions = Vec::new();
        {
            let mut st = self.lock();
            st.breaker.on_abandon();
            st.service(Instant::now(), &mut transitions);
        }
        self.publish(transitions);
    }

    /// Admit, run `f`, and report its outcome to the breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().await.map_err(CallError::Rejected)?;
        match f().await {
            Ok(value) => {
                admission.success();
                Ok(value)
            }
            Err(e) => {
                admission.failure();
                Err(CallError::Failed(e))
            }
        }
    }

    /// Swap in new limits without restarting. Breaker state is kept. Invalid
    /// limits are refused and the current ones stay in force.
    pub fn update_config(&self, config: LimiterConfig) -> crate::error::Result<()> {
        config.validate()?;
        let mut st = self.lock();
        let now = Instant::now();
        st.bucket
            .reconfigure(config.bucket_capacity, config.tokens_per_second, now);
        st.breaker.settings = config.breaker_settings();
        info!(
            tokens_per_second = config.tokens_per_second,
            bucket_capacity = config.bucket_capacity,
            failure_threshold = config.failure_threshold,
            "rate limiter reconfigured"
        );
        st.config = config;
        Ok(())
    }

    pub fn config(&self) -> LimiterConfig {
        self.lock().config.clone()
    }

    /// Force the circuit closed (operator override).
    pub fn reset_circuit(&self) {
        let transition = self.lock().breaker.reset();
        self.publish(transition.into_iter().collect());
    }

    pub fn metrics(&self) -> LimiterMetrics {
        let mut st = self.lock();
        let now = Instant::now();
        st.bucket.refill(now);
        let elapsed = now.saturating_duration_since(st.started_at).as_secs_f64();
        LimiterMetrics {
            tokens_available: st.bucket.available(),
            bucket_capacity: st.bucket.capacity(),
            accepted: st.accepted,
            rejected: st.rejected,
            queued: st.queue.len(),
            queued_total: st.queued_total,
            timed_out: st.timed_out,
            circuit_state: st.breaker.state(),
            failure_count: st.breaker.failure_count(),
            avg_queue_wait_ms: if st.waited == 0 {
                0.0
            } else {
                st.total_wait.as_secs_f64() * 1000.0 / st.waited as f64
            },
            throughput_per_sec: if elapsed > 0.0 {
                st.accepted as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}
