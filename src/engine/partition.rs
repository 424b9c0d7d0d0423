//! One partition: a priority queue, its dispatcher task, and a bounded pool
//! of job workers.
//!
//! The dispatcher holds a worker permit before it pops a job, so a job
//! leaves the queue only when it can start right away. Each worker runs
//! under a child of the partition's cancellation token.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::JobContext;
use super::priority::{PriorityQueue, Queued, priority_of};
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{Job, JobKey};
use crate::queue::{QueueBackend, Receipt, queue_name};
use crate::router::shard_of;
use crate::telemetry::job::{record_state_transition, record_verdict, start_job_span};
use crate::telemetry::metrics;

/// Completed keys remembered for duplicate suppression.
pub(crate) const RECENT_CAPACITY: usize = 10_000;

/// Window for the rolling throughput figure.
pub(crate) const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// How often an idle or saturated dispatcher proves it is alive.
pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of offering a job to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Queued { priority: u32 },
    Duplicate,
}

/// Point-in-time partition statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionMetrics {
    pub index: u32,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub concurrency: usize,
    pub completed: u64,
    pub failed: u64,
    /// Jobs finished per second over the last minute.
    pub throughput_per_sec: f64,
    pub avg_latency_ms: f64,
    pub heartbeat_age_ms: u64,
}

enum Finish {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Default)]
struct State {
    queue: PriorityQueue,
    /// Keys reserved, queued, or in flight.
    active: HashSet<JobKey>,
    recent: HashSet<JobKey>,
    recent_order: VecDeque<JobKey>,
    in_flight: usize,
    completed: u64,
    failed: u64,
    finished_at: VecDeque<Instant>,
    total_latency: Duration,
    latency_samples: u64,
    closed: bool,
}

impl State {
    fn remember(&mut self, key: JobKey) {
        if self.recent.insert(key.clone()) {
            self.recent_order.push_back(key);
        }
        while self.recent_order.len() > RECENT_CAPACITY {
            if let Some(old) = self.recent_order.pop_front() {
                self.recent.remove(&old);
            }
        }
    }

    fn prune_window(&mut self, now: Instant) {
        while let Some(at) = self.finished_at.front() {
            if now.saturating_duration_since(*at) > THROUGHPUT_WINDOW {
                self.finished_at.pop_front();
            } else {
                break;
            }
        }
    }
}

pub(crate) struct Partition {
    pub(crate) index: u32,
    pub(crate) partition_count: u32,
    pub(crate) queue_name: String,
    concurrency: usize,
    state: Mutex<State>,
    notify: Notify,
    heartbeat: Mutex<Instant>,
    started_at: Instant,
    cancel: CancellationToken,
}

impl Partition {
    pub(crate) fn new(index: u32, partition_count: u32, concurrency: usize) -> Self {
        let now = Instant::now();
        Self {
            index,
            partition_count,
            queue_name: queue_name(index),
            concurrency: concurrency.max(1),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            heartbeat: Mutex::new(now),
            started_at: now,
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub(crate) fn heartbeat_age(&self) -> Duration {
        let last = *self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        Instant::now().saturating_duration_since(last)
    }

    /// Persist and queue a job unless its key is already known here.
    pub(crate) async fn enqueue(&self, job: Job, backend: &dyn QueueBackend) -> Result<Admission> {
        let key = job.key();
        {
            let mut st = self.lock();
            if st.closed {
                return Err(Error::ShuttingDown);
            }
            if st.active.contains(&key) || st.recent.contains(&key) {
                return Ok(Admission::Duplicate);
            }
            st.active.insert(key.clone());
        }

        let receipt = match backend.persist(&self.queue_name, &job).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.lock().active.remove(&key);
                return Err(e);
            }
        };

        let priority = priority_of(&job, Utc::now());
        self.lock().queue.push(job, priority, Some(receipt));
        self.notify.notify_one();
        Ok(Admission::Queued { priority })
    }

    /// Re-queue a job recovered from the durable backend.
    pub(crate) fn restore(&self, receipt: Receipt, job: Job) -> bool {
        let mut st = self.lock();
        let key = job.key();
        if st.active.contains(&key) {
            return false;
        }
        st.active.insert(key);
        let priority = priority_of(&job, Utc::now());
        st.queue.push(job, priority, Some(receipt));
        drop(st);
        self.notify.notify_one();
        true
    }

    /// Stop intake. Queued jobs are still dispatched.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Abort running workers and stop dispatching.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn metrics(&self) -> PartitionMetrics {
        let now = Instant::now();
        let heartbeat_age_ms = self.heartbeat_age().as_millis() as u64;
        let mut st = self.lock();
        st.prune_window(now);
        let window = now
            .saturating_duration_since(self.started_at)
            .min(THROUGHPUT_WINDOW)
            .as_secs_f64()
            .max(1.0);
        PartitionMetrics {
            index: self.index,
            queue_depth: st.queue.len(),
            in_flight: st.in_flight,
            concurrency: self.concurrency,
            completed: st.completed,
            failed: st.failed,
            throughput_per_sec: st.finished_at.len() as f64 / window,
            avg_latency_ms: if st.latency_samples == 0 {
                0.0
            } else {
                st.total_latency.as_secs_f64() * 1000.0 / st.latency_samples as f64
            },
            heartbeat_age_ms,
        }
    }

    fn finish(&self, key: JobKey, finish: Finish, elapsed: Duration) {
        let now = Instant::now();
        let mut st = self.lock();
        st.in_flight = st.in_flight.saturating_sub(1);
        st.active.remove(&key);
        match finish {
            Finish::Completed => st.completed += 1,
            Finish::Failed => st.failed += 1,
            // Not remembered, so the job can be resubmitted or recovered.
            Finish::Cancelled => return,
        }
        st.remember(key);
        st.finished_at.push_back(now);
        st.prune_window(now);
        st.total_latency += elapsed;
        st.latency_samples += 1;
    }

    /// Start the dispatcher. It returns once the partition is closed and
    /// drained, or cancelled, and all of its workers have finished.
    pub(crate) fn spawn(self: &Arc<Self>, ctx: Arc<JobContext>) -> JoinHandle<()> {
        let partition = Arc::clone(self);
        tokio::spawn(async move { partition.dispatch(ctx).await })
    }

    async fn dispatch(self: Arc<Self>, ctx: Arc<JobContext>) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(partition = self.index, concurrency = self.concurrency, "partition dispatcher started");

        'dispatch: loop {
            self.touch();

            let permit = loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'dispatch,
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(permit) => break permit,
                        Err(_) => break 'dispatch,
                    },
                    _ = heartbeat.tick() => self.touch(),
                    Some(joined) = workers.join_next(), if !workers.is_empty() => {
                        self.reap(joined);
                    }
                }
            };

            let queued = loop {
                let next = {
                    let mut st = self.lock();
                    match st.queue.pop() {
                        Some(queued) => {
                            st.in_flight += 1;
                            Some(Some(queued))
                        }
                        None if st.closed => Some(None),
                        None => None,
                    }
                };
                match next {
                    Some(Some(queued)) => break queued,
                    Some(None) => break 'dispatch,
                    None => {}
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'dispatch,
                    _ = self.notify.notified() => {}
                    _ = heartbeat.tick() => self.touch(),
                    Some(joined) = workers.join_next(), if !workers.is_empty() => {
                        self.reap(joined);
                    }
                }
            };

            let partition = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            let cancel = self.cancel.child_token();
            workers.spawn(async move { partition.run_job(ctx, queued, permit, cancel).await });
        }

        while let Some(joined) = workers.join_next().await {
            self.reap(joined);
        }
        info!(partition = self.index, "partition dispatcher stopped");
    }

    fn reap(&self, joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            error!(partition = self.index, error = %e, "job worker panicked");
        }
    }

    async fn run_job(
        self: Arc<Self>,
        ctx: Arc<JobContext>,
        queued: Queued,
        _permit: OwnedSemaphorePermit,
        cancel: CancellationToken,
    ) {
        let Queued { job, receipt, .. } = queued;
        let key = job.key();
        let key_str = key.to_string();
        let span = start_job_span(self.index, &key_str);

        async {
            let expected = shard_of(&job.conversation_id, self.partition_count);
            if expected != self.index {
                warn!(
                    partition = self.index,
                    expected,
                    conversation_id = %job.conversation_id,
                    message_id = %job.message_id,
                    "job observed on the wrong partition"
                );
                ctx.events.publish(EventKind::ShardMismatch {
                    key: key_str.clone(),
                    expected,
                    observed: self.index,
                });
            }

            record_state_transition(&span, "queued", "processing");
            let started = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::ShuttingDown),
                report = ctx.processor.process(&job) => report,
            };
            let elapsed = started.elapsed();
            let partition_label = KeyValue::new("partition", i64::from(self.index));

            let finish = match result {
                Ok(report) => {
                    record_verdict(
                        &span,
                        &report.source.to_string(),
                        &report.verdict.outcome.to_string(),
                    );
                    record_state_transition(&span, "processing", "completed");
                    debug!(
                        partition = self.index,
                        conversation_id = %job.conversation_id,
                        message_id = %job.message_id,
                        source = %report.source,
                        outcome = %report.verdict.outcome,
                        "job completed"
                    );
                    metrics::job_completions()
                        .add(1, &[partition_label, KeyValue::new("status", "completed")]);
                    ctx.events.publish(EventKind::JobCompleted {
                        key: key_str.clone(),
                        partition: self.index,
                        source: report.source,
                        duration_ms: elapsed.as_millis() as u64,
                    });
                    Finish::Completed
                }
                Err(Error::ShuttingDown) => {
                    record_state_transition(&span, "processing", "cancelled");
                    info!(partition = self.index, key = %key_str, "job cancelled by shutdown");
                    metrics::job_completions()
                        .add(1, &[partition_label, KeyValue::new("status", "cancelled")]);
                    Finish::Cancelled
                }
                Err(e) => {
                    record_state_transition(&span, "processing", "failed");
                    warn!(partition = self.index, key = %key_str, error = %e, "job failed");
                    metrics::job_completions()
                        .add(1, &[partition_label, KeyValue::new("status", "failed")]);
                    ctx.events.publish(EventKind::JobFailed {
                        key: key_str.clone(),
                        partition: self.index,
                        error: e.to_string(),
                    });
                    Finish::Failed
                }
            };

            // Cancelled jobs stay in the durable queue for recovery.
            if let (false, Some(receipt)) = (matches!(finish, Finish::Cancelled), receipt) {
                if let Err(e) = ctx.backend.acknowledge(&self.queue_name, receipt).await {
                    warn!(partition = self.index, key = %key_str, error = %e, "failed to acknowledge job");
                }
            }

            metrics::operation_duration_ms().record(
                elapsed.as_secs_f64() * 1000.0,
                &[KeyValue::new("operation", "job.process")],
            );
            self.finish(key, finish, elapsed);
        }
        .instrument(span.clone())
        .await
    }
}
