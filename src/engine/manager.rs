//! Owns the partitions of one layout and swaps layouts on resize.
//!
//! The layout sits behind an `RwLock` that is only write-locked to install
//! or remove a generation. Draining happens outside it, so readiness,
//! metrics and submissions never wait on in-flight jobs; they see the
//! manager as stopped (or resizing) for the duration. Shutdown and resize
//! are serialized by a separate lifecycle mutex.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::partition::{Admission, Partition, PartitionMetrics};
use super::{JobContext, Processor};
use crate::config::PipelineSettings;
use crate::error::{Error, Result};
use crate::event::{EventBus, EventKind};
use crate::model::{Job, JobKey};
use crate::queue::{QueueBackend, queue_name};
use crate::router::shard_of;
use crate::telemetry::metrics;

/// A partition whose dispatcher has been silent this long is not ready.
pub const HEARTBEAT_STALENESS: Duration = Duration::from_secs(5);

/// A partition is a hotspot when its throughput exceeds this multiple of
/// the mean.
pub const HOTSPOT_FACTOR: f64 = 3.0;

/// Result of [`PartitionManager::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Queued {
        key: JobKey,
        partition: u32,
        priority: u32,
    },
    /// Already queued, in flight, or recently completed on `partition`.
    Duplicate { key: JobKey, partition: u32 },
}

impl SubmitResult {
    pub fn partition(&self) -> u32 {
        match self {
            SubmitResult::Queued { partition, .. } | SubmitResult::Duplicate { partition, .. } => {
                *partition
            }
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, SubmitResult::Duplicate { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerMetrics {
    pub partition_count: u32,
    pub total_concurrency: usize,
    pub partitions: Vec<PartitionMetrics>,
    pub mean_throughput_per_sec: f64,
    /// Some partition runs at more than three times the mean throughput.
    pub hotspot: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub accepting: bool,
    pub backend_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_error: Option<String>,
    pub stale_partitions: Vec<u32>,
}

/// Partitions of one layout.
struct Generation {
    settings: PipelineSettings,
    partitions: Vec<Arc<Partition>>,
    dispatchers: Vec<JoinHandle<()>>,
}

pub struct PartitionManager {
    generation: RwLock<Option<Generation>>,
    lifecycle: Mutex<()>,
    resizing: AtomicBool,
    ctx: Arc<JobContext>,
}

impl PartitionManager {
    /// Validate `settings`, recover unfinished jobs, and start dispatching.
    pub async fn start(
        settings: PipelineSettings,
        processor: Arc<Processor>,
        backend: Arc<dyn QueueBackend>,
        events: EventBus,
    ) -> Result<Self> {
        let ctx = Arc::new(JobContext {
            processor,
            backend,
            events,
        });
        let generation = Self::build(settings, &ctx).await?;
        Ok(Self {
            generation: RwLock::new(Some(generation)),
            lifecycle: Mutex::new(()),
            resizing: AtomicBool::new(false),
            ctx,
        })
    }

    async fn build(settings: PipelineSettings, ctx: &Arc<JobContext>) -> Result<Generation> {
        settings.validate()?;
        let count = settings.partition_count;
        let per_partition = settings.per_partition_concurrency();

        let mut partitions = Vec::with_capacity(count as usize);
        for index in 0..count {
            let partition = Arc::new(Partition::new(index, count, per_partition));
            ctx.backend.ensure_queue(&partition.queue_name).await?;

            let recovered = ctx.backend.recover(&partition.queue_name).await?;
            let mut restored = 0usize;
            for (receipt, job) in recovered {
                if partition.restore(receipt, job) {
                    restored += 1;
                }
            }
            if restored > 0 {
                info!(partition = index, restored, "recovered unfinished jobs");
            }
            partitions.push(partition);
        }

        let dispatchers = partitions
            .iter()
            .map(|p| p.spawn(Arc::clone(ctx)))
            .collect();

        info!(
            partitions = count,
            total_concurrency = settings.total_concurrency,
            per_partition,
            "partition manager started"
        );

        Ok(Generation {
            settings,
            partitions,
            dispatchers,
        })
    }

    /// Queue a job on its conversation's partition. Idempotent on
    /// `(conversation_id, message_id)`.
    pub async fn submit(&self, job: Job) -> Result<SubmitResult> {
        let guard = self.generation.read().await;
        let generation = guard.as_ref().ok_or_else(|| self.stopped_error())?;

        let index = shard_of(&job.conversation_id, generation.settings.partition_count);
        let partition = generation
            .partitions
            .get(index as usize)
            .ok_or_else(|| Error::Other(format!("partition {index} missing")))?;
        let key = job.key();
        let label = KeyValue::new("partition", i64::from(index));

        match partition.enqueue(job, self.ctx.backend.as_ref()).await {
            Ok(Admission::Queued { priority }) => {
                metrics::jobs_submitted().add(1, &[label, KeyValue::new("result", "queued")]);
                self.ctx.events.publish(EventKind::JobQueued {
                    key: key.to_string(),
                    partition: index,
                    priority,
                });
                Ok(SubmitResult::Queued {
                    key,
                    partition: index,
                    priority,
                })
            }
            Ok(Admission::Duplicate) => {
                info!(
                    partition = index,
                    conversation_id = %key.conversation_id,
                    message_id = %key.message_id,
                    "duplicate job ignored"
                );
                metrics::jobs_submitted().add(1, &[label, KeyValue::new("result", "duplicate")]);
                self.ctx.events.publish(EventKind::JobDuplicate {
                    key: key.to_string(),
                    partition: index,
                });
                Ok(SubmitResult::Duplicate {
                    key,
                    partition: index,
                })
            }
            Err(e) => {
                metrics::jobs_submitted().add(1, &[label, KeyValue::new("result", "rejected")]);
                Err(e)
            }
        }
    }

    fn stopped_error(&self) -> Error {
        if self.resizing.load(Ordering::SeqCst) {
            Error::Resizing
        } else {
            Error::ShuttingDown
        }
    }

    /// Partition a conversation resolves to under the current layout.
    pub async fn partition_for(&self, conversation_id: &str) -> Option<(u32, u32)> {
        let guard = self.generation.read().await;
        guard.as_ref().map(|g| {
            let count = g.settings.partition_count;
            (shard_of(conversation_id, count), count)
        })
    }

    pub async fn partition_count(&self) -> Option<u32> {
        self.generation
            .read()
            .await
            .as_ref()
            .map(|g| g.settings.partition_count)
    }

    pub async fn metrics(&self) -> ManagerMetrics {
        let guard = self.generation.read().await;
        let Some(generation) = guard.as_ref() else {
            return ManagerMetrics {
                partition_count: 0,
                total_concurrency: 0,
                partitions: Vec::new(),
                mean_throughput_per_sec: 0.0,
                hotspot: false,
            };
        };

        let partitions: Vec<PartitionMetrics> =
            generation.partitions.iter().map(|p| p.metrics()).collect();
        let throughputs: Vec<f64> = partitions.iter().map(|p| p.throughput_per_sec).collect();
        let mean = if throughputs.is_empty() {
            0.0
        } else {
            throughputs.iter().sum::<f64>() / throughputs.len() as f64
        };

        ManagerMetrics {
            partition_count: generation.settings.partition_count,
            total_concurrency: generation.settings.total_concurrency,
            hotspot: is_hotspot(&throughputs),
            mean_throughput_per_sec: mean,
            partitions,
        }
    }

    /// Ready when the queue backend answers and every dispatcher has a
    /// fresh heartbeat.
    pub async fn readiness(&self) -> Readiness {
        let backend = self.ctx.backend.health_check().await;
        let guard = self.generation.read().await;

        let (accepting, stale_partitions) = match guard.as_ref() {
            Some(generation) => (
                true,
                generation
                    .partitions
                    .iter()
                    .filter(|p| p.heartbeat_age() > HEARTBEAT_STALENESS)
                    .map(|p| p.index)
                    .collect(),
            ),
            None => (false, Vec::new()),
        };

        let backend_ok = backend.is_ok();
        Readiness {
            ready: accepting && backend_ok && stale_partitions.is_empty(),
            accepting,
            backend_ok,
            backend_error: backend.err().map(|e| e.to_string()),
            stale_partitions,
        }
    }

    /// Close intake, let queued and in-flight jobs finish, and release the
    /// partitions. Jobs still running after `timeout` are cancelled and
    /// left in the durable queue.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let generation = self.generation.write().await.take();
        match generation {
            Some(generation) => {
                Self::drain(generation, timeout).await;
                info!("partition manager stopped");
                Ok(())
            }
            None => Err(Error::ShuttingDown),
        }
    }

    /// Drain the current partitions and start `partition_count` new ones.
    /// Submissions are refused with [`Error::Resizing`] until the new
    /// layout is up. Unfinished jobs on partitions that no longer exist
    /// move to the queue they route to under the new count; jobs left on
    /// surviving partitions stay where they are.
    pub async fn resize(&self, partition_count: u32, timeout: Duration) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let old = {
            let mut guard = self.generation.write().await;
            let current = guard.as_ref().ok_or(Error::ShuttingDown)?;
            current
                .settings
                .with_partition_count(partition_count)
                .validate()?;
            self.resizing.store(true, Ordering::SeqCst);
            guard.take().ok_or(Error::ShuttingDown)?
        };

        let old_count = old.settings.partition_count;
        let settings = old.settings.with_partition_count(partition_count);
        Self::drain(old, timeout).await;

        let rebuilt = match self.reroute(old_count, partition_count).await {
            Ok(()) => Self::build(settings, &self.ctx).await,
            Err(e) => Err(e),
        };
        let result = match rebuilt {
            Ok(generation) => {
                *self.generation.write().await = Some(generation);
                info!(from = old_count, to = partition_count, "partitions re-initialized");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "resize failed, partition manager stopped");
                Err(e)
            }
        };
        self.resizing.store(false, Ordering::SeqCst);
        result
    }

    /// Move jobs stranded on partitions `new_count..old_count` onto the
    /// queues they route to under `new_count`. Each job is persisted to its
    /// new queue before it is acknowledged on the old one.
    async fn reroute(&self, old_count: u32, new_count: u32) -> Result<()> {
        let backend = self.ctx.backend.as_ref();
        for index in new_count..old_count {
            let from = queue_name(index);
            let stranded = backend.recover(&from).await?;
            if stranded.is_empty() {
                continue;
            }
            let moved = stranded.len();
            for (receipt, job) in stranded {
                let to = queue_name(shard_of(&job.conversation_id, new_count));
                backend.ensure_queue(&to).await?;
                backend.persist(&to, &job).await?;
                backend.acknowledge(&from, receipt).await?;
            }
            info!(partition = index, moved, "rerouted jobs from retired partition");
        }
        Ok(())
    }

    async fn drain(generation: Generation, timeout: Duration) {
        let Generation {
            partitions,
            mut dispatchers,
            ..
        } = generation;

        for partition in &partitions {
            partition.close();
        }

        let drained = tokio::time::timeout(timeout, async {
            for handle in dispatchers.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "drain timed out, cancelling in-flight jobs"
            );
            for partition in &partitions {
                partition.cancel();
            }
            for handle in dispatchers.iter_mut() {
                if !handle.is_finished() {
                    let _ = handle.await;
                }
            }
        }
    }
}

/// Whether any value exceeds [`HOTSPOT_FACTOR`] times the mean.
pub fn is_hotspot(throughputs: &[f64]) -> bool {
    if throughputs.is_empty() {
        return false;
    }
    let mean = throughputs.iter().sum::<f64>() / throughputs.len() as f64;
    mean > 0.0 && throughputs.iter().any(|t| *t > HOTSPOT_FACTOR * mean)
}
