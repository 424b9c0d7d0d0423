//! Partition manager: sharded queues, bounded workers, draining lifecycle.
//!
//! Jobs are placed by [`shard_of`](crate::router::shard_of) on the
//! conversation id. Each partition dispatches by priority, not arrival
//! order; see [`priority`].

pub mod manager;
pub mod partition;
pub mod priority;

pub use manager::{ManagerMetrics, PartitionManager, Readiness, SubmitResult};
pub use partition::PartitionMetrics;

use std::sync::Arc;

use crate::error::Result;
use crate::event::EventBus;
use crate::model::{Job, JobKey, Verdict, VerdictSource};
use crate::outbox::{ActionPayload, Outbox, OutboxEntry};
use crate::pipeline::VerdictPipeline;
use crate::queue::QueueBackend;

/// What happened to one job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub key: JobKey,
    pub verdict: Verdict,
    pub source: VerdictSource,
    pub circuit_open: bool,
    /// The settled outbox entry, when the verdict called for an action.
    pub action: Option<OutboxEntry>,
}

/// Per-job work: verdict, then any required action.
pub struct Processor {
    pipeline: Arc<VerdictPipeline>,
    outbox: Option<Arc<Outbox>>,
}

impl Processor {
    pub fn new(pipeline: Arc<VerdictPipeline>, outbox: Option<Arc<Outbox>>) -> Self {
        Self { pipeline, outbox }
    }

    pub async fn process(&self, job: &Job) -> Result<JobReport> {
        let evaluation = self.pipeline.evaluate_job(job).await;

        let action = match (evaluation.verdict.required_action(), &self.outbox) {
            (Some(action_type), Some(outbox)) => {
                let payload = ActionPayload::new(&job.conversation_id)
                    .message(&job.message_id)
                    .user(&job.user_id);
                let entry = outbox
                    .create_action(&job.conversation_id, &job.message_id, action_type, payload)
                    .await?;
                Some(outbox.process_until_settled(&entry.id).await?)
            }
            _ => None,
        };

        Ok(JobReport {
            key: job.key(),
            verdict: evaluation.verdict,
            source: evaluation.source,
            circuit_open: evaluation.circuit_open,
            action,
        })
    }
}

/// Collaborators shared by every partition of a manager.
pub(crate) struct JobContext {
    pub(crate) processor: Arc<Processor>,
    pub(crate) backend: Arc<dyn QueueBackend>,
    pub(crate) events: EventBus,
}
