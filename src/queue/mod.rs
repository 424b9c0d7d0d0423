//! Durable queue backend contract.
//!
//! Partitions dispatch from an in-process priority heap; the backend is the
//! journal behind it. A job is persisted before it becomes visible to
//! workers and acknowledged once it reaches a terminal state, so a restart
//! recovers whatever was in flight.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::Job;

/// Backend-assigned handle for a persisted job.
pub type Receipt = i64;

/// Name of the durable queue backing partition `index`.
pub fn queue_name(index: u32) -> String {
    format!("moderation_p{index}")
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Create the queue if it does not exist.
    async fn ensure_queue(&self, name: &str) -> Result<()>;

    async fn persist(&self, name: &str, job: &Job) -> Result<Receipt>;

    /// Mark a persisted job as done.
    async fn acknowledge(&self, name: &str, receipt: Receipt) -> Result<()>;

    /// Jobs persisted but never acknowledged, oldest first.
    async fn recover(&self, name: &str) -> Result<Vec<(Receipt, Job)>>;

    async fn health_check(&self) -> Result<()>;
}

/// In-process backend. Survives partition re-initialization, not restarts.
pub struct MemoryBackend {
    queues: Mutex<HashMap<String, BTreeMap<Receipt, Job>>>,
    next_receipt: AtomicI64,
    healthy: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_receipt: AtomicI64::new(1),
            healthy: AtomicBool::new(true),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<Receipt, Job>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Unacknowledged jobs in `name`.
    pub fn pending(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn ensure_queue(&self, name: &str) -> Result<()> {
        self.lock().entry(name.to_string()).or_default();
        Ok(())
    }

    async fn persist(&self, name: &str, job: &Job) -> Result<Receipt> {
        let receipt = self.next_receipt.fetch_add(1, Ordering::SeqCst);
        let mut queues = self.lock();
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("queue {name}")))?;
        queue.insert(receipt, job.clone());
        Ok(receipt)
    }

    async fn acknowledge(&self, name: &str, receipt: Receipt) -> Result<()> {
        if let Some(queue) = self.lock().get_mut(name) {
            queue.remove(&receipt);
        }
        Ok(())
    }

    async fn recover(&self, name: &str) -> Result<Vec<(Receipt, Job)>> {
        Ok(self
            .lock()
            .get(name)
            .map(|q| q.iter().map(|(r, j)| (*r, j.clone())).collect())
            .unwrap_or_default())
    }

    async fn health_check(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Other("queue backend unavailable".to_string()))
        }
    }
}
