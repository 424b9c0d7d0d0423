//! Outbox identity map.
//!
//! The store owns entry state and enforces the status machine. Each method
//! is a single atomic step so that two executors racing on the same entry
//! cannot both claim it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{OutboxEntry, OutboxStatus};
use crate::error::{Error, Result};

/// Result of trying to claim an entry for execution.
#[derive(Debug, Clone)]
pub enum Claim {
    /// Moved to `processing` with `retry_count` incremented.
    Claimed(OutboxEntry),
    /// Already `completed`; must not run again.
    AlreadyCompleted(OutboxEntry),
    /// Retry cap reached; the entry is now `failed`.
    Exhausted(OutboxEntry),
    /// Terminally `failed` before this call.
    Failed(OutboxEntry),
    /// Another executor holds an unexpired claim.
    Busy(OutboxEntry),
}

/// Aggregate counts by status.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Sum of `retry_count` over all entries.
    pub total_retries: u64,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert `entry` unless one with the same id exists. Returns the stored
    /// entry and whether it was newly created.
    async fn insert_or_get(&self, entry: OutboxEntry) -> Result<(OutboxEntry, bool)>;

    async fn get(&self, id: &str) -> Result<Option<OutboxEntry>>;

    /// Claim an entry for one execution attempt. A `processing` entry whose
    /// claim is older than `lease` counts as abandoned and is claimed again.
    async fn claim(&self, id: &str, max_retries: u32, lease: Duration) -> Result<Claim>;

    /// `processing → completed`.
    async fn complete(&self, id: &str) -> Result<OutboxEntry>;

    /// `processing → pending`, recording the error.
    async fn release(&self, id: &str, error: &str) -> Result<OutboxEntry>;

    /// Move to `failed`, recording the error.
    async fn mark_failed(&self, id: &str, error: &str) -> Result<OutboxEntry>;

    async fn stats(&self) -> Result<OutboxStats>;

    /// Delete completed entries processed before `before`.
    async fn prune_completed(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Process-local store. Idempotency holds within one process only.
#[derive(Default)]
pub struct MemoryOutboxStore {
    entries: Mutex<HashMap<String, OutboxEntry>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, OutboxEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition<F>(&self, id: &str, to: OutboxStatus, apply: F) -> Result<OutboxEntry>
    where
        F: FnOnce(&mut OutboxEntry),
    {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("outbox entry {id}")))?;
        validate_transition(entry.status, to)?;
        entry.status = to;
        entry.claimed_at = None;
        apply(entry);
        Ok(entry.clone())
    }
}

/// A claim with no timestamp is treated as expired.
pub(crate) fn lease_expired(entry: &OutboxEntry, lease: Duration, now: DateTime<Utc>) -> bool {
    let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
    match entry.claimed_at {
        None => true,
        Some(at) => at
            .checked_add_signed(lease)
            .is_none_or(|until| until <= now),
    }
}

pub(crate) fn validate_transition(from: OutboxStatus, to: OutboxStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn insert_or_get(&self, entry: OutboxEntry) -> Result<(OutboxEntry, bool)> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&entry.id) {
            return Ok((existing.clone(), false));
        }
        entries.insert(entry.id.clone(), entry.clone());
        Ok((entry, true))
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxEntry>> {
        Ok(self.lock().get(id).cloned())
    }

    async fn claim(&self, id: &str, max_retries: u32, lease: Duration) -> Result<Claim> {
        let now = Utc::now();
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("outbox entry {id}")))?;

        let claim = match entry.status {
            OutboxStatus::Completed => Claim::AlreadyCompleted(entry.clone()),
            OutboxStatus::Failed => Claim::Failed(entry.clone()),
            OutboxStatus::Processing if !lease_expired(entry, lease, now) => {
                Claim::Busy(entry.clone())
            }
            OutboxStatus::Pending | OutboxStatus::Processing
                if entry.retry_count >= max_retries =>
            {
                entry.status = OutboxStatus::Failed;
                entry.processed_at = Some(now);
                entry.claimed_at = None;
                if entry.last_error.is_none() {
                    entry.last_error = Some("retry limit reached".to_string());
                }
                Claim::Exhausted(entry.clone())
            }
            OutboxStatus::Pending | OutboxStatus::Processing => {
                entry.status = OutboxStatus::Processing;
                entry.retry_count += 1;
                entry.claimed_at = Some(now);
                Claim::Claimed(entry.clone())
            }
        };
        Ok(claim)
    }

    async fn complete(&self, id: &str) -> Result<OutboxEntry> {
        self.transition(id, OutboxStatus::Completed, |e| {
            e.processed_at = Some(Utc::now());
            e.last_error = None;
        })
    }

    async fn release(&self, id: &str, error: &str) -> Result<OutboxEntry> {
        self.transition(id, OutboxStatus::Pending, |e| {
            e.last_error = Some(error.to_string());
        })
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<OutboxEntry> {
        self.transition(id, OutboxStatus::Failed, |e| {
            e.processed_at = Some(Utc::now());
            e.last_error = Some(error.to_string());
        })
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let entries = self.lock();
        let mut stats = OutboxStats::default();
        for entry in entries.values() {
            match entry.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Completed => stats.completed += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
            stats.total_retries += u64::from(entry.retry_count);
        }
        Ok(stats)
    }

    async fn prune_completed(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.lock();
        let len = entries.len();
        entries.retain(|_, e| {
            !(e.status == OutboxStatus::Completed && e.processed_at.is_some_and(|at| at <= before))
        });
        Ok(len - entries.len())
    }
}
