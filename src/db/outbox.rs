//! Durable [`OutboxStore`] on the `moderation_outbox` table.
//!
//! The primary key is the action identity, so `INSERT … ON CONFLICT DO
//! NOTHING` keeps creation idempotent across processes, and every status
//! change is a compare-and-set `UPDATE … WHERE status = …`. Claims are
//! stamped with `claimed_at` so an abandoned `processing` row can be taken
//! over once its lease lapses.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::outbox::store::{Claim, OutboxStats, OutboxStore, validate_transition};
use crate::outbox::{ActionPayload, OutboxEntry, OutboxStatus};

const COLUMNS: &str = "id, action_type, payload, status, created_at, processed_at, \
                       retry_count, last_error, claimed_at";

/// Rows a claim may take: pending, or processing with a lapsed lease.
const CLAIMABLE: &str = "(status = 'pending' OR (status = 'processing' AND \
                         (claimed_at IS NULL OR claimed_at <= now() - make_interval(secs => $3))))";

type Row = (
    String,
    String,
    serde_json::Value,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    i32,
    Option<String>,
    Option<DateTime<Utc>>,
);

fn entry_from_row(row: Row) -> Result<OutboxEntry> {
    let (
        id,
        action_type,
        payload,
        status,
        created_at,
        processed_at,
        retry_count,
        last_error,
        claimed_at,
    ) = row;
    let payload: ActionPayload = serde_json::from_value(payload)
        .map_err(|e| Error::Other(format!("bad payload for outbox entry {id}: {e}")))?;
    Ok(OutboxEntry {
        action_type: action_type.parse()?,
        status: status.parse()?,
        payload,
        created_at,
        processed_at,
        retry_count: retry_count.max(0) as u32,
        last_error,
        claimed_at,
        id,
    })
}

impl super::Db {
    async fn fetch_entry(&self, id: &str) -> Result<Option<OutboxEntry>> {
        let row: Option<Row> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM moderation_outbox WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(entry_from_row).transpose()
    }

    async fn require_entry(&self, id: &str) -> Result<OutboxEntry> {
        self.fetch_entry(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("outbox entry {id}")))
    }

    /// Explain why a conditional update matched nothing.
    async fn transition_error(&self, id: &str, to: OutboxStatus) -> Error {
        match self.require_entry(id).await {
            Ok(entry) => match validate_transition(entry.status, to) {
                Err(e) => e,
                Ok(()) => Error::Other(format!("outbox entry {id} changed concurrently")),
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl OutboxStore for super::Db {
    async fn insert_or_get(&self, entry: OutboxEntry) -> Result<(OutboxEntry, bool)> {
        let payload = serde_json::to_value(&entry.payload)
            .map_err(|e| Error::Other(format!("cannot encode outbox payload: {e}")))?;

        let inserted: Option<Row> = sqlx::query_as(&format!(
            "INSERT INTO moderation_outbox (id, action_type, payload, status, created_at, retry_count)
             VALUES ($1, $2, $3, $4, $5, 0)
             ON CONFLICT (id) DO NOTHING
             RETURNING {COLUMNS}"
        ))
        .bind(&entry.id)
        .bind(entry.action_type.to_string())
        .bind(payload)
        .bind(OutboxStatus::Pending.to_string())
        .bind(entry.created_at)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok((entry_from_row(row)?, true)),
            None => Ok((self.require_entry(&entry.id).await?, false)),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxEntry>> {
        self.fetch_entry(id).await
    }

    async fn claim(&self, id: &str, max_retries: u32, lease: Duration) -> Result<Claim> {
        let max_retries = i32::try_from(max_retries).unwrap_or(i32::MAX);
        let lease_secs = lease.as_secs_f64();
        let claimed: Option<Row> = sqlx::query_as(&format!(
            "UPDATE moderation_outbox
             SET status = 'processing', retry_count = retry_count + 1, claimed_at = now()
             WHERE id = $1 AND retry_count < $2 AND {CLAIMABLE}
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(max_retries)
        .bind(lease_secs)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = claimed {
            return Ok(Claim::Claimed(entry_from_row(row)?));
        }

        let exhausted: Option<Row> = sqlx::query_as(&format!(
            "UPDATE moderation_outbox
             SET status = 'failed', processed_at = now(), claimed_at = NULL,
                 last_error = COALESCE(last_error, 'retry limit reached')
             WHERE id = $1 AND retry_count >= $2 AND {CLAIMABLE}
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(max_retries)
        .bind(lease_secs)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = exhausted {
            return Ok(Claim::Exhausted(entry_from_row(row)?));
        }

        let entry = self.require_entry(id).await?;
        Ok(match entry.status {
            OutboxStatus::Completed => Claim::AlreadyCompleted(entry),
            OutboxStatus::Failed => Claim::Failed(entry),
            // Lost a race with another claimer.
            OutboxStatus::Pending | OutboxStatus::Processing => Claim::Busy(entry),
        })
    }

    async fn complete(&self, id: &str) -> Result<OutboxEntry> {
        let row: Option<Row> = sqlx::query_as(&format!(
            "UPDATE moderation_outbox
             SET status = 'completed', processed_at = now(), last_error = NULL,
                 claimed_at = NULL
             WHERE id = $1 AND status = 'processing'
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => entry_from_row(row),
            None => Err(self.transition_error(id, OutboxStatus::Completed).await),
        }
    }

    async fn release(&self, id: &str, error: &str) -> Result<OutboxEntry> {
        let row: Option<Row> = sqlx::query_as(&format!(
            "UPDATE moderation_outbox
             SET status = 'pending', last_error = $2, claimed_at = NULL
             WHERE id = $1 AND status = 'processing'
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => entry_from_row(row),
            None => Err(self.transition_error(id, OutboxStatus::Pending).await),
        }
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<OutboxEntry> {
        let row: Option<Row> = sqlx::query_as(&format!(
            "UPDATE moderation_outbox
             SET status = 'failed', processed_at = now(), last_error = $2,
                 claimed_at = NULL
             WHERE id = $1 AND status IN ('pending', 'processing')
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => entry_from_row(row),
            None => Err(self.transition_error(id, OutboxStatus::Failed).await),
        }
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*), COALESCE(SUM(retry_count), 0)::BIGINT
             FROM moderation_outbox
             GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = OutboxStats::default();
        for (status, count, retries) in rows {
            let count = count.max(0) as u64;
            match status.parse::<OutboxStatus>()? {
                OutboxStatus::Pending => stats.pending = count,
                OutboxStatus::Processing => stats.processing = count,
                OutboxStatus::Completed => stats.completed = count,
                OutboxStatus::Failed => stats.failed = count,
            }
            stats.total_retries += retries.max(0) as u64;
        }
        Ok(stats)
    }

    async fn prune_completed(&self, before: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM moderation_outbox WHERE status = 'completed' AND processed_at <= $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}
