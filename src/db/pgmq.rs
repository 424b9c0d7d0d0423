//! pgmq queue operations via direct SQLx, and the [`QueueBackend`] built
//! on them.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::warn;

use crate::error::Result;
use crate::model::Job;
use crate::queue::{QueueBackend, Receipt};
use crate::telemetry::metrics;

/// Visibility timeout for messages read during recovery. A process that
/// dies mid-recovery makes them visible again after this long.
const RECOVERY_VT_SECONDS: i32 = 300;

/// Messages fetched per recovery round trip.
const RECOVERY_BATCH: i32 = 100;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

fn record(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        record(queue_name, "create");
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    pub async fn send_to_queue(&self, queue_name: &str, payload: &serde_json::Value) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2)")
            .bind(queue_name)
            .bind(payload)
            .fetch_one(&self.pool)
            .await?;
        record(queue_name, "send");
        Ok(row.0)
    }

    /// Read up to `qty` visible messages, hiding them for `vt_seconds`.
    pub async fn read_batch(
        &self,
        queue_name: &str,
        vt_seconds: i32,
        qty: i32,
    ) -> Result<Vec<PgmqMessage>> {
        let rows = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, $3)")
        .bind(queue_name)
        .bind(vt_seconds)
        .bind(qty)
        .fetch_all(&self.pool)
        .await?;

        record(queue_name, if rows.is_empty() { "read_empty" } else { "read" });

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
                msg_id,
                read_ct,
                enqueued_at,
                vt,
                message,
            })
            .collect())
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        record(queue_name, "archive");
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for super::Db {
    async fn ensure_queue(&self, name: &str) -> Result<()> {
        self.create_queue(name).await
    }

    async fn persist(&self, name: &str, job: &Job) -> Result<Receipt> {
        let payload = serde_json::to_value(job)
            .map_err(|e| crate::error::Error::Other(format!("cannot encode job: {e}")))?;
        self.send_to_queue(name, &payload).await
    }

    async fn acknowledge(&self, name: &str, receipt: Receipt) -> Result<()> {
        self.archive_message(name, receipt).await
    }

    async fn recover(&self, name: &str) -> Result<Vec<(Receipt, Job)>> {
        let mut jobs = Vec::new();
        loop {
            let batch = self
                .read_batch(name, RECOVERY_VT_SECONDS, RECOVERY_BATCH)
                .await?;
            if batch.is_empty() {
                break;
            }
            for msg in batch {
                match serde_json::from_value::<Job>(msg.message) {
                    Ok(job) => jobs.push((msg.msg_id, job)),
                    Err(e) => {
                        warn!(queue = name, msg_id = msg.msg_id, error = %e, "archiving undecodable job");
                        self.archive_message(name, msg.msg_id).await?;
                    }
                }
            }
        }
        Ok(jobs)
    }

    async fn health_check(&self) -> Result<()> {
        super::Db::health_check(self).await
    }
}
