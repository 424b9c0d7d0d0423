//! Idempotent executor for moderation side effects.
//!
//! Each logical action gets the id `conversation:message:action`. Creating
//! the same action twice returns the first entry, and a completed entry is
//! never executed again. Failed attempts go back to `pending` until the
//! retry cap is reached, then the entry is `failed` for good. A claim
//! holds for `claim_lease`; an entry left in `processing` by an executor
//! that died is claimable again once the lease runs out.
//!
//! ```text
//!   pending ──claim──▶ processing ──ok──▶ completed
//!      ▲                  │
//!      └──── transient ───┤
//!                         └── permanent / cap reached ──▶ failed
//! ```

pub mod gateway;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{EventBus, EventKind};
use crate::model::ActionType;
use crate::telemetry::metrics;
use gateway::{ActionGateway, GatewayError};
use store::{Claim, OutboxStore};

const DEFAULT_WARNING: &str = "Your message was flagged by the moderators of this chat.";

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub fn can_transition_to(self, to: OutboxStatus) -> bool {
        use OutboxStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Failed) // retry cap reached before an attempt
                | (Processing, Completed)
                | (Processing, Pending) // recoverable failure
                | (Processing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Completed | OutboxStatus::Failed)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "completed" => Ok(OutboxStatus::Completed),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(Error::Other(format!("unknown outbox status: {other}"))),
        }
    }
}

/// What the gateway needs to carry out an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Warning text; a stock message is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Mute length; the executor default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

impl ActionPayload {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            ..Self::default()
        }
    }

    pub fn message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_secs = Some(duration.as_secs());
        self
    }

    fn require<'a>(
        field: &'a Option<String>,
        name: &str,
    ) -> std::result::Result<&'a str, GatewayError> {
        field
            .as_deref()
            .ok_or_else(|| GatewayError::Permanent(format!("payload is missing {name}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub action_type: ActionType,
    pub payload: ActionPayload,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// When the current `processing` claim was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn new(
        conversation_id: &str,
        message_id: &str,
        action_type: ActionType,
        payload: ActionPayload,
    ) -> Self {
        Self {
            id: action_id(conversation_id, message_id, action_type),
            action_type,
            payload,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            last_error: None,
            claimed_at: None,
        }
    }
}

/// Natural idempotency key of an action.
pub fn action_id(conversation_id: &str, message_id: &str, action_type: ActionType) -> String {
    format!("{conversation_id}:{message_id}:{action_type}")
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Attempts before an action is marked failed.
    pub max_retries: u32,
    /// First retry delay in [`Outbox::process_until_settled`]; doubles per attempt.
    pub retry_backoff: Duration,
    /// Completed entries older than this are pruned by cleanup.
    pub retention: Duration,
    /// Mute length when the payload does not specify one.
    pub default_mute: Duration,
    /// How long a claim blocks other executors. Must exceed the slowest
    /// gateway call.
    pub claim_lease: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            retention: Duration::from_secs(86_400),
            default_mute: Duration::from_secs(3600),
            claim_lease: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboxMetrics {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
    pub average_retries: f64,
}

const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct Outbox {
    store: Arc<dyn OutboxStore>,
    gateway: Arc<dyn ActionGateway>,
    config: OutboxConfig,
    events: EventBus,
}

impl Outbox {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        gateway: Arc<dyn ActionGateway>,
        config: OutboxConfig,
    ) -> Self {
        Self::with_events(store, gateway, config, EventBus::default())
    }

    pub fn with_events(
        store: Arc<dyn OutboxStore>,
        gateway: Arc<dyn ActionGateway>,
        config: OutboxConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
            events,
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Record an action. Returns the existing entry, untouched, if the same
    /// `(conversation, message, action)` was already recorded.
    pub async fn create_action(
        &self,
        conversation_id: &str,
        message_id: &str,
        action_type: ActionType,
        payload: ActionPayload,
    ) -> Result<OutboxEntry> {
        let entry = OutboxEntry::new(conversation_id, message_id, action_type, payload);
        let (entry, created) = self.store.insert_or_get(entry).await?;
        if created {
            debug!(action_id = %entry.id, action = %action_type, "outbox action recorded");
        } else {
            debug!(action_id = %entry.id, status = %entry.status, "outbox action already recorded");
        }
        Ok(entry)
    }

    pub async fn get(&self, id: &str) -> Result<Option<OutboxEntry>> {
        self.store.get(id).await
    }

    /// Make one execution attempt.
    ///
    /// Completed entries return immediately without calling the gateway.
    /// A transient failure returns [`Error::ActionFailed`] and leaves the
    /// entry pending, unless this attempt reached the retry cap, in which
    /// case the entry is failed and [`Error::RetriesExhausted`] is returned.
    pub async fn process_action(&self, id: &str) -> Result<OutboxEntry> {
        let max_retries = self.config.max_retries;
        let entry = match self
            .store
            .claim(id, max_retries, self.config.claim_lease)
            .await?
        {
            Claim::Claimed(entry) => entry,
            Claim::AlreadyCompleted(entry) => return Ok(entry),
            Claim::Exhausted(entry) => {
                self.report_failure(&entry, "retry limit reached", true);
                return Err(Error::RetriesExhausted {
                    id: entry.id,
                    attempts: entry.retry_count,
                });
            }
            Claim::Failed(entry) => return Err(Self::terminal_error(entry, max_retries)),
            Claim::Busy(entry) => {
                debug!(action_id = %entry.id, "outbox action claimed elsewhere");
                return Err(Error::ActionInProgress { id: entry.id });
            }
        };

        match self.execute(&entry).await {
            Ok(()) => {
                let done = self.store.complete(&entry.id).await?;
                info!(
                    action_id = %done.id,
                    action = %done.action_type,
                    attempts = done.retry_count,
                    "outbox action completed"
                );
                Self::record_execution(done.action_type, "completed");
                self.events.publish(EventKind::ActionCompleted {
                    id: done.id.clone(),
                    action: done.action_type,
                    attempts: done.retry_count,
                });
                Ok(done)
            }
            Err(GatewayError::Permanent(reason)) => {
                let failed = self.store.mark_failed(&entry.id, &reason).await?;
                self.report_failure(&failed, &reason, true);
                Err(Error::PermanentAction {
                    id: failed.id,
                    reason,
                })
            }
            Err(GatewayError::Transient(reason)) if entry.retry_count >= max_retries => {
                let failed = self.store.mark_failed(&entry.id, &reason).await?;
                self.report_failure(&failed, &reason, true);
                Err(Error::RetriesExhausted {
                    id: failed.id,
                    attempts: failed.retry_count,
                })
            }
            Err(GatewayError::Transient(reason)) => {
                let pending = self.store.release(&entry.id, &reason).await?;
                self.report_failure(&pending, &reason, false);
                Err(Error::ActionFailed {
                    id: pending.id,
                    attempt: pending.retry_count,
                    reason,
                })
            }
        }
    }

    /// Retry with exponential backoff until the action completes or fails
    /// terminally. While another executor holds the claim this waits for it
    /// to finish or for its lease to lapse.
    pub async fn process_until_settled(&self, id: &str) -> Result<OutboxEntry> {
        loop {
            match self.process_action(id).await {
                Err(Error::ActionFailed { attempt, .. }) => {
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(Error::ActionInProgress { .. }) => {
                    tokio::time::sleep(self.config.retry_backoff.min(self.config.claim_lease))
                        .await;
                }
                other => return other,
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.config
            .retry_backoff
            .saturating_mul(factor)
            .min(MAX_BACKOFF)
    }

    async fn execute(&self, entry: &OutboxEntry) -> std::result::Result<(), GatewayError> {
        let p = &entry.payload;
        let gw = &self.gateway;
        match entry.action_type {
            ActionType::Delete => {
                let message_id = ActionPayload::require(&p.message_id, "message_id")?;
                gw.delete_message(&p.chat_id, message_id).await
            }
            ActionType::Mute => {
                let user_id = ActionPayload::require(&p.user_id, "user_id")?;
                let length = p
                    .duration_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.config.default_mute);
                let until = chrono::Duration::from_std(length)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d));
                gw.restrict_member(&p.chat_id, user_id, until).await
            }
            ActionType::Kick => {
                let user_id = ActionPayload::require(&p.user_id, "user_id")?;
                gw.ban_member(&p.chat_id, user_id).await?;
                gw.unban_member(&p.chat_id, user_id).await
            }
            ActionType::Ban => {
                let user_id = ActionPayload::require(&p.user_id, "user_id")?;
                gw.ban_member(&p.chat_id, user_id).await
            }
            ActionType::Warn => {
                let text = p.text.as_deref().unwrap_or(DEFAULT_WARNING);
                gw.send_message(&p.chat_id, text, p.message_id.as_deref())
                    .await
            }
        }
    }

    fn terminal_error(entry: OutboxEntry, max_retries: u32) -> Error {
        if entry.retry_count >= max_retries {
            Error::RetriesExhausted {
                id: entry.id,
                attempts: entry.retry_count,
            }
        } else {
            Error::PermanentAction {
                reason: entry
                    .last_error
                    .unwrap_or_else(|| "action failed".to_string()),
                id: entry.id,
            }
        }
    }

    fn report_failure(&self, entry: &OutboxEntry, reason: &str, terminal: bool) {
        if terminal {
            warn!(
                action_id = %entry.id,
                action = %entry.action_type,
                attempts = entry.retry_count,
                error = reason,
                "outbox action failed permanently"
            );
        } else {
            warn!(
                action_id = %entry.id,
                action = %entry.action_type,
                attempt = entry.retry_count,
                error = reason,
                "outbox action attempt failed"
            );
        }
        Self::record_execution(entry.action_type, if terminal { "failed" } else { "retry" });
        self.events.publish(EventKind::ActionFailed {
            id: entry.id.clone(),
            action: entry.action_type,
            error: reason.to_string(),
            attempts: entry.retry_count,
            terminal,
        });
    }

    fn record_execution(action: ActionType, result: &'static str) {
        metrics::outbox_executions().add(
            1,
            &[
                KeyValue::new("action", action.to_string()),
                KeyValue::new("result", result),
            ],
        );
    }

    pub async fn metrics(&self) -> Result<OutboxMetrics> {
        let stats = self.store.stats().await?;
        let total = stats.total();
        Ok(OutboxMetrics {
            pending: stats.pending,
            processing: stats.processing,
            completed: stats.completed,
            failed: stats.failed,
            total,
            average_retries: if total == 0 {
                0.0
            } else {
                stats.total_retries as f64 / total as f64
            },
        })
    }

    /// Prune completed entries older than `retention`.
    pub async fn cleanup(&self, retention: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(retention)
            .map_err(|e| Error::Config(format!("retention out of range: {e}")))?;
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.store.prune_completed(cutoff).await?;
        if removed > 0 {
            info!(removed, "pruned completed outbox entries");
        }
        Ok(removed)
    }

    /// Run [`Outbox::cleanup`] with the configured retention every `period`.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = outbox.cleanup(outbox.config.retention).await {
                            warn!(error = %e, "outbox cleanup failed");
                        }
                    }
                }
            }
        })
    }
}
