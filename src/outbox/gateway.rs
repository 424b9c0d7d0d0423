//! Chat-platform action gateway.
//!
//! [`ActionGateway`] is the boundary the outbox executes against.
//! [`TelegramGateway`] implements it over the Telegram Bot API, where every
//! method answers with an `{ok, description, error_code}` envelope.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Failure of a single gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Worth retrying: rate limits, server errors, transport problems.
    #[error("transient gateway error: {0}")]
    Transient(String),
    /// Retrying cannot help: missing rights, unknown chat, bad input.
    #[error("permanent gateway error: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, GatewayError::Permanent(_))
    }
}

pub type GatewayResult = std::result::Result<(), GatewayError>;

/// Moderation calls against the chat platform.
#[async_trait]
pub trait ActionGateway: Send + Sync {
    async fn delete_message(&self, chat_id: &str, message_id: &str) -> GatewayResult;

    /// Revoke send permissions until `until` (forever when `None`).
    async fn restrict_member(
        &self,
        chat_id: &str,
        user_id: &str,
        until: Option<DateTime<Utc>>,
    ) -> GatewayResult;

    async fn ban_member(&self, chat_id: &str, user_id: &str) -> GatewayResult;

    async fn unban_member(&self, chat_id: &str, user_id: &str) -> GatewayResult;

    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> GatewayResult;
}

/// Bot API response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
}

/// 400 descriptions for which a retry cannot succeed.
const PERMANENT_DESCRIPTIONS: &[&str] = &[
    "not found",
    "message can't be deleted",
    "user is an administrator",
    "can't remove chat owner",
    "not enough rights",
    "method is available only for supergroups",
    "chat_admin_required",
    "user_id_invalid",
];

const MESSAGE_ALREADY_GONE: &str = "message to delete not found";

pub struct TelegramGateway {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
}

impl TelegramGateway {
    pub fn new(token: SecretString) -> Result<Self> {
        Self::with_base_url(token, DEFAULT_TELEGRAM_API_URL)
    }

    /// Point the gateway at another Bot API server (self-hosted or a mock).
    pub fn with_base_url(token: SecretString, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn call(&self, method: &str, body: Value) -> GatewayResult {
        let url = format!("{}/bot{}/{method}", self.base_url, self.token.expose_secret());

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            // reqwest errors include the URL, and with it the token.
            .map_err(|e| GatewayError::Transient(format!("{method}: {}", e.without_url())))?;

        let status = response.status();
        let envelope: Envelope = match response.json().await {
            Ok(envelope) => envelope,
            Err(_) if status.is_success() => return Ok(()),
            Err(_) => {
                return Err(classify(
                    method,
                    status.as_u16(),
                    &format!("HTTP {status} with undecodable body"),
                ));
            }
        };

        if envelope.ok {
            debug!(method, "telegram call ok");
            return Ok(());
        }

        let code = envelope.error_code.unwrap_or(status.as_u16());
        let description = envelope
            .description
            .unwrap_or_else(|| format!("HTTP {status}"));
        Err(classify(method, code, &description))
    }
}

/// Map a Bot API failure onto retryable vs permanent.
fn classify(method: &str, code: u16, description: &str) -> GatewayError {
    let message = format!("{method}: {code} {description}");
    let lowered = description.to_lowercase();
    match code {
        403 => GatewayError::Permanent(message),
        400 if PERMANENT_DESCRIPTIONS.iter().any(|d| lowered.contains(d)) => {
            GatewayError::Permanent(message)
        }
        _ => GatewayError::Transient(message),
    }
}

/// Telegram ids are integers; usernames like `@channel` pass through.
fn chat_ref(chat_id: &str) -> Value {
    chat_id
        .parse::<i64>()
        .map_or_else(|_| json!(chat_id), |id| json!(id))
}

fn numeric_id(field: &str, value: &str) -> std::result::Result<i64, GatewayError> {
    value
        .parse::<i64>()
        .map_err(|_| GatewayError::Permanent(format!("{field} is not numeric: {value}")))
}

#[async_trait]
impl ActionGateway for TelegramGateway {
    async fn delete_message(&self, chat_id: &str, message_id: &str) -> GatewayResult {
        let body = json!({
            "chat_id": chat_ref(chat_id),
            "message_id": numeric_id("message_id", message_id)?,
        });
        match self.call("deleteMessage", body).await {
            Err(GatewayError::Permanent(msg))
                if msg.to_lowercase().contains(MESSAGE_ALREADY_GONE) =>
            {
                debug!(chat_id, message_id, "message already deleted");
                Ok(())
            }
            other => other,
        }
    }

    async fn restrict_member(
        &self,
        chat_id: &str,
        user_id: &str,
        until: Option<DateTime<Utc>>,
    ) -> GatewayResult {
        let mut body = json!({
            "chat_id": chat_ref(chat_id),
            "user_id": numeric_id("user_id", user_id)?,
            "permissions": {
                "can_send_messages": false,
                "can_send_audios": false,
                "can_send_documents": false,
                "can_send_photos": false,
                "can_send_videos": false,
                "can_send_video_notes": false,
                "can_send_voice_notes": false,
                "can_send_polls": false,
                "can_send_other_messages": false,
                "can_add_web_page_previews": false,
            },
        });
        if let Some(until) = until {
            body["until_date"] = json!(until.timestamp());
        }
        self.call("restrictChatMember", body).await
    }

    async fn ban_member(&self, chat_id: &str, user_id: &str) -> GatewayResult {
        let body = json!({
            "chat_id": chat_ref(chat_id),
            "user_id": numeric_id("user_id", user_id)?,
        });
        self.call("banChatMember", body).await
    }

    async fn unban_member(&self, chat_id: &str, user_id: &str) -> GatewayResult {
        let body = json!({
            "chat_id": chat_ref(chat_id),
            "user_id": numeric_id("user_id", user_id)?,
            "only_if_banned": true,
        });
        self.call("unbanChatMember", body).await
    }

    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> GatewayResult {
        let mut body = json!({
            "chat_id": chat_ref(chat_id),
            "text": text,
        });
        if let Some(reply_to) = reply_to {
            body["reply_parameters"] = json!({
                "message_id": numeric_id("message_id", reply_to)?,
                "allow_sending_without_reply": true,
            });
        }
        self.call("sendMessage", body).await
    }
}
