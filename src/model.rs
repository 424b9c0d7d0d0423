//! Core data model.
//!
//! A job is one inbound chat message that needs a moderation verdict. It has
//! identity (conversation + message), provenance (user, tenant), content, and
//! the time it was submitted upstream.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of moderation work. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Chat / conversation the message belongs to. Drives partition placement.
    pub conversation_id: String,

    /// Platform message id, unique within the conversation.
    pub message_id: String,

    /// Author of the message.
    pub user_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Media>,

    /// Upstream submission time, carried on the wire as epoch milliseconds.
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub submitted_at: DateTime<Utc>,

    /// Administrative messages outrank regular traffic when scheduling.
    #[serde(default)]
    pub admin: bool,
}

/// Attached media; only the caption is moderated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    #[serde(rename = "type")]
    pub kind: String,
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl Job {
    pub fn new(
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            user_id: user_id.into(),
            tenant_id: None,
            text: None,
            media: None,
            submitted_at: Utc::now(),
            admin: false,
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn media(mut self, media: Media) -> Self {
        self.media = Some(media);
        self
    }

    pub fn submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.submitted_at = at;
        self
    }

    pub fn admin(mut self, admin: bool) -> Self {
        self.admin = admin;
        self
    }

    /// Deduplication identity for the whole pipeline.
    pub fn key(&self) -> JobKey {
        JobKey {
            conversation_id: self.conversation_id.clone(),
            message_id: self.message_id.clone(),
        }
    }

    /// The text that gets moderated: message text, else the media caption.
    pub fn content(&self) -> Option<&str> {
        self.text
            .as_deref()
            .or_else(|| self.media.as_ref().and_then(|m| m.caption.as_deref()))
            .filter(|s| !s.trim().is_empty())
    }

    /// Bot-style commands ("/ban", "/settings") are scheduled ahead of chatter.
    pub fn is_command(&self) -> bool {
        self.text
            .as_deref()
            .is_some_and(|t| t.trim_start().starts_with('/'))
    }
}

/// `(conversation_id, message_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub conversation_id: String,
    pub message_id: String,
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.conversation_id, self.message_id)
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Moderation outcome for a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allow,
    Block,
    Review,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Allow => "allow",
            Outcome::Block => "block",
            Outcome::Review => "review",
        };
        write!(f, "{s}")
    }
}

/// Result of evaluating content. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub outcome: Outcome,
    pub confidence: f32,
    pub reason: String,
    #[serde(default)]
    pub scores: BTreeMap<String, f32>,
    #[serde(default)]
    pub rules_matched: Vec<String>,
}

impl Verdict {
    pub fn new(outcome: Outcome, confidence: f32, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            scores: BTreeMap::new(),
            rules_matched: Vec::new(),
        }
    }

    pub fn allow(reason: impl Into<String>) -> Self {
        Self::new(Outcome::Allow, 0.5, reason)
    }

    pub fn with_score(mut self, name: impl Into<String>, score: f32) -> Self {
        self.scores.insert(name.into(), score);
        self
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rules_matched.push(rule.into());
        self
    }

    /// The outbox action this verdict calls for, if any.
    pub fn required_action(&self) -> Option<ActionType> {
        match self.outcome {
            Outcome::Allow => None,
            Outcome::Block => Some(ActionType::Delete),
            Outcome::Review => Some(ActionType::Warn),
        }
    }
}

/// Which path produced a verdict. Preserved end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerdictSource {
    Cache,
    Classifier,
    Policy,
    RateLimited,
}

impl std::fmt::Display for VerdictSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerdictSource::Cache => "cache",
            VerdictSource::Classifier => "classifier",
            VerdictSource::Policy => "policy",
            VerdictSource::RateLimited => "rate-limited",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Moderation side effects executed through the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Delete,
    Mute,
    Kick,
    Ban,
    Warn,
}

impl ActionType {
    pub const ALL: [ActionType; 5] = [
        ActionType::Delete,
        ActionType::Mute,
        ActionType::Kick,
        ActionType::Ban,
        ActionType::Warn,
    ];
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionType::Delete => "delete",
            ActionType::Mute => "mute",
            ActionType::Kick => "kick",
            ActionType::Ban => "ban",
            ActionType::Warn => "warn",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ActionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .into_iter()
            .find(|a| a.to_string() == s)
            .ok_or_else(|| Error::Other(format!("unknown action type: {s}")))
    }
}
