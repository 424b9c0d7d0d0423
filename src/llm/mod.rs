//! LLM-backed classifier via rig-core.
//!
//! The model is asked for a single JSON object:
//!
//! ```json
//! {"outcome": "block", "confidence": 0.93, "reason": "crypto scam",
//!  "categories": {"spam": 0.9, "scam": 0.8}}
//! ```
//!
//! Anything else (prose around the object is tolerated) is a
//! [`ClassifyError::Failed`], which the pipeline treats like any other
//! classifier failure.

use std::collections::BTreeMap;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use rig::agent::Agent;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::anthropic;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::model::{Outcome, Verdict};
use crate::pipeline::{ClassifyError, Classifier};
use crate::telemetry::{genai, metrics};

const PROVIDER: &str = "anthropic";

const PREAMBLE: &str = "You are a content moderation classifier for group chats. \
Classify the user's message. Respond with exactly one JSON object and nothing else, \
with the keys: \"outcome\" (one of \"allow\", \"block\", \"review\"), \"confidence\" \
(number between 0 and 1), \"reason\" (short string), and \"categories\" (object mapping \
category names such as spam, scam, harassment, hate, sexual, violence to scores between \
0 and 1). Use \"block\" only for clear violations and \"review\" when unsure.";

/// Create an Anthropic client from a secret API key.
pub fn anthropic_client(api_key: &SecretString) -> Result<anthropic::Client> {
    anthropic::Client::new(api_key.expose_secret())
        .map_err(|e| Error::Config(format!("failed to create Anthropic client: {e}")))
}

/// [`Classifier`] backed by an Anthropic model.
pub struct LlmClassifier {
    agent: Agent<anthropic::completion::CompletionModel>,
    model: String,
}

impl LlmClassifier {
    pub fn new(api_key: &SecretString, model: impl Into<String>) -> Result<Self> {
        let model = model.into();
        let client = anthropic_client(api_key)?;
        let agent = client
            .agent(&model)
            .preamble(PREAMBLE)
            .temperature(0.0)
            .max_tokens(256)
            .build();
        Ok(Self { agent, model })
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, text: &str) -> std::result::Result<Verdict, ClassifyError> {
        let span = genai::start_chat_span(&self.model, PROVIDER);
        let started = Instant::now();

        let response = async { self.agent.prompt(text).await }
            .instrument(span.clone())
            .await
            .map_err(|e| ClassifyError::Failed(e.to_string()));

        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("operation", "classifier.chat"),
                KeyValue::new("model", self.model.clone()),
            ],
        );

        let result = response.and_then(|raw| parse_verdict(&raw));
        genai::record_finish_reason(
            &span,
            match &result {
                Ok(_) => "stop",
                Err(_) => "error",
            },
        );
        result
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    outcome: Outcome,
    confidence: f32,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    categories: BTreeMap<String, f32>,
}

/// Extract the verdict object from a model completion.
pub fn parse_verdict(raw: &str) -> std::result::Result<Verdict, ClassifyError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &raw[s..=e],
        _ => {
            return Err(ClassifyError::Failed(
                "no JSON object in classifier response".to_string(),
            ));
        }
    };

    let parsed: RawVerdict = serde_json::from_str(json)
        .map_err(|e| ClassifyError::Failed(format!("malformed classifier verdict: {e}")))?;

    if !parsed.confidence.is_finite() {
        return Err(ClassifyError::Failed(
            "non-numeric classifier confidence".to_string(),
        ));
    }

    let reason = if parsed.reason.is_empty() {
        format!("classifier: {}", parsed.outcome)
    } else {
        parsed.reason
    };

    let mut verdict = Verdict::new(parsed.outcome, parsed.confidence, reason);
    for (category, score) in parsed.categories {
        verdict = verdict.with_score(category, score.clamp(0.0, 1.0));
    }
    Ok(verdict)
}
