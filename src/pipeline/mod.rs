//! Verdict pipeline: cache → circuit check → admission → classifier → fallback.
//!
//! Every path yields a [`Verdict`] tagged with where it came from. The local
//! [`PolicyRules`] are consulted whenever the classifier is skipped or
//! fails, so downstream trouble only degrades verdict quality.

pub mod rules;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::VerdictCache;
use crate::limiter::{CircuitState, RateLimiter};
use crate::model::{Job, Verdict, VerdictSource};
use crate::telemetry::metrics;
pub use rules::PolicyRules;

/// Why a classification attempt produced no verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    /// The call did not finish within the processing timeout.
    #[error("classifier timed out")]
    Timeout,
    /// The classifier answered with an error or an unusable response.
    #[error("classifier failed: {0}")]
    Failed(String),
}

/// The protected, costly content classifier.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Verdict, ClassifyError>;
}

/// Result of one evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub source: VerdictSource,
    /// Set when the classifier was skipped because the circuit was open.
    pub circuit_open: bool,
    pub elapsed: Duration,
}

pub struct VerdictPipeline {
    cache: Arc<VerdictCache>,
    limiter: Arc<RateLimiter>,
    classifier: Arc<dyn Classifier>,
    rules: PolicyRules,
    processing_timeout: Duration,
}

impl VerdictPipeline {
    pub fn new(
        cache: Arc<VerdictCache>,
        limiter: Arc<RateLimiter>,
        classifier: Arc<dyn Classifier>,
        rules: PolicyRules,
        processing_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            limiter,
            classifier,
            rules,
            processing_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<VerdictCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Evaluate a job's content. Jobs without text or caption are allowed
    /// by policy without touching the cache or the classifier.
    pub async fn evaluate_job(&self, job: &Job) -> Evaluation {
        match job.content() {
            Some(text) => self.evaluate(text).await,
            None => {
                let verdict = Verdict::allow("no text content");
                Self::finish(verdict, VerdictSource::Policy, false, Instant::now())
            }
        }
    }

    /// Produce a verdict for `text`.
    pub async fn evaluate(&self, text: &str) -> Evaluation {
        let started = Instant::now();

        if let Some(verdict) = self.cache.get(text) {
            return Self::finish(verdict, VerdictSource::Cache, false, started);
        }

        if self.limiter.circuit_state() == CircuitState::Open {
            debug!("circuit open, classifier skipped");
            let verdict = self.rules.evaluate(text);
            return Self::finish(verdict, VerdictSource::Policy, true, started);
        }

        // Dropping `admission` mid-call frees its half-open trial slot.
        let admission = match self.limiter.admit().await {
            Ok(admission) => admission,
            Err(reason) => {
                debug!(%reason, "classifier admission refused");
                let verdict = self.rules.evaluate(text);
                return Self::finish(verdict, VerdictSource::RateLimited, false, started);
            }
        };

        let outcome =
            match tokio::time::timeout(self.processing_timeout, self.classifier.classify(text))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ClassifyError::Timeout),
            };

        match outcome {
            Ok(verdict) => {
                admission.success();
                self.cache.set(text, verdict.clone(), None);
                Self::finish(verdict, VerdictSource::Classifier, false, started)
            }
            Err(e) => {
                admission.failure();
                warn!(error = %e, "classifier call failed, using policy rules");
                let verdict = self.rules.evaluate(text);
                Self::finish(verdict, VerdictSource::Policy, false, started)
            }
        }
    }

    fn finish(
        verdict: Verdict,
        source: VerdictSource,
        circuit_open: bool,
        started: Instant,
    ) -> Evaluation {
        let elapsed = started.elapsed();
        metrics::verdicts().add(
            1,
            &[
                KeyValue::new("source", source.to_string()),
                KeyValue::new("outcome", verdict.outcome.to_string()),
            ],
        );
        metrics::operation_duration_ms().record(
            elapsed.as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "pipeline.evaluate")],
        );
        Evaluation {
            verdict,
            source,
            circuit_open,
            elapsed,
        }
    }
}
