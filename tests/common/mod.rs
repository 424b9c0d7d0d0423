//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatwarden::model::{Outcome, Verdict};
use chatwarden::outbox::gateway::{ActionGateway, GatewayError, GatewayResult};
use chatwarden::pipeline::{Classifier, ClassifyError};
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub enum Mode {
    /// Answer with the configured outcome.
    Answer(Outcome),
    /// Answer `Block` for text containing "spam", `Allow` otherwise.
    SpamWord,
    Fail,
    /// Never answer.
    Hang,
}

/// Classifier with scripted behavior that records every call.
pub struct FakeClassifier {
    mode: Mutex<Mode>,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<String>>,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl FakeClassifier {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode: Mutex::new(mode),
            delay: Duration::ZERO,
            gate: None,
            calls: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Each call waits for a permit from `gate` before answering.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn classify(&self, text: &str) -> Result<Verdict, ClassifyError> {
        self.calls.lock().unwrap().push(text.to_string());
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mode = *self.mode.lock().unwrap();
        let result = match mode {
            Mode::Answer(outcome) => Ok(Verdict::new(outcome, 0.95, "scripted")),
            Mode::SpamWord if text.contains("spam") => {
                Ok(Verdict::new(Outcome::Block, 0.97, "spam"))
            }
            Mode::SpamWord => Ok(Verdict::new(Outcome::Allow, 0.9, "clean")),
            Mode::Fail => Err(ClassifyError::Failed("upstream 500".to_string())),
            Mode::Hang => std::future::pending().await,
        };
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Gateway that records calls and replays scripted results (then succeeds).
#[derive(Default)]
pub struct FakeGateway {
    script: Mutex<VecDeque<GatewayResult>>,
    calls: Mutex<Vec<String>>,
    mute_until: Mutex<Option<DateTime<Utc>>>,
    delay: Duration,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn script(&self, results: impl IntoIterator<Item = GatewayResult>) {
        self.script.lock().unwrap().extend(results);
    }

    pub fn fail_transient(&self, times: usize) {
        self.script(
            (0..times).map(|i| Err(GatewayError::Transient(format!("429 too many requests #{i}")))),
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mute_until(&self) -> Option<DateTime<Utc>> {
        *self.mute_until.lock().unwrap()
    }

    async fn record(&self, call: String) -> GatewayResult {
        self.calls.lock().unwrap().push(call);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl ActionGateway for FakeGateway {
    async fn delete_message(&self, chat_id: &str, message_id: &str) -> GatewayResult {
        self.record(format!("delete:{chat_id}:{message_id}")).await
    }

    async fn restrict_member(
        &self,
        chat_id: &str,
        user_id: &str,
        until: Option<DateTime<Utc>>,
    ) -> GatewayResult {
        *self.mute_until.lock().unwrap() = until;
        self.record(format!("restrict:{chat_id}:{user_id}")).await
    }

    async fn ban_member(&self, chat_id: &str, user_id: &str) -> GatewayResult {
        self.record(format!("ban:{chat_id}:{user_id}")).await
    }

    async fn unban_member(&self, chat_id: &str, user_id: &str) -> GatewayResult {
        self.record(format!("unban:{chat_id}:{user_id}")).await
    }

    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> GatewayResult {
        self.record(format!(
            "send:{chat_id}:{}:{text}",
            reply_to.unwrap_or("-")
        ))
        .await
    }
}
