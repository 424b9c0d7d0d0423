//! HTTP surface tests driven through `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chatwarden::cache::{CacheConfig, VerdictCache};
use chatwarden::config::PipelineSettings;
use chatwarden::engine::{PartitionManager, Processor};
use chatwarden::event::EventBus;
use chatwarden::limiter::{LimiterConfig, RateLimiter};
use chatwarden::model::Outcome;
use chatwarden::outbox::store::MemoryOutboxStore;
use chatwarden::outbox::{Outbox, OutboxConfig};
use chatwarden::pipeline::VerdictPipeline;
use chatwarden::pipeline::rules::PolicyRules;
use chatwarden::queue::MemoryBackend;
use chatwarden::router::shard_of;
use chatwarden::server::{AppState, router};
use common::{FakeClassifier, FakeGateway, Mode};
use serde_json::{Value, json};
use tower::ServiceExt;

struct Harness {
    app: Router,
    state: AppState,
    backend: Arc<MemoryBackend>,
}

async fn harness(partitions: u32) -> Harness {
    let cache = Arc::new(VerdictCache::new(CacheConfig::default()));
    let limiter = Arc::new(RateLimiter::new(LimiterConfig::default()));
    let pipeline = Arc::new(VerdictPipeline::new(
        Arc::clone(&cache),
        Arc::clone(&limiter),
        Arc::new(FakeClassifier::new(Mode::Answer(Outcome::Allow))),
        PolicyRules::default(),
        Duration::from_secs(5),
    ));
    let outbox = Arc::new(Outbox::new(
        Arc::new(MemoryOutboxStore::new()),
        Arc::new(FakeGateway::new()),
        OutboxConfig::default(),
    ));
    let backend = Arc::new(MemoryBackend::new());
    let manager = PartitionManager::start(
        PipelineSettings {
            partition_count: partitions,
            total_concurrency: partitions as usize * 2,
            partition_concurrency_cap: None,
            processing_timeout: Duration::from_secs(5),
        },
        Arc::new(Processor::new(pipeline, Some(Arc::clone(&outbox)))),
        backend.clone(),
        EventBus::default(),
    )
    .await
    .unwrap();

    let state = AppState {
        manager: Arc::new(manager),
        cache,
        limiter,
        outbox,
    };
    Harness {
        app: router(state.clone()),
        state,
        backend,
    }
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    read(response).await
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    read(response).await
}

async fn read(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn job_body(conversation: &str, message: &str) -> Value {
    json!({
        "conversationId": conversation,
        "messageId": message,
        "userId": "42",
        "text": "hello everyone",
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })
}

// ---------------------------------------------------------------------------
// Health checks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn healthz_is_always_ok() {
    let h = harness(2).await;
    let (status, body) = get(&h.app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn readyz_follows_backend_health() {
    let h = harness(2).await;

    let (status, body) = get(&h.app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
    assert_eq!(body["accepting"], true);

    h.backend.set_healthy(false);
    let (status, body) = get(&h.app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["backend_ok"], false);
    assert!(body["backend_error"].is_string());
}

#[tokio::test]
async fn readyz_fails_after_shutdown() {
    let h = harness(1).await;
    h.state
        .manager
        .shutdown(Duration::from_secs(5))
        .await
        .unwrap();

    let (status, body) = get(&h.app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["accepting"], false);
}

// ---------------------------------------------------------------------------
// Partitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn partition_lookup_matches_router() {
    let h = harness(4).await;
    for conversation in ["-1001234567890", "chat-a", "42"] {
        let (status, body) = get(&h.app, &format!("/partitions/{conversation}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conversation_id"], conversation);
        assert_eq!(body["partition"], shard_of(conversation, 4));
        assert_eq!(body["partition_count"], 4);
    }
}

#[tokio::test]
async fn partition_lookup_unavailable_after_shutdown() {
    let h = harness(2).await;
    h.state
        .manager
        .shutdown(Duration::from_secs(5))
        .await
        .unwrap();
    let (status, _) = get(&h.app, "/partitions/chat-a").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_then_duplicate() {
    let h = harness(4).await;

    let (status, body) = post_json(&h.app, "/jobs", job_body("-100777", "5")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["key"], "-100777:5");
    assert_eq!(body["partition"], shard_of("-100777", 4));
    assert!(body["priority"].as_u64().unwrap() > 0);

    let (status, body) = post_json(&h.app, "/jobs", job_body("-100777", "5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");
    assert_eq!(body["partition"], shard_of("-100777", 4));
}

#[tokio::test]
async fn malformed_job_is_rejected() {
    let h = harness(1).await;
    let (status, _) = post_json(&h.app, "/jobs", json!({ "text": "no identity" })).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn submit_after_shutdown_is_unavailable() {
    let h = harness(1).await;
    h.state
        .manager
        .shutdown(Duration::from_secs(5))
        .await
        .unwrap();

    let (status, body) = post_json(&h.app, "/jobs", job_body("c", "1")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "shutting down");
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metrics_snapshot_has_every_component() {
    let h = harness(3).await;
    post_json(&h.app, "/jobs", job_body("m", "1")).await;

    let (status, body) = get(&h.app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["partitions"]["partition_count"], 3);
    assert_eq!(body["partitions"]["partitions"].as_array().unwrap().len(), 3);
    assert!(body["cache"]["hit_rate"].is_number());
    assert_eq!(body["limiter"]["circuit_state"], "closed");
    assert_eq!(body["outbox"]["total"], 0);
}
