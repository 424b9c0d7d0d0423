//! HTTP service shell: health, readiness, metrics, and a partition lookup.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{CacheMetrics, VerdictCache};
use crate::engine::{ManagerMetrics, PartitionManager, SubmitResult};
use crate::error::{Error, Result};
use crate::limiter::{LimiterMetrics, RateLimiter};
use crate::model::Job;
use crate::outbox::{Outbox, OutboxMetrics};

/// Shared handles for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PartitionManager>,
    pub cache: Arc<VerdictCache>,
    pub limiter: Arc<RateLimiter>,
    pub outbox: Arc<Outbox>,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub partitions: ManagerMetrics,
    pub cache: CacheMetrics,
    pub limiter: LimiterMetrics,
    pub outbox: Option<OutboxMetrics>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/partitions/{conversation_id}", get(partition_of))
        .route("/jobs", post(submit_job))
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn readyz(State(state): State<AppState>) -> Response {
    let readiness = state.manager.readiness().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness)).into_response()
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let outbox = match state.outbox.metrics().await {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!(error = %e, "outbox metrics unavailable");
            None
        }
    };
    Json(MetricsSnapshot {
        partitions: state.manager.metrics().await,
        cache: state.cache.metrics(),
        limiter: state.limiter.metrics(),
        outbox,
    })
}

async fn partition_of(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state.manager.partition_for(&conversation_id).await {
        Some((partition, partition_count)) => Json(json!({
            "conversation_id": conversation_id,
            "partition": partition,
            "partition_count": partition_count,
        }))
        .into_response(),
        None => unavailable("partition manager is not running"),
    }
}

async fn submit_job(State(state): State<AppState>, Json(job): Json<Job>) -> Response {
    match state.manager.submit(job).await {
        Ok(SubmitResult::Queued {
            key,
            partition,
            priority,
        }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "queued",
                "key": key.to_string(),
                "partition": partition,
                "priority": priority,
            })),
        )
            .into_response(),
        Ok(SubmitResult::Duplicate { key, partition }) => (
            StatusCode::OK,
            Json(json!({
                "status": "duplicate",
                "key": key.to_string(),
                "partition": partition,
            })),
        )
            .into_response(),
        Err(Error::ShuttingDown) => unavailable("shutting down"),
        Err(Error::Resizing) => unavailable("resizing partitions"),
        Err(e) => {
            warn!(error = %e, "job submission failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

fn unavailable(reason: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": reason })),
    )
        .into_response()
}
