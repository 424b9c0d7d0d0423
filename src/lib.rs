//! # chatwarden
//!
//! Partitioned moderation pipeline for high-volume chat.
//!
//! Messages are sharded by conversation onto a fixed set of partitions
//! (durably queued through pgmq), evaluated by a classifier guarded by a
//! token bucket and circuit breaker, cached by content, and acted on
//! through an idempotent outbox.

pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod limiter;
pub mod llm;
pub mod model;
pub mod outbox;
pub mod pipeline;
pub mod queue;
pub mod router;
pub mod server;
pub mod telemetry;
