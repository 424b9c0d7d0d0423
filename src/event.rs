//! Structured events emitted by the pipeline.
//!
//! Consumers subscribe to the bus to build dashboards, alerting, or audit
//! logs. Circuit-breaker state changes are delivered here rather than through
//! callbacks so the breaker stays usable from any runtime shape.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::limiter::CircuitState;
use crate::model::{ActionType, VerdictSource};

/// A structured event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    CircuitTransition {
        from: CircuitState,
        to: CircuitState,
    },
    JobQueued {
        key: String,
        partition: u32,
        priority: u32,
    },
    JobDuplicate {
        key: String,
        partition: u32,
    },
    JobCompleted {
        key: String,
        partition: u32,
        source: VerdictSource,
        duration_ms: u64,
    },
    JobFailed {
        key: String,
        partition: u32,
        error: String,
    },
    ShardMismatch {
        key: String,
        expected: u32,
        observed: u32,
    },
    ActionCompleted {
        id: String,
        action: ActionType,
        attempts: u32,
    },
    ActionFailed {
        id: String,
        action: ActionType,
        error: String,
        attempts: u32,
        terminal: bool,
    },
}

/// Broadcast bus for [`Event`]s. Cheap to clone; all clones share one
/// sequence counter and one channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Never blocks; events are dropped when nobody listens.
    pub fn publish(&self, kind: EventKind) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.tx.send(Event {
            seq,
            timestamp: Utc::now(),
            kind,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
