//! Integration tests for the partition manager.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chatwarden::cache::{CacheConfig, VerdictCache};
use chatwarden::config::PipelineSettings;
use chatwarden::engine::manager::is_hotspot;
use chatwarden::engine::priority::{COMMAND_BOOST, FRESHNESS_WINDOW_SECS, priority_of};
use chatwarden::engine::{PartitionManager, Processor, SubmitResult};
use chatwarden::error::Error;
use chatwarden::event::{Event, EventBus, EventKind};
use chatwarden::limiter::{LimiterConfig, RateLimiter};
use chatwarden::model::{Job, Outcome, VerdictSource};
use chatwarden::outbox::store::{MemoryOutboxStore, OutboxStore};
use chatwarden::outbox::{Outbox, OutboxConfig, OutboxStatus};
use chatwarden::pipeline::VerdictPipeline;
use chatwarden::pipeline::rules::PolicyRules;
use chatwarden::queue::{MemoryBackend, queue_name};
use chatwarden::router::shard_of;
use chrono::Utc;
use common::{FakeClassifier, FakeGateway, Mode};
use tokio::sync::Semaphore;
use tokio::sync::broadcast;

struct Harness {
    manager: PartitionManager,
    classifier: Arc<FakeClassifier>,
    gateway: Arc<FakeGateway>,
    outbox: Arc<Outbox>,
    backend: Arc<MemoryBackend>,
    events: EventBus,
}

fn settings(partitions: u32, concurrency: usize) -> PipelineSettings {
    PipelineSettings {
        partition_count: partitions,
        total_concurrency: concurrency,
        partition_concurrency_cap: None,
        processing_timeout: Duration::from_secs(30),
    }
}

async fn start_with(
    settings: PipelineSettings,
    classifier: FakeClassifier,
    backend: Arc<MemoryBackend>,
) -> Harness {
    start_with_outbox(
        settings,
        classifier,
        backend,
        Arc::new(MemoryOutboxStore::new()),
        FakeGateway::new(),
        OutboxConfig::default(),
    )
    .await
}

async fn start_with_outbox(
    settings: PipelineSettings,
    classifier: FakeClassifier,
    backend: Arc<MemoryBackend>,
    store: Arc<MemoryOutboxStore>,
    gateway: FakeGateway,
    outbox_config: OutboxConfig,
) -> Harness {
    let classifier = Arc::new(classifier);
    let gateway = Arc::new(gateway);
    let events = EventBus::new(4096);

    let pipeline = Arc::new(VerdictPipeline::new(
        Arc::new(VerdictCache::new(CacheConfig::default())),
        Arc::new(RateLimiter::new(LimiterConfig {
            bucket_capacity: 1000.0,
            tokens_per_second: 1000.0,
            ..LimiterConfig::default()
        })),
        classifier.clone(),
        PolicyRules::default(),
        settings.processing_timeout,
    ));
    let outbox = Arc::new(Outbox::with_events(
        store,
        gateway.clone(),
        outbox_config,
        events.clone(),
    ));
    let processor = Arc::new(Processor::new(pipeline, Some(Arc::clone(&outbox))));

    let manager = PartitionManager::start(settings, processor, backend.clone(), events.clone())
        .await
        .expect("manager starts");

    Harness {
        manager,
        classifier,
        gateway,
        outbox,
        backend,
        events,
    }
}

async fn start(settings: PipelineSettings, classifier: FakeClassifier) -> Harness {
    start_with(settings, classifier, Arc::new(MemoryBackend::new())).await
}

fn job(conversation: &str, message: &str, text: &str) -> Job {
    Job::new(conversation, message, "7").text(text)
}

/// Wait for the next event matching `pred`.
async fn wait_for<F>(rx: &mut broadcast::Receiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&EventKind) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event bus open");
            if pred(&event.kind) {
                return event;
            }
        }
    })
    .await
    .expect("event within 5s")
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition within 5s");
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_routes_by_conversation() {
    let h = start(settings(4, 8), FakeClassifier::new(Mode::Answer(Outcome::Allow))).await;

    for i in 0..20 {
        let conversation = format!("-100{i}");
        let result = h
            .manager
            .submit(job(&conversation, "1", "hello"))
            .await
            .unwrap();
        assert_eq!(result.partition(), shard_of(&conversation, 4));
        assert!(!result.is_duplicate());
        assert_eq!(
            h.manager.partition_for(&conversation).await,
            Some((shard_of(&conversation, 4), 4))
        );
    }
    h.manager.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn clean_message_completes_without_action() {
    let h = start(settings(2, 2), FakeClassifier::new(Mode::SpamWord)).await;
    let mut rx = h.events.subscribe();

    h.manager
        .submit(job("chat-a", "1", "good morning"))
        .await
        .unwrap();
    let done = wait_for(&mut rx, |k| matches!(k, EventKind::JobCompleted { .. })).await;
    match done.kind {
        EventKind::JobCompleted { key, source, .. } => {
            assert_eq!(key, "chat-a:1");
            assert_eq!(source, VerdictSource::Classifier);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.gateway.calls().is_empty());
    h.manager.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn blocked_message_is_deleted_through_outbox() {
    let h = start(settings(2, 2), FakeClassifier::new(Mode::SpamWord)).await;
    let mut rx = h.events.subscribe();

    h.manager
        .submit(job("-100555", "77", "this is spam"))
        .await
        .unwrap();
    wait_for(&mut rx, |k| matches!(k, EventKind::JobCompleted { .. })).await;

    assert_eq!(h.gateway.calls(), vec!["delete:-100555:77".to_string()]);
    let entry = h
        .outbox
        .get("-100555:77:delete")
        .await
        .unwrap()
        .expect("outbox entry");
    assert_eq!(entry.status, OutboxStatus::Completed);
    h.manager.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn duplicates_are_ignored_while_queued_and_after_completion() {
    let gate = Arc::new(Semaphore::new(0));
    let h = start(
        settings(1, 1),
        FakeClassifier::new(Mode::SpamWord).with_gate(gate.clone()),
    )
    .await;
    let mut rx = h.events.subscribe();

    let first = h.manager.submit(job("chat", "1", "spam")).await.unwrap();
    assert!(matches!(first, SubmitResult::Queued { .. }));

    // In flight.
    wait_until(|| h.classifier.call_count() == 1).await;
    let again = h.manager.submit(job("chat", "1", "spam")).await.unwrap();
    assert!(again.is_duplicate());

    gate.add_permits(10);
    wait_for(&mut rx, |k| matches!(k, EventKind::JobCompleted { .. })).await;

    // Recently completed.
    let late = h.manager.submit(job("chat", "1", "spam")).await.unwrap();
    assert!(late.is_duplicate());
    assert_eq!(h.classifier.call_count(), 1);
    assert_eq!(h.gateway.calls().len(), 1, "side effect applied once");

    // Same message id in another conversation is a different job.
    let other = h.manager.submit(job("chat-2", "1", "spam")).await.unwrap();
    assert!(!other.is_duplicate());
    h.manager.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn submission_events_are_published() {
    let h = start(settings(1, 1), FakeClassifier::new(Mode::Answer(Outcome::Allow))).await;
    let mut rx = h.events.subscribe();

    h.manager.submit(job("c", "1", "hi")).await.unwrap();
    h.manager.submit(job("c", "1", "hi")).await.unwrap();

    let queued = wait_for(&mut rx, |k| matches!(k, EventKind::JobQueued { .. })).await;
    let duplicate = wait_for(&mut rx, |k| matches!(k, EventKind::JobDuplicate { .. })).await;
    assert!(duplicate.seq > queued.seq);
    h.manager.shutdown(Duration::from_secs(5)).await.unwrap();
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[test]
fn priority_scores() {
    let now = Utc::now();
    let fresh = Job::new("c", "1", "u").text("hi").submitted_at(now);
    let old = Job::new("c", "2", "u")
        .text("hi")
        .submitted_at(now - chrono::Duration::seconds(200));
    let stale = Job::new("c", "3", "u")
        .text("hi")
        .submitted_at(now - chrono::Duration::hours(2));
    let command = Job::new("c", "4", "u").text("/ban @troll").submitted_at(now);
    let admin = Job::new("c", "5", "u").admin(true).submitted_at(stale.submitted_at);
    let future = Job::new("c", "6", "u")
        .text("hi")
        .submitted_at(now + chrono::Duration::seconds(30));

    assert_eq!(priority_of(&fresh, now), FRESHNESS_WINDOW_SECS as u32);
    assert_eq!(priority_of(&old, now), 100);
    assert_eq!(priority_of(&stale, now), 0);
    assert_eq!(priority_of(&command, now), COMMAND_BOOST + 300);
    assert_eq!(priority_of(&admin, now), COMMAND_BOOST);
    assert_eq!(priority_of(&future, now), 300);
    assert!(priority_of(&admin, now) > priority_of(&fresh, now));
}

#[tokio::test]
async fn dispatch_follows_priority_then_arrival() {
    let gate = Arc::new(Semaphore::new(0));
    let h = start(
        settings(1, 1),
        FakeClassifier::new(Mode::Answer(Outcome::Allow)).with_gate(gate.clone()),
    )
    .await;
    let mut rx = h.events.subscribe();
    let now = Utc::now();

    // Occupy the only worker.
    h.manager.submit(job("c", "0", "warmup")).await.unwrap();
    wait_until(|| h.classifier.call_count() == 1).await;

    let backlog = [
        ("1", "stale a", now - chrono::Duration::hours(1)),
        ("2", "older", now - chrono::Duration::seconds(200)),
        ("3", "/status", now - chrono::Duration::hours(1)),
        ("4", "stale b", now - chrono::Duration::hours(1)),
        ("5", "fresh", now),
    ];
    for (id, text, at) in backlog {
        h.manager
            .submit(job("c", id, text).submitted_at(at))
            .await
            .unwrap();
    }

    gate.add_permits(100);
    for _ in 0..6 {
        wait_for(&mut rx, |k| matches!(k, EventKind::JobCompleted { .. })).await;
    }

    assert_eq!(
        h.classifier.calls(),
        ["warmup", "/status", "fresh", "older", "stale a", "stale b"]
            .map(String::from)
            .to_vec()
    );
    h.manager.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn in_flight_jobs_respect_concurrency() {
    let h = start(
        settings(1, 2),
        FakeClassifier::new(Mode::Answer(Outcome::Allow)).with_delay(Duration::from_millis(30)),
    )
    .await;
    let mut rx = h.events.subscribe();

    for i in 0..8 {
        h.manager
            .submit(job("busy-chat", &i.to_string(), &format!("message {i}")))
            .await
            .unwrap();
    }
    for _ in 0..8 {
        wait_for(&mut rx, |k| matches!(k, EventKind::JobCompleted { .. })).await;
    }

    assert!(h.classifier.max_concurrent() <= 2);
    // Counters settle just after the completion event.
    let metrics = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let m = h.manager.metrics().await;
            if m.partitions[0].completed == 8 {
                break m;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("counters settle");
    assert_eq!(metrics.partitions[0].completed, 8);
    assert_eq!(metrics.partitions[0].in_flight, 0);
    assert_eq!(metrics.partitions[0].concurrency, 2);
    assert!(metrics.partitions[0].avg_latency_ms >= 30.0);
    h.manager.shutdown(Duration::from_secs(5)).await.unwrap();
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_settings_refuse_to_start() {
    let err = PartitionManager::start(
        settings(4, 2),
        Arc::new(Processor::new(
            Arc::new(VerdictPipeline::new(
                Arc::new(VerdictCache::new(CacheConfig::default())),
                Arc::new(RateLimiter::new(LimiterConfig::default())),
                Arc::new(FakeClassifier::new(Mode::Fail)),
                PolicyRules::default(),
                Duration::from_secs(1),
            )),
            None,
        )),
        Arc::new(MemoryBackend::new()),
        EventBus::default(),
    )
    .await
    .err()
    .expect("C < N is rejected");
    assert!(matches!(err, Error::Config(_)));

    let zero = PipelineSettings {
        partition_count: 0,
        ..settings(1, 1)
    };
    assert!(matches!(zero.validate(), Err(Error::Config(_))));
}

#[tokio::test]
async fn shutdown_drains_queued_work() {
    let h = start(
        settings(2, 2),
        FakeClassifier::new(Mode::Answer(Outcome::Allow)).with_delay(Duration::from_millis(20)),
    )
    .await;

    for i in 0..10 {
        h.manager
            .submit(job(&format!("chat-{}", i % 3), &i.to_string(), &format!("text {i}")))
            .await
            .unwrap();
    }
    h.manager.shutdown(Duration::from_secs(5)).await.unwrap();

    assert_eq!(h.classifier.call_count(), 10);
    for index in 0..2 {
        assert_eq!(h.backend.pending(&queue_name(index)), 0);
    }

    let err = h.manager.submit(job("chat-0", "99", "late")).await.unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
    assert!(matches!(
        h.manager.shutdown(Duration::from_secs(1)).await,
        Err(Error::ShuttingDown)
    ));
    assert_eq!(h.manager.partition_count().await, None);
    assert!(!h.manager.readiness().await.accepting);
}

#[tokio::test]
async fn timed_out_shutdown_leaves_jobs_for_recovery() {
    let backend = Arc::new(MemoryBackend::new());
    let h = start_with(
        settings(1, 1),
        FakeClassifier::new(Mode::Hang),
        backend.clone(),
    )
    .await;

    h.manager.submit(job("chat", "1", "stuck")).await.unwrap();
    h.manager.submit(job("chat", "2", "behind it")).await.unwrap();
    wait_until(|| h.classifier.call_count() == 1).await;

    h.manager.shutdown(Duration::from_millis(100)).await.unwrap();
    assert_eq!(backend.pending(&queue_name(0)), 2, "nothing acknowledged");

    // A new manager on the same backend picks both jobs up again.
    let restarted = start_with(
        settings(1, 1),
        FakeClassifier::new(Mode::Answer(Outcome::Allow)),
        backend.clone(),
    )
    .await;
    wait_until(|| restarted.classifier.call_count() == 2).await;
    wait_until(|| backend.pending(&queue_name(0)) == 0).await;
    restarted
        .manager
        .shutdown(Duration::from_secs(5))
        .await
        .unwrap();
}

#[tokio::test]
async fn interrupted_action_is_retried_after_restart() {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(MemoryOutboxStore::new());
    let outbox_config = OutboxConfig {
        retry_backoff: Duration::from_millis(20),
        claim_lease: Duration::from_millis(200),
        ..OutboxConfig::default()
    };

    // The gateway call never returns, so shutdown cancels the job mid-action.
    let h = start_with_outbox(
        settings(1, 1),
        FakeClassifier::new(Mode::SpamWord),
        backend.clone(),
        store.clone(),
        FakeGateway::with_delay(Duration::from_secs(3600)),
        outbox_config.clone(),
    )
    .await;
    h.manager.submit(job("-100", "1", "spam spam")).await.unwrap();
    wait_until(|| h.gateway.calls().len() == 1).await;
    h.manager.shutdown(Duration::from_millis(100)).await.unwrap();

    let stuck = store.get("-100:1:delete").await.unwrap().unwrap();
    assert_eq!(stuck.status, OutboxStatus::Processing);
    assert_eq!(backend.pending(&queue_name(0)), 1);

    let restarted = start_with_outbox(
        settings(1, 1),
        FakeClassifier::new(Mode::SpamWord),
        backend.clone(),
        store.clone(),
        FakeGateway::new(),
        outbox_config,
    )
    .await;
    wait_until(|| backend.pending(&queue_name(0)) == 0).await;

    assert_eq!(restarted.gateway.calls(), vec!["delete:-100:1".to_string()]);
    let done = store.get("-100:1:delete").await.unwrap().unwrap();
    assert_eq!(done.status, OutboxStatus::Completed);
    assert_eq!(done.retry_count, 2);
    restarted
        .manager
        .shutdown(Duration::from_secs(5))
        .await
        .unwrap();
}

#[tokio::test]
async fn readers_are_not_blocked_by_a_slow_drain() {
    let h = start(settings(1, 1), FakeClassifier::new(Mode::Hang)).await;
    h.manager.submit(job("chat", "1", "stuck")).await.unwrap();
    wait_until(|| h.classifier.call_count() == 1).await;

    let (stopped, (readiness, metrics, submitted)) = tokio::join!(
        h.manager.shutdown(Duration::from_secs(2)),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let quick = Duration::from_millis(500);
            let readiness = tokio::time::timeout(quick, h.manager.readiness())
                .await
                .expect("readiness answers during drain");
            let metrics = tokio::time::timeout(quick, h.manager.metrics())
                .await
                .expect("metrics answer during drain");
            let submitted = tokio::time::timeout(quick, h.manager.submit(job("chat", "2", "late")))
                .await
                .expect("submit answers during drain");
            (readiness, metrics, submitted)
        }
    );

    stopped.unwrap();
    assert!(!readiness.accepting);
    assert!(!readiness.ready);
    assert_eq!(metrics.partition_count, 0);
    assert!(matches!(submitted, Err(Error::ShuttingDown)));
}

#[tokio::test]
async fn shrinking_moves_stranded_jobs_to_surviving_partitions() {
    let backend = Arc::new(MemoryBackend::new());
    let gate = Arc::new(Semaphore::new(0));
    let h = start_with(
        settings(4, 4),
        FakeClassifier::new(Mode::Answer(Outcome::Allow)).with_gate(gate.clone()),
        backend.clone(),
    )
    .await;
    let mut rx = h.events.subscribe();

    let conversation = (0..)
        .map(|i| format!("chat-{i}"))
        .find(|c| shard_of(c, 4) == 3)
        .unwrap();
    h.manager
        .submit(job(&conversation, "1", "held"))
        .await
        .unwrap();
    wait_until(|| h.classifier.call_count() == 1).await;

    // The drain times out, leaving the job on partition 3's queue.
    h.manager.resize(1, Duration::from_millis(100)).await.unwrap();
    assert_eq!(backend.pending(&queue_name(3)), 0);

    gate.add_permits(10);
    wait_for(&mut rx, |k| matches!(k, EventKind::JobCompleted { partition: 0, .. })).await;
    wait_until(|| backend.pending(&queue_name(0)) == 0).await;
    assert_eq!(h.classifier.call_count(), 2);
    h.manager.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn resize_reinitializes_partitions() {
    let h = start(settings(2, 4), FakeClassifier::new(Mode::Answer(Outcome::Allow))).await;
    let mut rx = h.events.subscribe();
    h.manager.submit(job("x", "1", "before")).await.unwrap();

    h.manager.resize(3, Duration::from_secs(5)).await.unwrap();
    assert_eq!(h.manager.partition_count().await, Some(3));
    assert_eq!(h.manager.metrics().await.partitions.len(), 3);
    assert_eq!(h.manager.partition_for("x").await, Some((shard_of("x", 3), 3)));

    // Drained before the switch.
    wait_for(&mut rx, |k| matches!(k, EventKind::JobCompleted { .. })).await;

    let result = h.manager.submit(job("x", "2", "after")).await.unwrap();
    assert_eq!(result.partition(), shard_of("x", 3));

    let err = h
        .manager
        .resize(0, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(h.manager.partition_count().await, Some(3), "unchanged");
    h.manager.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn readiness_tracks_backend_health() {
    let h = start(settings(2, 2), FakeClassifier::new(Mode::Answer(Outcome::Allow))).await;

    let ready = h.manager.readiness().await;
    assert!(ready.ready && ready.backend_ok && ready.accepting);
    assert!(ready.stale_partitions.is_empty());

    h.backend.set_healthy(false);
    let not_ready = h.manager.readiness().await;
    assert!(!not_ready.ready);
    assert!(!not_ready.backend_ok);
    assert!(not_ready.backend_error.is_some());

    h.backend.set_healthy(true);
    h.manager.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn classifier_outage_degrades_to_policy() {
    let h = start(settings(1, 1), FakeClassifier::new(Mode::Fail)).await;
    let mut rx = h.events.subscribe();

    h.manager
        .submit(job("-100", "1", "free crypto giveaway"))
        .await
        .unwrap();
    let done = wait_for(&mut rx, |k| matches!(k, EventKind::JobCompleted { .. })).await;
    assert!(matches!(
        done.kind,
        EventKind::JobCompleted {
            source: VerdictSource::Policy,
            ..
        }
    ));
    assert_eq!(h.gateway.calls(), vec!["delete:-100:1".to_string()]);
    h.manager.shutdown(Duration::from_secs(5)).await.unwrap();
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[test]
fn hotspot_detection() {
    assert!(is_hotspot(&[1.0, 1.0, 1.0, 10.0]));
    assert!(!is_hotspot(&[1.0, 1.0, 1.0, 1.0]));
    assert!(!is_hotspot(&[2.0, 1.0, 3.0, 2.0]));
    assert!(!is_hotspot(&[0.0, 0.0]));
    assert!(!is_hotspot(&[]));
}

#[test]
fn per_partition_concurrency() {
    assert_eq!(settings(4, 16).per_partition_concurrency(), 4);
    assert_eq!(settings(4, 5).per_partition_concurrency(), 1);
    let capped = PipelineSettings {
        partition_concurrency_cap: Some(2),
        ..settings(4, 16)
    };
    assert_eq!(capped.per_partition_concurrency(), 2);
}
