//! Integration tests for the verdict cache.
//!
//! Expiry is driven by the tokio clock, so these run paused.

use std::sync::Arc;
use std::time::Duration;

use chatwarden::cache::canonical::{BasicCanonicalizer, Canonicalizer};
use chatwarden::cache::{CacheConfig, VerdictCache};
use chatwarden::model::{Outcome, Verdict};
use tokio_util::sync::CancellationToken;

fn cache(ttl_secs: u64, capacity: usize) -> VerdictCache {
    VerdictCache::new(CacheConfig {
        ttl: Duration::from_secs(ttl_secs),
        capacity,
        sweep_interval: Duration::from_secs(1),
    })
}

fn block(reason: &str) -> Verdict {
    Verdict::new(Outcome::Block, 0.9, reason)
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn set_then_get_hits() {
    let cache = cache(60, 10);
    assert!(cache.get("buy followers now").is_none());

    cache.set("buy followers now", block("spam"), None);
    let hit = cache.get("buy followers now").expect("cached verdict");
    assert_eq!(hit.outcome, Outcome::Block);
    assert_eq!(hit.reason, "spam");

    let m = cache.metrics();
    assert_eq!(m.hits, 1);
    assert_eq!(m.misses, 1);
    assert!((m.hit_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(m.entries, 1);
}

#[tokio::test(start_paused = true)]
async fn equivalent_content_shares_an_entry() {
    let cache = cache(60, 10);
    cache.set("Hello   World", Verdict::allow("fine"), None);

    assert!(cache.get("hello world").is_some());
    assert!(cache.get("  HELLO\tworld\n").is_some());
    assert!(cache.get("hello there world").is_none());
    assert_eq!(cache.key_for("Hello World"), cache.key_for("hello   world"));
    assert_eq!(cache.len(), 1);
}

#[test]
fn fingerprint_hides_the_text() {
    let key = BasicCanonicalizer
        .canonicalize("my secret phone number")
        .fingerprint();
    assert_eq!(key.len(), 64);
    assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(!key.contains("secret"));
}

#[test]
fn canonicalizer_extracts_entities() {
    let content = BasicCanonicalizer
        .canonicalize("Join #Crypto with @Alice at HTTPS://Example.com/Path/ now");
    assert_eq!(content.urls, vec!["https://example.com/path".to_string()]);
    assert_eq!(content.mentions, vec!["alice".to_string()]);
    assert_eq!(content.hashtags, vec!["crypto".to_string()]);
    assert!(content.text.starts_with("join #crypto"));
}

#[tokio::test(start_paused = true)]
async fn inspect_does_not_count_as_lookup() {
    let cache = cache(60, 10);
    cache.set("x", Verdict::allow("ok"), None);
    cache.get("x");
    cache.get("x");

    tokio::time::advance(Duration::from_secs(5)).await;
    let info = cache.inspect("x").expect("entry");
    assert_eq!(info.hit_count, 2);
    assert_eq!(info.age, Duration::from_secs(5));
    assert_eq!(info.ttl, Duration::from_secs(60));
    assert_eq!(cache.metrics().hits, 2);
    assert_eq!(cache.metrics().misses, 0);
}

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn expired_entry_is_a_miss_and_removed() {
    let cache = cache(10, 10);
    cache.set("old news", Verdict::allow("ok"), None);

    tokio::time::advance(Duration::from_secs(9)).await;
    assert!(cache.get("old news").is_some());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(cache.get("old news").is_none());
    assert_eq!(cache.len(), 0);

    let m = cache.metrics();
    assert_eq!(m.expirations, 1);
    assert_eq!(m.misses, 1);
}

#[tokio::test(start_paused = true)]
async fn explicit_ttl_overrides_default() {
    let cache = cache(3600, 10);
    cache.set("short", Verdict::allow("ok"), Some(Duration::from_secs(2)));
    cache.set("long", Verdict::allow("ok"), None);

    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(cache.get("short").is_none());
    assert!(cache.get("long").is_some());
}

#[tokio::test(start_paused = true)]
async fn purge_removes_only_expired() {
    let cache = cache(10, 10);
    cache.set("a", Verdict::allow("ok"), None);
    cache.set("b", Verdict::allow("ok"), Some(Duration::from_secs(100)));

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(cache.purge_expired(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.purge_expired(), 0);
    assert_eq!(cache.metrics().expirations, 1);
}

#[tokio::test(start_paused = true)]
async fn sweeper_purges_in_background() {
    let cache = Arc::new(cache(5, 10));
    let cancel = CancellationToken::new();
    let sweeper = cache.spawn_sweeper(cancel.clone());

    cache.set("transient", Verdict::allow("ok"), None);
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(cache.is_empty(), "sweeper should have dropped the entry");

    cancel.cancel();
    sweeper.await.unwrap();
}

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn evicts_oldest_created_entry_when_full() {
    let cache = cache(60, 2);
    cache.set("first", Verdict::allow("1"), None);
    tokio::time::advance(Duration::from_millis(10)).await;
    cache.set("second", Verdict::allow("2"), None);

    // Recently read, but still the oldest by creation.
    assert!(cache.get("first").is_some());

    cache.set("third", Verdict::allow("3"), None);
    assert_eq!(cache.len(), 2);
    assert!(cache.inspect("first").is_none());
    assert!(cache.inspect("second").is_some());
    assert!(cache.inspect("third").is_some());
    assert_eq!(cache.metrics().evictions, 1);
}

#[tokio::test(start_paused = true)]
async fn overwriting_at_capacity_does_not_evict() {
    let cache = cache(60, 2);
    cache.set("a", Verdict::allow("1"), None);
    cache.set("b", Verdict::allow("2"), None);
    cache.set("a", block("changed"), None);

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.metrics().evictions, 0);
    assert_eq!(cache.get("a").unwrap().outcome, Outcome::Block);

    // "a" was re-created, so "b" is now the oldest.
    cache.set("c", Verdict::allow("3"), None);
    assert!(cache.inspect("b").is_none());
    assert!(cache.inspect("a").is_some());
}

#[tokio::test(start_paused = true)]
async fn heavy_churn_stays_within_capacity() {
    let cache = cache(60, 50);
    for i in 0..1000 {
        cache.set(&format!("message {i}"), Verdict::allow("ok"), None);
        if i % 3 == 0 {
            cache.set(&format!("message {}", i / 2), Verdict::allow("again"), None);
        }
    }
    assert!(cache.len() <= 50);
    assert!(cache.inspect("message 999").is_some());
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn remove_clear_and_reset() {
    let cache = cache(60, 10);
    cache.set("a", Verdict::allow("ok"), None);
    cache.set("b", Verdict::allow("ok"), None);
    cache.get("a");
    cache.get("zzz");

    assert!(cache.remove("a"));
    assert!(!cache.remove("a"));
    assert_eq!(cache.len(), 1);

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.metrics().hits, 1, "clear keeps counters");

    cache.reset_metrics();
    let m = cache.metrics();
    assert_eq!((m.hits, m.misses, m.evictions, m.expirations), (0, 0, 0, 0));
    assert_eq!(m.hit_rate, 0.0);
}
