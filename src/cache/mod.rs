//! Content-addressed verdict cache.
//!
//! Keys are content fingerprints (see [`canonical`]). Entries expire after
//! their TTL and are dropped lazily on access or by the background sweep.
//! When full, the entry with the oldest *creation* time is evicted, not the
//! least recently used one, so insertion stays O(1) amortized.

pub mod canonical;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::Verdict;
use crate::telemetry::metrics;
use canonical::{BasicCanonicalizer, Canonicalizer};

/// Configuration for the verdict cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Default time-to-live for entries set without an explicit TTL.
    pub ttl: Duration,
    /// Maximum number of live entries.
    pub capacity: usize,
    /// Period of the background expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            capacity: 10_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    verdict: Verdict,
    created_at: Instant,
    ttl: Duration,
    hit_count: u64,
    last_accessed_at: Instant,
    /// Matches the insertion-order marker that is still live for this key.
    generation: u64,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order. A marker is stale once its key was re-set or removed.
    order: VecDeque<(String, u64)>,
    next_generation: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl Inner {
    fn evict_oldest(&mut self) -> bool {
        while let Some((key, generation)) = self.order.pop_front() {
            let live = self
                .entries
                .get(&key)
                .is_some_and(|e| e.generation == generation);
            if live {
                self.entries.remove(&key);
                self.evictions += 1;
                return true;
            }
        }
        false
    }

    fn compact_order(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(key, generation)| entries.get(key).is_some_and(|e| e.generation == *generation));
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Details about a live entry, for diagnostics.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub hit_count: u64,
    pub age: Duration,
    pub idle: Duration,
    pub ttl: Duration,
}

/// Verdict cache shared by all partitions.
pub struct VerdictCache {
    inner: Mutex<Inner>,
    config: CacheConfig,
    canonicalizer: Arc<dyn Canonicalizer>,
}

impl VerdictCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_canonicalizer(config, Arc::new(BasicCanonicalizer))
    }

    pub fn with_canonicalizer(config: CacheConfig, canonicalizer: Arc<dyn Canonicalizer>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            canonicalizer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fingerprint `content` the same way `get`/`set` do.
    pub fn key_for(&self, content: &str) -> String {
        self.canonicalizer.canonicalize(content).fingerprint()
    }

    /// Look up a verdict. Expired entries are deleted and count as a miss.
    pub fn get(&self, content: &str) -> Option<Verdict> {
        let key = self.key_for(content);
        let now = Instant::now();
        let mut inner = self.lock();

        let found = match inner.entries.get(&key).map(|e| e.is_valid(now)) {
            Some(true) => inner.entries.get_mut(&key).map(|entry| {
                entry.hit_count += 1;
                entry.last_accessed_at = now;
                entry.verdict.clone()
            }),
            Some(false) => {
                inner.entries.remove(&key);
                inner.expirations += 1;
                None
            }
            None => None,
        };

        let result = if found.is_some() {
            inner.hits += 1;
            "hit"
        } else {
            inner.misses += 1;
            "miss"
        };
        drop(inner);
        metrics::cache_lookups().add(1, &[KeyValue::new("result", result)]);
        found
    }

    /// Store a verdict. `ttl` overrides the configured default.
    pub fn set(&self, content: &str, verdict: Verdict, ttl: Option<Duration>) {
        let key = self.key_for(content);
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.config.ttl);
        let capacity = self.config.capacity.max(1);
        let mut inner = self.lock();

        if !inner.entries.contains_key(&key) {
            while inner.entries.len() >= capacity {
                if !inner.evict_oldest() {
                    break;
                }
            }
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                verdict,
                created_at: now,
                ttl,
                hit_count: 0,
                last_accessed_at: now,
                generation,
            },
        );
        inner.order.push_back((key, generation));

        if inner.order.len() > capacity.saturating_mul(2) {
            inner.compact_order();
        }
    }

    /// Remove the entry for `content`. Returns whether one existed.
    pub fn remove(&self, content: &str) -> bool {
        let key = self.key_for(content);
        self.lock().entries.remove(&key).is_some()
    }

    /// Entry details without counting a hit or miss.
    pub fn inspect(&self, content: &str) -> Option<EntryInfo> {
        let key = self.key_for(content);
        let now = Instant::now();
        let inner = self.lock();
        inner
            .entries
            .get(&key)
            .filter(|e| e.is_valid(now))
            .map(|e| EntryInfo {
                hit_count: e.hit_count,
                age: now.saturating_duration_since(e.created_at),
                idle: now.saturating_duration_since(e.last_accessed_at),
                ttl: e.ttl,
            })
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.is_valid(now));
        let removed = before - inner.entries.len();
        inner.expirations += removed as u64;
        if removed > 0 {
            inner.compact_order();
        }
        removed
    }

    /// Remove all entries. Cumulative hit/miss counters are kept.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Zero the cumulative counters.
    pub fn reset_metrics(&self) {
        let mut inner = self.lock();
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
        inner.expirations = 0;
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetrics {
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        CacheMetrics {
            entries: inner.entries.len(),
            capacity: self.config.capacity,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
            evictions: inner.evictions,
            expirations: inner.expirations,
        }
    }

    /// Periodically purge expired entries until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!(removed, "cache sweep purged expired verdicts");
                        }
                    }
                }
            }
        })
    }
}
