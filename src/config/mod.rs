//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or any
//! value does not parse. Sensitive values are wrapped in
//! `secrecy::SecretString` to prevent log leaks.

pub mod secrets;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::limiter::LimiterConfig;
use crate::outbox::OutboxConfig;
use crate::outbox::gateway::DEFAULT_TELEGRAM_API_URL;

pub const DEFAULT_CLASSIFIER_MODEL: &str = "claude-3-5-haiku-latest";

/// Partition layout and processing bounds. Validated before the partition
/// manager starts.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// N, the number of partitions.
    pub partition_count: u32,
    /// C, jobs in flight across all partitions.
    pub total_concurrency: usize,
    /// Optional ceiling on per-partition concurrency.
    pub partition_concurrency_cap: Option<usize>,
    /// Bound on one classifier call.
    pub processing_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            partition_count: 4,
            total_concurrency: 16,
            partition_concurrency_cap: None,
            processing_timeout: Duration::from_secs(10),
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(Error::Config("partition count must be at least 1".to_string()));
        }
        if self.total_concurrency < self.partition_count as usize {
            return Err(Error::Config(format!(
                "total concurrency {} is below partition count {}",
                self.total_concurrency, self.partition_count
            )));
        }
        if self.partition_concurrency_cap == Some(0) {
            return Err(Error::Config(
                "partition concurrency cap must be at least 1".to_string(),
            ));
        }
        if self.processing_timeout.is_zero() {
            return Err(Error::Config("processing timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// C / N, limited by the cap. Never below 1.
    pub fn per_partition_concurrency(&self) -> usize {
        let share = self.total_concurrency / self.partition_count.max(1) as usize;
        let share = self
            .partition_concurrency_cap
            .map_or(share, |cap| share.min(cap));
        share.max(1)
    }

    /// Same settings with a different partition count.
    pub fn with_partition_count(&self, partition_count: u32) -> Self {
        Self {
            partition_count,
            ..self.clone()
        }
    }
}

#[derive(Debug)]
pub struct Config {
    /// Unset means in-memory queue and outbox backends.
    pub database_url: Option<SecretString>,
    pub anthropic_api_key: SecretString,
    pub telegram_bot_token: SecretString,
    pub telegram_api_url: String,
    pub classifier_model: String,
    pub pipeline: PipelineSettings,
    pub cache: CacheConfig,
    pub limiter: LimiterConfig,
    pub outbox: OutboxConfig,
    pub policy_rules_path: Option<PathBuf>,
    pub http_addr: SocketAddr,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let pipeline = PipelineSettings {
            partition_count: vars.parsed("PARTITION_COUNT", 4)?,
            total_concurrency: vars.parsed("TOTAL_CONCURRENCY", 16)?,
            partition_concurrency_cap: vars.optional("PARTITION_CONCURRENCY_CAP")?,
            processing_timeout: vars.millis("PROCESSING_TIMEOUT_MS", 10_000)?,
        };
        pipeline.validate()?;

        let cache = CacheConfig {
            ttl: vars.secs("CACHE_TTL_SECS", 3600)?,
            capacity: vars.parsed("CACHE_CAPACITY", 10_000)?,
            sweep_interval: vars.secs("CACHE_SWEEP_SECS", 60)?,
        };

        let limiter = LimiterConfig {
            tokens_per_second: vars.parsed("RATE_LIMIT_TOKENS_PER_SEC", 10.0)?,
            bucket_capacity: vars.parsed("RATE_LIMIT_BUCKET_CAPACITY", 20.0)?,
            failure_threshold: vars.parsed("BREAKER_FAILURE_THRESHOLD", 5)?,
            recovery_timeout: vars.millis("BREAKER_RECOVERY_TIMEOUT_MS", 30_000)?,
            half_open_max_calls: vars.parsed("BREAKER_HALF_OPEN_MAX_CALLS", 3)?,
            success_threshold: vars.parsed("BREAKER_SUCCESS_THRESHOLD", 2)?,
            max_queue_size: vars.parsed("RATE_LIMIT_QUEUE_SIZE", 100)?,
            request_timeout: vars.millis("RATE_LIMIT_REQUEST_TIMEOUT_MS", 5000)?,
        };
        limiter.validate()?;

        let outbox = OutboxConfig {
            max_retries: vars.parsed("OUTBOX_MAX_RETRIES", 3)?,
            retention: vars.secs("OUTBOX_RETENTION_SECS", 86_400)?,
            claim_lease: vars.secs("OUTBOX_CLAIM_LEASE_SECS", 30)?,
            ..OutboxConfig::default()
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .filter(|v| !v.is_empty())
                .map(SecretString::from),
            anthropic_api_key: SecretString::from(vars.required("ANTHROPIC_API_KEY")?),
            telegram_bot_token: SecretString::from(vars.required("TELEGRAM_BOT_TOKEN")?),
            telegram_api_url: lookup("TELEGRAM_API_URL")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string()),
            classifier_model: lookup("CLASSIFIER_MODEL")
                .unwrap_or_else(|| DEFAULT_CLASSIFIER_MODEL.to_string()),
            pipeline,
            cache,
            limiter,
            outbox,
            policy_rules_path: lookup("POLICY_RULES_PATH").map(PathBuf::from),
            http_addr: vars.parsed("HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, name: &str) -> Result<String> {
        (self.0)(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
    }

    fn optional<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        match (self.0)(name) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw}"))),
            _ => Ok(None),
        }
    }

    fn parsed<T: FromStr>(&self, name: &str, default: T) -> Result<T> {
        Ok(self.optional(name)?.unwrap_or(default))
    }

    fn millis(&self, name: &str, default: u64) -> Result<Duration> {
        self.parsed(name, default).map(Duration::from_millis)
    }

    fn secs(&self, name: &str, default: u64) -> Result<Duration> {
        self.parsed(name, default).map(Duration::from_secs)
    }
}
