//! chatwarden CLI: run the moderation pipeline or inspect shard placement.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use chatwarden::cache::VerdictCache;
use chatwarden::config::Config;
use chatwarden::config::secrets::{ExposeSecret, redact_url};
use chatwarden::db::Db;
use chatwarden::engine::{PartitionManager, Processor};
use chatwarden::event::EventBus;
use chatwarden::limiter::RateLimiter;
use chatwarden::llm::LlmClassifier;
use chatwarden::outbox::gateway::TelegramGateway;
use chatwarden::outbox::store::{MemoryOutboxStore, OutboxStore};
use chatwarden::outbox::Outbox;
use chatwarden::pipeline::VerdictPipeline;
use chatwarden::pipeline::rules::PolicyRules;
use chatwarden::queue::{MemoryBackend, QueueBackend};
use chatwarden::router::{distribution, shard_of};
use chatwarden::server::{self, AppState};
use chatwarden::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const OUTBOX_CLEANUP_PERIOD: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "chatwarden", about = "Partitioned chat moderation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline and its HTTP shell
    Serve,
    /// Print the partition a conversation maps to
    Shard {
        /// Conversation id
        conversation_id: String,
        /// Partition count (defaults to PARTITION_COUNT or 4)
        #[arg(long)]
        partitions: Option<u32>,
    },
    /// Read conversation ids from stdin and report how they spread
    Distribution {
        /// Partition count (defaults to PARTITION_COUNT or 4)
        #[arg(long)]
        partitions: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => cmd_serve().await,
        Command::Shard {
            conversation_id,
            partitions,
        } => {
            let count = partition_count(partitions)?;
            println!("{}", shard_of(&conversation_id, count));
            Ok(())
        }
        Command::Distribution { partitions } => cmd_distribution(partition_count(partitions)?),
    }
}

fn partition_count(flag: Option<u32>) -> anyhow::Result<u32> {
    let count = match flag {
        Some(n) => n,
        None => match std::env::var("PARTITION_COUNT") {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("PARTITION_COUNT has an invalid value: {raw}"))?,
            Err(_) => 4,
        },
    };
    if count == 0 {
        anyhow::bail!("partition count must be at least 1");
    }
    Ok(count)
}

fn cmd_distribution(partitions: u32) -> anyhow::Result<()> {
    let ids = std::io::stdin()
        .lock()
        .lines()
        .collect::<std::io::Result<Vec<String>>>()?;
    let ids: Vec<&str> = ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();

    let report = distribution(ids.iter().copied(), partitions);

    println!("{:<10}  {:>8}  {:>8}", "PARTITION", "COUNT", "SHARE");
    println!("{}", "-".repeat(30));
    for (index, count) in report.counts.iter().enumerate() {
        let share = if report.sample_size == 0 {
            0.0
        } else {
            *count as f64 * 100.0 / report.sample_size as f64
        };
        println!("{index:<10}  {count:>8}  {share:>7.2}%");
    }
    println!();
    println!("sample:        {}", report.sample_size);
    println!("expected:      {:.1}", report.expected);
    println!("max deviation: {:.3}", report.max_deviation);
    println!("cv:            {:.3}", report.coefficient_of_variation);
    println!("empty:         {}", report.empty_partitions());
    Ok(())
}

async fn cmd_serve() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let telemetry = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "chatwarden".to_string(),
        log_level: config.log_level.clone(),
    })?;
    info!(otlp = telemetry.is_exporting(), "telemetry initialized");

    let (backend, store): (Arc<dyn QueueBackend>, Arc<dyn OutboxStore>) =
        match &config.database_url {
            Some(url) => {
                info!(database = %redact_url(url), "connecting to postgres");
                let db = Arc::new(Db::connect(url.expose_secret()).await?);
                db.migrate().await?;
                let backend: Arc<dyn QueueBackend> = db.clone();
                let store: Arc<dyn OutboxStore> = db;
                (backend, store)
            }
            None => {
                warn!("DATABASE_URL not set, queues and outbox are in-memory only");
                let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
                let store: Arc<dyn OutboxStore> = Arc::new(MemoryOutboxStore::new());
                (backend, store)
            }
        };

    let rules = match &config.policy_rules_path {
        Some(path) => PolicyRules::load(path)?,
        None => PolicyRules::default(),
    };
    let classifier = Arc::new(LlmClassifier::new(
        &config.anthropic_api_key,
        config.classifier_model.clone(),
    )?);
    let gateway = Arc::new(TelegramGateway::with_base_url(
        config.telegram_bot_token.clone(),
        config.telegram_api_url.clone(),
    )?);

    let events = EventBus::default();
    let shutdown = CancellationToken::new();

    let cache = Arc::new(VerdictCache::new(config.cache.clone()));
    let sweeper = cache.spawn_sweeper(shutdown.child_token());

    let limiter = Arc::new(RateLimiter::with_events(
        config.limiter.clone(),
        events.clone(),
    ));

    let pipeline = Arc::new(VerdictPipeline::new(
        Arc::clone(&cache),
        Arc::clone(&limiter),
        classifier,
        rules,
        config.pipeline.processing_timeout,
    ));

    let outbox = Arc::new(Outbox::with_events(
        store,
        gateway,
        config.outbox.clone(),
        events.clone(),
    ));
    let cleanup = outbox.spawn_cleanup(OUTBOX_CLEANUP_PERIOD, shutdown.child_token());

    let processor = Arc::new(Processor::new(pipeline, Some(Arc::clone(&outbox))));
    let manager = Arc::new(
        PartitionManager::start(config.pipeline.clone(), processor, backend, events).await?,
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal.cancel();
    });

    let state = AppState {
        manager: Arc::clone(&manager),
        cache,
        limiter,
        outbox,
    };
    let served = server::serve(config.http_addr, state, shutdown.clone()).await;
    shutdown.cancel();

    manager.shutdown(SHUTDOWN_TIMEOUT).await?;
    let _ = sweeper.await;
    let _ = cleanup.await;
    served?;
    info!("chatwarden stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
