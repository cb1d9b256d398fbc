//! article-sync: replicate article change events into a secondary store.
//!
//! Usage:
//!   # Consume (default)
//!   BROKER_URL=redis://localhost:6379 TARGET_DB_URL=sqlite://replica.db?mode=rwc article-sync
//!
//!   # Park failed events instead of dropping them
//!   article-sync consume --failure-policy dead-letter
//!
//!   # Replay one article snapshot through the producer
//!   article-sync publish --event-type article.updated --file article-42.json

use article_sync::broker::{RedisEventSink, RedisEventSource};
use article_sync::config::{default_consumer_name, FailurePolicy, SyncConfig};
use article_sync::resilience::RetryConfig;
use article_sync::{ArticlePayload, Consumer, EventProducer, EventType, SqliteStore, SyncError};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "article-sync", version, about = "Article change-event replication")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    consume: ConsumeArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Redis URL of the event broker.
    #[arg(long, env = "BROKER_URL", default_value = "redis://localhost:6379", global = true)]
    broker_url: String,

    /// Topic (stream) carrying article events.
    #[arg(long, env = "ARTICLE_TOPIC", default_value = "article-events", global = true)]
    topic: String,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume events into the target store (default).
    Consume,
    /// Publish one article snapshot.
    Publish(PublishArgs),
}

#[derive(Args, Debug, Clone)]
struct ConsumeArgs {
    #[arg(long, env = "CONSUMER_GROUP", default_value = "blog-sync-group", global = true)]
    group: String,

    /// Name inside the group. Defaults to `<hostname>-<pid>`.
    #[arg(long, env = "CONSUMER_NAME", global = true)]
    consumer_name: Option<String>,

    /// Target store connection string.
    #[arg(long, env = "TARGET_DB_URL", default_value = "sqlite://replica.db?mode=rwc", global = true)]
    target_db_url: String,

    /// `drop` or `dead-letter`.
    #[arg(long, env = "FAILURE_POLICY", default_value = "drop", global = true)]
    failure_policy: FailurePolicy,

    /// Pause before committing a failed message under `drop`.
    #[arg(long, env = "FAILURE_DELAY", default_value = "5s", global = true)]
    failure_delay: String,

    #[arg(long, env = "BATCH_SIZE", default_value_t = 10, global = true)]
    batch_size: usize,

    #[arg(long, env = "POLL_TIMEOUT", default_value = "1s", global = true)]
    poll_timeout: String,
}

#[derive(Args, Debug)]
struct PublishArgs {
    /// `article.created`, `article.updated`, `article.deleted` or `article.published`.
    #[arg(long, value_parser = parse_event_type)]
    event_type: EventType,

    /// JSON file holding the article snapshot.
    #[arg(long)]
    file: PathBuf,
}

fn parse_event_type(s: &str) -> Result<EventType, String> {
    EventType::parse(s)
        .or_else(|| EventType::parse(&format!("article.{}", s)))
        .ok_or_else(|| format!("unknown event type `{}`", s))
}

fn build_config(common: &CommonArgs, args: &ConsumeArgs) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.broker.url = common.broker_url.clone();
    config.broker.topic = common.topic.clone();
    config.store.url = args.target_db_url.clone();
    config.consumer.group = args.group.clone();
    config.consumer.consumer_name = args
        .consumer_name
        .clone()
        .unwrap_or_else(default_consumer_name);
    config.consumer.failure_policy = args.failure_policy;
    config.consumer.failure_delay = args.failure_delay.clone();
    config.consumer.batch_size = args.batch_size;
    config.consumer.poll_timeout = args.poll_timeout.clone();
    config
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.common.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    let result = match cli.command {
        Some(Command::Publish(args)) => publish(&cli.common, args).await,
        Some(Command::Consume) | None => consume(&cli.common, &cli.consume).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, kind = e.kind(), "Exiting");
            ExitCode::FAILURE
        }
    }
}

async fn consume(common: &CommonArgs, args: &ConsumeArgs) -> article_sync::Result<()> {
    let config = build_config(common, args);
    config.validate()?;

    info!(
        broker = %article_sync::config::redact_url(&config.broker.url),
        topic = %config.broker.topic,
        group = %config.consumer.group,
        consumer = %config.consumer.consumer_name,
        store = %config.store.redacted_url(),
        failure_policy = %config.consumer.failure_policy,
        "Starting article-sync consumer"
    );

    let retry = RetryConfig::startup();
    let store = SqliteStore::connect_with_retry(&config.store, &retry).await?;
    let source = RedisEventSource::connect(&config.broker, &config.consumer, &retry).await?;

    let consumer = Consumer::new(source, store, config.consumer.clone());
    let handle = consumer.shutdown_handle();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        if handle.stop() {
            info!("Shutdown requested, finishing current batch");
        }
    });

    consumer.start().await?;

    consumer.engine().store().close().await;
    info!("Goodbye");
    Ok(())
}

async fn publish(common: &CommonArgs, args: PublishArgs) -> article_sync::Result<()> {
    let bytes = std::fs::read(&args.file).map_err(|e| {
        SyncError::Config(format!("cannot read {}: {}", args.file.display(), e))
    })?;
    let article: ArticlePayload = serde_json::from_slice(&bytes).map_err(|e| {
        SyncError::Config(format!("{} is not an article payload: {}", args.file.display(), e))
    })?;

    let mut config = SyncConfig::default();
    config.broker.url = common.broker_url.clone();
    config.broker.topic = common.topic.clone();

    let sink = RedisEventSink::connect(&config.broker, &RetryConfig::startup()).await?;
    let producer = EventProducer::new(sink, config.broker.topic.clone(), &config.producer);
    let receipt = producer.publish(args.event_type, &article).await?;

    info!(
        topic = %receipt.topic,
        message_id = %receipt.message_id,
        attempts = receipt.attempts,
        article_id = article.id,
        "Published"
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
