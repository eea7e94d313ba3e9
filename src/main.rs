use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nostr_core::ControlGate;
use nostr_push::bootstrap::{load_history, check_relay};
use nostr_push::tools::{self, KeysCommands, SendArgs};
use nostr_push::{
    AmqpConsumer, Config, ExpoClient, NotificationDispatcher, NotificationService, Observer,
    TracingObserver,
};

#[derive(Parser)]
#[command(name = "nostr-push")]
#[command(about = "Push notifications for Nostr events", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (default: nostr-push.toml if present)
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service
    Run,
    /// Validate configuration and test relay connectivity
    Check,
    /// Key utilities
    Keys {
        #[command(subcommand)]
        action: KeysCommands,
    },
    /// Publish an encrypted control message to the service
    Send(SendArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Run);
    match command {
        Commands::Keys { action } => return tools::handle_keys(action),
        Commands::Send(args) => {
            init_logging("warn")?;
            return tools::handle_send(args).await;
        }
        Commands::Run | Commands::Check => {}
    }

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    init_logging(&config.logging.level)?;

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    match command {
        Commands::Check => check_config(&config).await,
        _ => run_service(config).await,
    }
}

async fn run_service(config: Config) -> Result<()> {
    tracing::info!("Starting nostr-push v{}", env!("CARGO_PKG_VERSION"));

    let keys = config.load_keys()?;
    let observer: Arc<dyn Observer> = Arc::new(TracingObserver);

    let access_token = config
        .push
        .access_token
        .clone()
        .context("No push access token configured")?;
    let expo = ExpoClient::new(&config.push.endpoint, access_token, config.push_timeout())
        .context("Failed to build push client")?;
    let dispatcher = NotificationDispatcher::new(Arc::new(expo), observer.clone())
        .with_body_chars(config.push.body_chars);

    let mut service =
        NotificationService::new(ControlGate::new(keys), dispatcher, observer.clone());
    tracing::info!("Service identity: {}", service.identity());

    service.bootstrap_from(load_history(&config.relay.url, config.bootstrap_timeout()).await);

    let shutdown = CancellationToken::new();
    let consumer = AmqpConsumer::new(config.queue_settings(), service, observer.clone());
    let consumer_task = tokio::spawn(consumer.consume_until_shutdown(shutdown.clone()));

    wait_for_shutdown().await?;
    shutdown.cancel();

    let grace = config.grace_period();
    match tokio::time::timeout(grace, consumer_task).await {
        Ok(Ok(service)) => tracing::info!(
            "Stopped with {} subscriber(s) registered",
            service.registry().identity_count()
        ),
        Ok(Err(e)) => tracing::error!("Consumer task failed: {e}"),
        Err(_) => tracing::warn!("Consumer did not stop within {grace:?}, exiting anyway"),
    }

    Ok(())
}

async fn check_config(config: &Config) -> Result<()> {
    println!("Checking configuration...");
    println!("✓ Configuration is valid");

    let keys = config.load_keys()?;
    println!("✓ Private key is valid");
    println!("  Service identity: {}", keys.public_key().to_hex());

    println!(
        "  Queue: {} ({} -> {})",
        config.queue.url, config.queue.exchange, config.queue.name
    );

    match check_relay(&config.relay.url, config.bootstrap_timeout()).await {
        Ok(_) => println!("✓ Relay {} is reachable", config.relay.url),
        Err(e) => {
            println!("⚠ Relay connectivity test failed: {e:#}");
            println!("  (This is non-fatal, the service starts with an empty registry)");
        }
    }

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        },
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        },
        _ = signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C");
        }
    }

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter.to_string())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .compact(),
        )
        .init();

    Ok(())
}
