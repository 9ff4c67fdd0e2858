//! Chathub Server
//!
//! Run with: cargo run --bin chathub
//!
//! # Configuration
//!
//! Config file (first found): `--config <path>`,
//! `$CONFIG_DIR/chathub/config.toml`, `/etc/chathub/config.toml`,
//! `./chathub.toml`.
//!
//! Environment variables:
//! - `CHATHUB_HOST`: Host to bind to (default: 0.0.0.0)
//! - `CHATHUB_PORT`: Port to listen on (default: 3030)
//! - `CHATHUB_ALLOWED_ORIGINS`: Comma separated origins (default: *)
//! - `CHATHUB_SEND_TIMEOUT_MS`: Per-client send timeout (default: 5000)
//! - `CHATHUB_QUEUE_CAPACITY`: Inbound queue bound, 0 = unbounded
//! - `CHATHUB_MAX_CONNECTIONS`: Connection limit, 0 = unbounded
//! - `CHATHUB_LOG_LEVEL` / `CHATHUB_LOG_FORMAT`: Logging (RUST_LOG wins)

use anyhow::Context;
use chathub::api::{serve, shutdown_signal, AppState};
use chathub::config::{generate_default_config, Config, ConfigSource, LoadedConfig, LoggingConfig};
use chathub::hub::BroadcastHub;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long open connections get to finish after shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "chathub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time chat fan-out hub")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default config file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let LoadedConfig {
        mut config,
        source,
        skipped,
    } = match &cli.config {
        Some(path) => LoadedConfig {
            config: Config::load_with_env(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            source: ConfigSource::File(path.clone()),
            skipped: Vec::new(),
        },
        None => Config::load_default(),
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    init_logging(&config.logging);

    tracing::info!("Starting Chathub v{}", env!("CARGO_PKG_VERSION"));
    for e in &skipped {
        tracing::warn!(error = %e, "Skipped config file");
    }
    tracing::info!(source = %source, "Configuration loaded");
    tracing::info!(
        allowed_origins = ?config.server.allowed_origins,
        send_timeout_ms = config.hub.send_timeout_ms,
        queue_capacity = config.hub.queue_capacity,
        max_connections = config.hub.max_connections,
        "Hub configuration"
    );

    let (hub, dispatcher) = BroadcastHub::new(config.hub.hub_config());
    let cancel = CancellationToken::new();
    let delivery = tokio::spawn(dispatcher.run(cancel.clone()));

    let state = AppState::new(hub, config);
    let mut server = tokio::spawn(serve(state, cancel.clone()));

    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut server => {
            // Server stopped on its own (e.g. bind failure)
            cancel.cancel();
            delivery.await.context("delivery loop panicked")?;
            return result.context("server task panicked")?.map_err(Into::into);
        }
    }

    cancel.cancel();
    delivery.await.context("delivery loop panicked")?;

    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(result) => result.context("server task panicked")??,
        Err(_) => tracing::warn!("Connections still open after {:?}, exiting", SHUTDOWN_GRACE),
    }

    tracing::info!("Chathub stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("chathub={},tower_http=info", config.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
