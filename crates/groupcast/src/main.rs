//! # groupcast
//!
//! Binary entry point. `serve` wires settings, logging, metrics and the
//! broker into a [`GroupcastServer`]; `client` runs the sequence-checking
//! client simulator against a room endpoint.

#![deny(unsafe_code)]

mod client;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use groupcast_broker::{Broker, MemoryBroker};
use groupcast_core::constants::{NAME, VERSION};
use groupcast_core::logging::{LogFormat, init_subscriber};
use groupcast_server::{GroupcastServer, ServerConfig};
use groupcast_settings::{BrokerKind, BrokerSettings, GroupcastSettings};
use tracing::{info, warn};

/// Group-broadcast server and client simulator.
#[derive(Parser, Debug)]
#[command(name = "groupcast", version, about = "Group-broadcast WebSocket server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server.
    Serve(ServeArgs),
    /// Connect to a room, send numbered messages and check for drops.
    Client(client::ClientArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Settings file (defaults to `~/.groupcast/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Broker backing group topics: `memory` or `redis`.
    #[arg(long)]
    broker: Option<BrokerKind>,

    /// Redis connection URL.
    #[arg(long)]
    redis_url: Option<String>,

    /// Maximum concurrent WebSocket connections.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Deliver a sender's own messages back to it.
    #[arg(long)]
    echo_to_sender: bool,

    /// Log filter directive.
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format: `compact` or `json`.
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl ServeArgs {
    fn load_settings(&self) -> Result<GroupcastSettings> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(groupcast_settings::settings_path);
        let mut settings = groupcast_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        self.apply(&mut settings);
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }

    /// Flags override every other settings source.
    fn apply(&self, settings: &mut GroupcastSettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(max) = self.max_connections {
            settings.server.max_connections = max;
        }
        if let Some(kind) = self.broker {
            settings.broker.kind = kind;
        }
        if let Some(ref url) = self.redis_url {
            settings.broker.url.clone_from(url);
        }
        if self.echo_to_sender {
            settings.session.echo_to_sender = true;
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

fn build_broker(settings: &BrokerSettings) -> Result<Arc<dyn Broker>> {
    match settings.kind {
        BrokerKind::Memory => Ok(Arc::new(MemoryBroker::new())),
        #[cfg(feature = "redis")]
        BrokerKind::Redis => {
            let broker = groupcast_broker::RedisBroker::new(&settings.url)
                .with_context(|| format!("Invalid redis url: {}", settings.url))?;
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "redis"))]
        BrokerKind::Redis => anyhow::bail!("redis broker requires the `redis` feature"),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let settings = args.load_settings()?;
    init_subscriber(&settings.logging.level, settings.logging.format);

    let broker = build_broker(&settings.broker)?;
    let config = ServerConfig::from_settings(&settings);
    let mut server = GroupcastServer::new(config, broker);
    match groupcast_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => warn!(error = %e, "metrics recorder not installed, /metrics disabled"),
    }

    let (addr, serve_task) = server
        .listen()
        .await
        .with_context(|| format!("Failed to bind {}", server.config().bind_addr()))?;
    info!(%addr, name = NAME, version = VERSION, broker = %settings.broker.kind, "ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown requested");

    if !server.shutdown().await {
        warn!("sessions still open at shutdown deadline");
    }
    if let Err(e) = serve_task.await {
        warn!(error = %e, "serve task ended abnormally");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            serve(args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Client(args) => {
            init_subscriber("warn", LogFormat::Compact);
            let outcome = client::run(args).await?;
            Ok(outcome.exit_code())
        }
    }
}
