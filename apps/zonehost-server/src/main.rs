mod auth;
mod bootstrap;
mod config;
mod net;
mod simulate;

use auth::TokenAuthenticator;
use clap::{Parser, Subcommand};
use config::ServerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use zonehost_kernel::{CoreInspector, StopOutcome};

#[derive(Parser)]
#[command(name = "zonehost", about = "Authoritative tick server for zoned multiplayer simulations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and built-in plugins
    Info,
    /// Run the server until Ctrl-C
    Serve {
        /// Override the configured listen address
        #[arg(short, long)]
        bind: Option<std::net::SocketAddr>,
    },
    /// Run a headless simulation with scripted bots
    Simulate {
        /// Number of ticks to run
        #[arg(short, long, default_value = "20")]
        ticks: u64,
        /// Number of scripted players
        #[arg(short, long, default_value = "4")]
        bots: usize,
    },
}

fn init_logging(verbose: bool, configured: Option<&str>) {
    let fallback = if verbose {
        "debug"
    } else {
        configured.unwrap_or("info")
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    init_logging(cli.verbose, config.log_filter.as_deref());

    match cli.command {
        Commands::Info => {
            println!("zonehost v{}", env!("CARGO_PKG_VERSION"));
            let catalog = zonehost_plugins::builtin_catalog();
            println!("plugins: {}", catalog.names().join(", "));
            println!(
                "tick interval: {}ms, store: {:?}",
                config.core.tick_interval_ms, config.store
            );
        }
        Commands::Serve { bind } => serve(config, bind).await?,
        Commands::Simulate { ticks, bots } => {
            println!("Simulating {ticks} ticks with {bots} bots");
            let report = simulate::run(&config, ticks, bots).await?;
            for stats in &report.ticks {
                println!("{stats}");
            }
            println!("{}", report.summary);
            println!("observer received {} ticks", report.observed_ticks);
        }
    }

    Ok(())
}

async fn serve(mut config: ServerConfig, bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    if let Some(bind) = bind {
        config.bind = bind;
    }
    let authenticator = TokenAuthenticator::new(&config.tokens);
    if authenticator.is_empty() {
        tracing::warn!("no access tokens configured; every client will be rejected");
    }
    let store = bootstrap::open_store(&config.store).await?;
    let core = bootstrap::build_core(&config, store, Arc::new(authenticator)).await;

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    let transport = net::TransportConfig {
        client_queue: config.client_queue,
        max_frame_bytes: config.max_frame_bytes,
        handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
        reply_timeout: config.core.send_timeout(),
    };
    let shutdown = CancellationToken::new();
    let accept = tokio::spawn(net::serve(listener, core.clone(), transport, shutdown.clone()));
    core.scheduler.start()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    shutdown.cancel();
    core.registry.close_all();
    if core.scheduler.stop().await == StopOutcome::Forced {
        tracing::warn!("scheduler did not stop within the grace period");
    }
    accept.await??;
    println!("{}", CoreInspector::summary(&core.scheduler));
    Ok(())
}
