//! flatdns CLI
//!
//! Command-line interface for the CNAME-flattening DNS proxy.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flat_dns::SelectionStrategy;
use flatdns_engine::{Config, Engine};

/// flatdns - a CNAME-flattening DNS proxy
#[derive(Parser)]
#[command(name = "flatdns")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "flatdns.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        /// Override the configured selection strategy
        #[arg(long)]
        strategy: Option<SelectionStrategy>,

        /// Override the configured listen port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "flatdns.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run { strategy, port } => run(cli.config, strategy, port).await,
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(
    config_path: PathBuf,
    strategy: Option<SelectionStrategy>,
    port: Option<u16>,
) -> Result<()> {
    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {:?}", config_path))?;
    info!("configuration loaded from {:?}", config_path);

    if let Some(strategy) = strategy {
        config.proxy.strategy = strategy.to_string();
    }
    if let Some(port) = port {
        config.proxy.port = port;
    }

    let engine = Engine::new(config).context("failed to create engine")?;
    let shutdown_tx = engine.create_shutdown_handle();

    let engine_handle = tokio::spawn(async move {
        if let Err(e) = engine.start().await {
            error!("engine error: {}", e);
            return Err(e);
        }
        Ok(())
    });

    wait_for_shutdown().await;
    info!("shutting down...");

    let _ = shutdown_tx.send(());

    // Give in-flight resolutions a bounded window to drain
    match tokio::time::timeout(std::time::Duration::from_secs(5), engine_handle).await {
        Ok(Ok(result)) => result.map_err(Into::into),
        Ok(Err(join_error)) => Err(anyhow::anyhow!("engine task failed: {}", join_error)),
        Err(_) => {
            error!("engine did not stop within the drain window");
            Ok(())
        }
    }
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("failed to write configuration to {:?}", output))?;

    info!("generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the upstream list before running.");

    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("failed to register SIGTERM handler: {}", e);
                let _ = signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            result = signal::ctrl_c() => {
                if result.is_ok() {
                    info!("received SIGINT");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}
