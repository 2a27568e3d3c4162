//! burrowd
//!
//! Command-line entry point for the burrow DNS tunnel server.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use burrow_engine::{Config, Server};

/// burrow - an IP-over-DNS tunnel server
#[derive(Parser)]
#[command(name = "burrowd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "burrow.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel server
    Run,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "burrow.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run => run_server(cli.config).await,
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "burrow_engine={0},burrow_protocol={0},burrow_tun={0},burrowd={0}",
            level
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[cfg(target_os = "linux")]
async fn run_server(config_path: PathBuf) -> Result<()> {
    use burrow_tun::{TunConfig, TunDevice};

    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let tun = TunDevice::open(&TunConfig {
        name: config.tun_device.clone(),
        ipv4: config.tun_ip,
        prefix_len: config.netmask,
        mtu: config.mtu,
    })
    .context("creating TUN device (root or CAP_NET_ADMIN required)")?;

    let mut server = Server::new(config, Box::new(tun))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            let _ = stop_tx.send(true);
        } else {
            // keep the channel open; the server stops on its own terms
            std::future::pending::<()>().await;
        }
    });

    info!("burrowd starting");
    if let Err(e) = server.run(stop_rx).await {
        error!("server error: {}", e);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_server(_config_path: PathBuf) -> Result<()> {
    anyhow::bail!("the burrow server only runs on Linux (TUN support)")
}

fn generate_config(output: PathBuf) -> Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists, not overwriting", output.display());
    }
    std::fs::write(&output, Config::sample())
        .with_context(|| format!("writing {}", output.display()))?;
    println!("wrote sample configuration to {}", output.display());
    Ok(())
}
