// Shoal peer daemon: discovery via rendezvous, file gossip, downloads, console.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shoal_node::{config, console, Node, Rendezvous};
use tokio::io::BufReader;
use tracing::{error, info};

/// Shoal - peer-to-peer file sharing
#[derive(Parser)]
#[command(name = "shoal-node")]
#[command(version)]
#[command(about = "Shoal - peer-to-peer file sharing over a rendezvous service")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default: ~/.config/shoal/config.toml, then /etc/shoal/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the network and share a directory
    Peer {
        /// Listening port
        port: u16,
        /// Directory whose files are shared
        shared_dir: PathBuf,
        /// Host to listen on and register with the rendezvous service
        #[arg(long)]
        host: Option<String>,
        /// Rendezvous service address (host:port)
        #[arg(long)]
        rendezvous: Option<String>,
        /// Directory downloads are written to
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },
    /// Run the rendezvous service
    Rendezvous {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:12345")]
        bind: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async move {
        match cli.command {
            Commands::Peer {
                port,
                shared_dir,
                host,
                rendezvous,
                download_dir,
            } => {
                let mut cfg = config::load(cli.config.as_deref())?;
                cfg.port = port;
                cfg.shared_dir = shared_dir;
                if let Some(host) = host {
                    cfg.host = host;
                }
                if let Some(rendezvous) = rendezvous {
                    cfg.rendezvous = rendezvous;
                }
                if let Some(dir) = download_dir {
                    cfg.download_dir = dir;
                }
                run_peer(cfg).await
            }
            Commands::Rendezvous { bind } => run_rendezvous(&bind).await,
        }
    });
    // a console read may still be parked on stdin
    rt.shutdown_background();
    result
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "warn,shoal_node=info",
        1 => "info,shoal_node=debug",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

async fn run_peer(cfg: config::Config) -> Result<()> {
    let mut node = Node::bind(cfg).await?;
    if let Err(e) = node.start().await {
        error!(error = %e, "couldn't join the network, closing");
        return Err(e.into());
    }
    println!("Found {} peer(s) in registry...", node.peers().await.len());

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = console::run(&node, stdin) => result.context("console input failed")?,
        result = shutdown_signal() => {
            result?;
            println!("\nExiting...");
        }
    }
    node.shutdown().await;
    Ok(())
}

async fn run_rendezvous(bind: &str) -> Result<()> {
    let server = Rendezvous::bind(bind)
        .await
        .with_context(|| format!("cannot listen on {}", bind))?;
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(server.run(stop_rx));
    shutdown_signal().await?;
    info!("shutting down rendezvous service");
    stop_tx.send_replace(true);
    task.await??;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
