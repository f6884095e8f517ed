//! RAS Daemon
//!
//! Runs on the host. Creates the pairing the client scans, then answers
//! the client on whichever path reaches it and announces address changes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ras_core::config::{self, DaemonConfig};
use ras_daemon::pairing::{self, PairingRecord};
use ras_daemon::{Daemon, DaemonEvent};

#[derive(Parser)]
#[command(name = "ras-daemon")]
#[command(about = "RAS host daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long, global = true)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Create the pairing record and print its QR text
    Init {
        /// Replace an existing pairing (the old client is unpaired)
        #[arg(long)]
        force: bool,
    },

    /// Print the stored pairing's QR text
    Show,

    /// Run the daemon (default)
    Run {
        /// Signaling bind address (overrides config)
        #[arg(short, long)]
        bind: Option<std::net::SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_daemon_config_path);
    let config: DaemonConfig = config::load_config_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    match args.command.unwrap_or(Command::Run { bind: None }) {
        Command::Init { force } => {
            let record = pairing::load_or_generate(&config, force).await?;
            print_record(&record);
            Ok(())
        }
        Command::Show => {
            let record = PairingRecord::load(&config.pairing_path)
                .context("No pairing yet, run `ras-daemon init`")?;
            print_record(&record);
            Ok(())
        }
        Command::Run { bind } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.signaling_bind = bind;
            }
            run(config).await
        }
    }
}

fn print_record(record: &PairingRecord) {
    let payload = record.payload();
    println!("session:    {}", record.session_id());
    println!("rendezvous: {}", payload.rendezvous());
    if let Some(addr) = payload.overlay_address() {
        println!("overlay:    {}", addr);
    }
    if let Some(addr) = payload.public_address() {
        println!("public:     {}", addr);
    }
    println!();
    println!("{}", record.qr_text());
}

async fn run(config: DaemonConfig) -> Result<()> {
    tracing::info!("RAS daemon starting...");

    let record = pairing::load_or_generate(&config, false).await?;
    let daemon = Daemon::bind(config, record).await?;
    tracing::info!(
        "Session {} signaling on {}, transport on {}",
        daemon.state().session_id(),
        daemon.signaling_addr()?,
        daemon.transport_addr()?
    );

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let mut events = daemon.state().subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            };
            match event {
                DaemonEvent::ClientConnected { path_type, peer } => {
                    tracing::info!("Client connected via {} ({:?})", path_type, peer);
                }
                DaemonEvent::ClientDisconnected { path_type } => {
                    tracing::info!("Client on {} disconnected", path_type);
                }
                DaemonEvent::Data(data) => {
                    tracing::trace!("{} bytes from client", data.len());
                }
            }
        }
    });

    daemon.run(cancel).await?;

    tracing::info!("Daemon shutdown complete");
    Ok(())
}
