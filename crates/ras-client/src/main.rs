//! RAS client
//!
//! Pairs with a daemon from its QR text, then stays connected across
//! address changes until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ras_client::ClientRuntime;
use ras_core::config::{self, ClientConfig};
use ras_protocol::PairingPayload;

#[derive(Parser)]
#[command(name = "ras-client")]
#[command(about = "RAS client - pair with a daemon and keep the channel alive")]
#[command(version)]
struct Args {
    /// Run in foreground with verbose output
    #[arg(short, long, global = true)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pair using the text encoded in the daemon's QR code
    Pair {
        /// Base64 pairing payload
        #[arg(long, env = "RAS_PAYLOAD")]
        payload: String,
    },

    /// Decode a pairing payload without connecting
    Inspect {
        /// Base64 pairing payload
        #[arg(long)]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_client_config_path);
    let config: ClientConfig = config::load_config_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    match args.command {
        Command::Pair { payload } => pair(&config, &payload).await,
        Command::Inspect { payload } => inspect(&payload),
    }
}

async fn pair(config: &ClientConfig, payload: &str) -> Result<()> {
    tracing::info!("RAS client starting...");

    let runtime = ClientRuntime::start(config, payload.trim()).await?;
    let mut path = runtime.path();
    let mut events = runtime.reconnect_events();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, disconnecting");
                break;
            }
            changed = path.changed() => {
                if changed.is_err() {
                    break;
                }
                match path.borrow_and_update().as_ref() {
                    Some(current) => println!("connected: {}", current),
                    None => println!("disconnected"),
                }
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    tracing::debug!("Reconnect event: {:?}", event);
                }
            }
        }
    }

    runtime.disconnect().await;
    Ok(())
}

fn inspect(payload: &str) -> Result<()> {
    let payload =
        PairingPayload::from_qr_text(payload.trim()).context("Not a valid pairing code")?;

    println!("version:     {}", payload.version());
    println!("rendezvous:  {}", payload.rendezvous());
    println!("session:     {}", payload.session_id());
    println!("relay topic: {}", payload.relay_topic());
    if let Some(addr) = payload.overlay_address() {
        println!("overlay:     {}", addr);
    }
    if let Some(addr) = payload.public_address() {
        println!("public:      {}", addr);
    }
    Ok(())
}
