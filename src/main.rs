//! Sensor Seal Gateway Server.
//!
//! UDP endpoint for sensor-seal edge gateways: authenticates them against
//! a provisioned key table, decrypts SSGSCP telemetry, drives the
//! reliable-delivery protocol and logs decoded measurements.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssgs::config;
use ssgs::protocol::seal::SealUpdateParser;
use ssgs::server::{self, ConnectionHook, Gateway, Server};

#[derive(Parser)]
#[command(name = "ssgs")]
#[command(about = "Sensor Seal Gateway Server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server
    Serve {
        /// Path to the authorized-gateway config file
        #[arg(short, long, default_value = "./config.json")]
        config: PathBuf,

        /// UDP port to bind
        #[arg(short, long, default_value_t = server::DEFAULT_PORT)]
        port: u16,

        /// Evict gateways idle for this many seconds (off when absent)
        #[arg(long)]
        idle_timeout: Option<u64>,
    },

    /// Generate authorized-gateway config entries
    GenGateway {
        /// Number of entries to generate
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Serve {
            config,
            port,
            idle_timeout,
        } => serve(config, port, idle_timeout).await,
        Commands::GenGateway { count } => gen_gateway(count),
    }
}

async fn serve(config_path: PathBuf, port: u16, idle_timeout: Option<u64>) -> Result<()> {
    let table = config::GatewayTable::load(&config_path)?;
    if table.is_empty() {
        tracing::warn!("config authorizes no gateways; every datagram will be dropped");
    }
    tracing::info!("Loaded {} authorized gateway(s)", table.len());

    let on_connection: ConnectionHook = Box::new(|gw: &mut Gateway| {
        let uid = gw.uid;
        tracing::info!("Gateway {} connected from {}", uid, gw.remote_addr);

        gw.on_message(move |update| {
            let seal = update
                .seal_uid
                .map(|uid| format!("{:02x}{:02x}{:02x}{:02x}", uid[0], uid[1], uid[2], uid[3]))
                .unwrap_or_else(|| "?".into());
            tracing::info!(
                "Gateway {} seal {}: temp={:?} vib={:?} rpm={:?} volt={:?} msg={:?}",
                uid,
                seal,
                update.temperature,
                update.vibration,
                update.rpm,
                update.voltage,
                update.msg_id
            );
        });
        gw.on_reconnect(move || {
            tracing::info!("Gateway {} reconnected", uid);
        });
    });

    let mut server = Server::bind(port, table, on_connection, Box::new(SealUpdateParser)).await?;
    if let Some(secs) = idle_timeout {
        server.set_idle_timeout(Some(Duration::from_secs(secs)));
    }
    server.run().await
}

/// Print freshly generated gateway credentials as config-file entries.
fn gen_gateway(count: usize) -> Result<()> {
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let mut uid = [0u8; 4];
        let mut key = [0u8; 32];
        getrandom::getrandom(&mut uid)
            .map_err(|e| anyhow::anyhow!("system randomness unavailable: {}", e))?;
        getrandom::getrandom(&mut key)
            .map_err(|e| anyhow::anyhow!("system randomness unavailable: {}", e))?;
        entries.push(serde_json::json!({
            "uid": hex_string(&uid),
            "key": hex_string(&key),
        }));
    }

    let doc = serde_json::json!({ "authorized_gateways": entries });
    println!(
        "{}",
        serde_json::to_string_pretty(&doc).context("serializing config entries")?
    );
    Ok(())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
