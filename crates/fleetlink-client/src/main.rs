//! FleetLink gateway client: command-line entry point.
//!
//! Connects to a gateway, negotiates the schema, starts the event stream and
//! logs the events it is told to watch until Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! fleetlink-client [OPTIONS]
//!
//! Options:
//!   --url <URL>                 Gateway WebSocket URL
//!   --config <PATH>             TOML config file [default: platform config dir]
//!   --schema-min <N>            Oldest schema version accepted
//!   --schema-preferred <N>      Schema version requested when available
//!   --watch <EVENT>             Event name to log (repeatable) [default: driver events]
//!   --ready-timeout <SECS>      Seconds to wait for negotiation [default: 30]
//!   --no-listen                 Connect and negotiate only
//! ```
//!
//! # Precedence
//!
//! CLI flag > environment variable > config file > built-in default.
//!
//! | Variable            | Flag         |
//! |---------------------|--------------|
//! | `FLEETLINK_URL`     | `--url`      |
//! | `FLEETLINK_CONFIG`  | `--config`   |
//! | `RUST_LOG`          | (log filter, falls back to `gateway.log_level`) |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleetlink_client::infrastructure::storage::config::{load_config, ClientConfig};
use fleetlink_client::{build_client, ListenerHandle, SubscriptionFilter, WsConnector};
use fleetlink_core::protocol::messages::driver_event;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Client for a remote device command/event gateway.
#[derive(Debug, Parser)]
#[command(
    name = "fleetlink-client",
    about = "Connects to a device gateway, negotiates the schema and streams events",
    version
)]
struct Cli {
    /// Gateway WebSocket URL; overrides `gateway.url` from the config file.
    #[arg(long, env = "FLEETLINK_URL")]
    url: Option<String>,

    /// Path of the TOML config file.
    #[arg(long, env = "FLEETLINK_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    schema_min: Option<u32>,

    #[arg(long)]
    schema_preferred: Option<u32>,

    /// Event names to log.  Driver connect/disconnect when none are given.
    #[arg(long = "watch")]
    watch: Vec<String>,

    /// Seconds to wait for the connection to become ready.
    #[arg(long, default_value_t = 30)]
    ready_timeout: u64,

    /// Do not send `start_listening` after negotiation.
    #[arg(long)]
    no_listen: bool,
}

impl Cli {
    /// Applies the command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(url) = &self.url {
            config.gateway.url = url.clone();
        }
        if let Some(min) = self.schema_min {
            config.schema.min_version = min;
        }
        if let Some(preferred) = self.schema_preferred {
            config.schema.preferred_version = preferred;
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.gateway.log_level)),
        )
        .init();

    info!("FleetLink client starting, gateway={}", config.gateway.url);

    let client = build_client(
        config.session_config(),
        config.client_options(),
        Arc::new(WsConnector),
    );

    let _state_log = client.on_state_change(|snapshot| {
        info!(state = ?snapshot.state, driver = snapshot.driver_connected, "connection state changed");
    });
    let _error_log = client.on_error(|e| error!("gateway client error: {e}"));

    client
        .connect()
        .await
        .with_context(|| format!("could not connect to {}", config.gateway.url))?;

    let ready_timeout = Duration::from_secs(cli.ready_timeout);
    client
        .wait_until_ready(ready_timeout)
        .await
        .context("gateway did not become ready")?;
    if let Some(info) = client.schema_info() {
        info!(
            "schema negotiated: version {:?}, gateway range {}..={}",
            info.negotiated, info.server_min, info.server_max
        );
    }

    let _watchers: Vec<ListenerHandle> = if cli.no_listen {
        Vec::new()
    } else {
        let watchers = register_watchers(&client, &cli.watch);
        let state = client
            .start_listening()
            .await
            .context("start_listening failed")?;
        info!(
            "listening, driver connected: {}",
            state
                .pointer("/state/driver/connected")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
        );
        watchers
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => warn!("failed to listen for Ctrl+C signal: {e}"),
    }

    client.shutdown().await;
    let stats = client.validator_stats();
    info!(
        "FleetLink client stopped, frames accepted={}, rejected={}, rate limited={}",
        stats.processed, stats.rejected, stats.rate_limited
    );
    Ok(())
}

fn register_watchers(
    client: &fleetlink_client::GatewayClient,
    watch: &[String],
) -> Vec<ListenerHandle> {
    let names: Vec<String> = if watch.is_empty() {
        [driver_event::CONNECTED, driver_event::DISCONNECTED]
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else {
        watch.to_vec()
    };

    names
        .into_iter()
        .map(|name| {
            client.add_event_listener(name, SubscriptionFilter::default(), |event| {
                info!(
                    source = %event.source,
                    event = %event.event,
                    serial = event.serial_number().unwrap_or("-"),
                    "gateway event"
                );
            })
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
