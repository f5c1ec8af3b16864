//! agentd — the agentgrid daemon.
//!
//! Runs one machine of an agent cluster:
//! - Hub: public HTTP API, edge tunnel endpoint, peer hub heartbeats
//! - Edge: outbound tunnel to a hub, local HTTP API
//!
//! Both roles host agents through the in-memory backend and route
//! messages across the cluster.
//!
//! # Usage
//!
//! ```text
//! agentd hub --machine-id hub-1 --port 9100 --public-url http://203.0.113.4:9100 --secret S
//! agentd edge --machine-id laptop --hub http://203.0.113.4:9100 --secret S
//! agentd --config /etc/agentgrid/agentd.toml hub
//! ```

mod edge_mode;
mod hub_mode;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use agentgrid_core::AgentdConfig;

#[derive(Parser)]
#[command(name = "agentd", about = "agentgrid daemon")]
struct Cli {
    /// Path to agentd.toml. Flags override file values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run as a hub: publicly reachable, accepts edge tunnels.
    Hub {
        #[command(flatten)]
        common: CommonArgs,

        /// Externally reachable base URL advertised to peers.
        #[arg(long)]
        public_url: Option<String>,

        /// Peer hub URL to announce this hub to at startup (repeatable).
        #[arg(long)]
        join: Vec<String>,
    },
    /// Run as an edge: dials out to a hub and keeps the tunnel alive.
    Edge {
        #[command(flatten)]
        common: CommonArgs,

        /// Candidate hub address (repeatable, tried in order).
        #[arg(long = "hub")]
        hubs: Vec<String>,
    },
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Port for the local HTTP API [default: 9100].
    #[arg(long)]
    port: Option<u16>,

    /// Unique machine id within the cluster.
    #[arg(long)]
    machine_id: Option<String>,

    /// Shared cluster secret. Omit to run unauthenticated.
    #[arg(long)]
    secret: Option<String>,

    /// Backend kinds this machine offers (repeatable).
    #[arg(long = "capability")]
    capabilities: Vec<String>,
}

impl CommonArgs {
    fn apply(self, config: &mut AgentdConfig) {
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        if let Some(machine_id) = self.machine_id {
            config.machine_id = Some(machine_id);
        }
        if let Some(secret) = self.secret {
            config.secret = Some(secret);
        }
        if !self.capabilities.is_empty() {
            config.capabilities = self.capabilities;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = match &cli.config {
        Some(path) => {
            let config = AgentdConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            config
        }
        None => AgentdConfig::default(),
    };

    match cli.command {
        Command::Hub {
            common,
            public_url,
            join,
        } => {
            common.apply(&mut config);
            if public_url.is_some() {
                config.public_url = public_url;
            }
            if !join.is_empty() {
                config.join = join;
            }
            let machine_id = require_machine_id(&config)?;
            hub_mode::run_hub(machine_id, config).await
        }
        Command::Edge { common, hubs } => {
            common.apply(&mut config);
            if !hubs.is_empty() {
                config.hubs = hubs;
            }
            let machine_id = require_machine_id(&config)?;
            edge_mode::run_edge(machine_id, config).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,agentd=debug,agentgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn require_machine_id(config: &AgentdConfig) -> anyhow::Result<String> {
    config
        .machine_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| anyhow::anyhow!("machine_id is required (--machine-id or agentd.toml)"))
}

/// Resolves on Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
