//! Weaving-loom monitor.
//!
//! Polls every loom over Modbus TCP, tracks run/stop state per machine and
//! pushes the result to the central collector.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use loomwatch_modbus::config::validate_machines;
use loomwatch_modbus::{
    HealthServer, HttpCollector, LivenessBoard, MachineConfig, MachinePoller, MachineRegistry,
    MonitorConfig, Overrides, Publisher,
};

/// Weaving-loom monitor (Modbus TCP).
#[derive(Parser, Debug)]
#[command(name = "loomwatch-modbus")]
#[command(about = "Polls loom controllers and publishes run/stop state")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Default loom host for machines without an address
    #[arg(long, env = "LOOM_IP")]
    loom_ip: Option<String>,

    /// Modbus TCP port
    #[arg(long, env = "LOOM_PORT")]
    loom_port: Option<u16>,

    /// Modbus unit id (profile default when unset)
    #[arg(long, env = "UNIT_ID")]
    unit_id: Option<u8>,

    /// First register of the read window, 1-based (profile default when unset)
    #[arg(long, env = "START_ADDR")]
    start_addr: Option<u16>,

    /// Registers per read (profile default when unset)
    #[arg(long, env = "COUNT")]
    count: Option<u16>,

    /// Health endpoint port
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Collector workspace id
    #[arg(long, env = "WORKSPACE_ID")]
    workspace_id: Option<String>,

    /// Collector API key
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            default_host: self.loom_ip.clone(),
            port: self.loom_port,
            unit_id: self.unit_id,
            start_address: self.start_addr,
            count: self.count,
            health_port: self.port,
            workspace_id: self.workspace_id.clone(),
            api_key: self.api_key.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = MonitorConfig::load_with_overrides(args.config.as_deref(), &args.overrides())
        .with_context(|| match &args.config {
            Some(path) => format!("Failed to load config from {:?}", path),
            None => "Invalid configuration".to_string(),
        })?;

    loomwatch_common::init_tracing(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting loomwatch-modbus");
    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let registry = Arc::new(MachineRegistry::new());
    let liveness = Arc::new(LivenessBoard::new());
    let collector = HttpCollector::new(&config.collector)?;

    let machines = resolve_machines(&config, &collector, &registry).await?;
    validate_machines(&machines)?;

    let listen_addr: SocketAddr = config
        .health
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start pollers for each machine
    let mut tasks = Vec::new();
    for machine in machines.iter().cloned() {
        let poller = MachinePoller::new(machine, &config.modbus, &registry, liveness.clone());
        tasks.push(tokio::spawn(poller.run()));
    }

    info!(
        "Monitoring {} machine(s): {}",
        machines.len(),
        machines
            .iter()
            .map(|m| m.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let publisher = Arc::new(Publisher::new(
        collector,
        registry.clone(),
        config.collector.publish_interval(),
    ));
    tasks.push(tokio::spawn(publisher.run()));

    let health_server = HealthServer::new(liveness.clone(), listen_addr);
    let http_task = tokio::spawn(async move {
        if let Err(e) = health_server.run(shutdown_rx).await {
            error!("Health endpoint error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    for task in tasks {
        task.abort();
    }

    shutdown_tx.send(true)?;
    let _ = tokio::time::timeout(Duration::from_secs(5), http_task).await;

    info!(machines = registry.len(), "Loom monitor stopped");
    Ok(())
}

/// Static machines from the config file, or the collector's list for this workspace.
async fn resolve_machines(
    config: &MonitorConfig,
    collector: &HttpCollector,
    registry: &MachineRegistry,
) -> Result<Vec<MachineConfig>> {
    if !config.machines.is_empty() {
        info!(count = config.machines.len(), "Using static machine list");
        return Ok(config.machines.clone());
    }

    info!(workspace = %config.collector.workspace_id, "Fetching machine list from collector");
    let listing = collector
        .fetch_machines()
        .await
        .context("Failed to fetch machine list")?;

    let machines = listing.seed_into(registry);
    info!(
        count = machines.len(),
        seeded = registry.len(),
        "Machine list received"
    );
    Ok(machines)
}
