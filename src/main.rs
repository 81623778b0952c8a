//! TenantCast - Multi-tenant realtime message fan-out
//!
//! Starts one node: bus, registry, tenant cache, rate counters and metrics.
//! Connect supervisors spawn on demand as sessions ask for tenant databases,
//! and stop on idle, operator events or region rebalancing.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use tenantcast::connect::{Node, PartitionMigrator};
use tenantcast::tenant::MemoryTenantStore;
use tenantcast::Config;

#[derive(Parser, Debug)]
#[command(name = "tenantcast")]
#[command(about = "Multi-tenant realtime message fan-out")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .init();

    info!("TenantCast v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        node = %config.node_name,
        region = %config.region,
        rpc_addr = %config.rpc_addr,
        "Starting TenantCast"
    );

    // The tenant CRUD API plugs in here; the in-memory store serves
    // single-node and development setups.
    let store = Arc::new(MemoryTenantStore::new());
    let node = Node::new(config, store, Arc::new(PartitionMigrator));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    node.shutdown_all().await;

    info!("TenantCast shutdown");
    Ok(())
}
