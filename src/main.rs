//! MeshGuard Node
//!
//! Runs the node's self-governance layer:
//! - collision detection and availability verification against peers
//! - the reachability endpoint peers call to verify us
//! - periodic rebuild of the container isolation firewall chain
//!
//! ## Configuration
//!
//! Settings come from an optional TOML file (`--config`); anything not set
//! there keeps its default. `RUST_LOG` overrides the log filter.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ed25519_dalek::SigningKey;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meshguard_node::availability::AvailabilityVerifier;
use meshguard_node::collision::CollisionDetector;
use meshguard_node::config::Config;
use meshguard_node::daemon_client::{BenchmarkClient, DaemonClient};
use meshguard_node::firewall::FirewallRuleBuilder;
use meshguard_node::health::HealthContext;
use meshguard_node::ip_change_guard::ShellWorkloads;
use meshguard_node::peer_client::HttpPeerClient;
use meshguard_node::reachability_api::{run_node_api, NodeApi, TcpPortProber};
use meshguard_node::shell::ShellRunner;

/// How often idle sliding window entries are purged
const RATE_LIMIT_PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// MeshGuard node health daemon
#[derive(Parser, Debug)]
#[command(name = "meshguard-node")]
#[command(version)]
#[command(about = "Node health, identity collision and firewall guard", long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Skip firewall management even if enabled in the config
    #[arg(long)]
    no_firewall: bool,
}

fn load_signing_key(config: &Config) -> anyhow::Result<SigningKey> {
    if config.node.identity_key_hex.is_empty() {
        warn!("No identity_key_hex configured, using an ephemeral identity");
        return Ok(SigningKey::from_bytes(&rand::random::<[u8; 32]>()));
    }

    let seed: [u8; 32] = hex::decode(&config.node.identity_key_hex)
        .context("identity_key_hex is not valid hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("identity_key_hex must be 32 bytes"))?;
    Ok(SigningKey::from_bytes(&seed))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(true)
        .init();

    info!("Starting MeshGuard node v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if args.no_firewall {
        config.firewall.enabled = false;
    }
    config.validate()?;

    let signing_key = load_signing_key(&config)?;
    let ctx = Arc::new(HealthContext::new());
    let request_timeout = Duration::from_secs(config.services.request_timeout_secs);

    let benchmark = Arc::new(BenchmarkClient::new(
        &config.services.benchmark_url,
        request_timeout,
    )?);
    let daemon = Arc::new(DaemonClient::new(&config.services.daemon_url, request_timeout)?);
    let peers = Arc::new(HttpPeerClient::new(
        signing_key,
        &config.availability.reachability_path,
        config.node.api_port,
        Duration::from_secs(config.availability.peer_timeout_secs),
    )?);
    info!("Node identity: {}", peers.public_key_hex());

    let runner = Arc::new(ShellRunner::with_timeout(Duration::from_secs(
        config.firewall.command_timeout_secs,
    )));
    let workloads = Arc::new(ShellWorkloads::new(
        runner.clone(),
        &config.workloads.list_command,
        &config.workloads.remove_command,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // Firewall
    if config.firewall.enabled {
        let builder = Arc::new(FirewallRuleBuilder::new(config.firewall.clone(), runner.clone())?);
        let interval = Duration::from_secs(config.firewall.rebuild_interval_secs);
        tasks.push(tokio::spawn(builder.run_periodic(interval, shutdown_rx.clone())));
    } else {
        info!("Firewall management disabled");
    }

    // Collision detection + availability
    let verifier = AvailabilityVerifier::new(
        ctx.clone(),
        config.availability.clone(),
        config.node.api_port,
        benchmark.clone(),
        daemon.clone(),
        peers.clone(),
        daemon.clone(),
        daemon.clone(),
        workloads,
    );
    let detector = Arc::new(CollisionDetector::new(
        ctx.clone(),
        config.collision.clone(),
        &config.node.collateral,
        config.node.api_port,
        benchmark,
        daemon.clone(),
        daemon.clone(),
        peers,
        daemon.clone(),
        daemon.clone(),
        verifier,
    ));
    tasks.push(tokio::spawn(detector.run(shutdown_rx.clone())));

    // Node API
    let api = Arc::new(NodeApi::new(
        ctx.clone(),
        &config,
        daemon,
        Arc::new(TcpPortProber::default()),
    ));

    let purge_api = api.clone();
    let mut purge_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(RATE_LIMIT_PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let purged = purge_api.purge_rate_limits();
                    if purged > 0 {
                        tracing::debug!("Purged {} idle rate limit entries", purged);
                    }
                }
                _ = purge_shutdown.changed() => break,
            }
        }
    }));

    let addr: SocketAddr = format!("{}:{}", config.node.bind, config.node.api_port)
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.node.bind))?;
    let server = tokio::spawn(run_node_api(addr, api, shutdown_rx));

    info!("Node running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    match server.await {
        Ok(Err(e)) => error!("Node API error: {}", e),
        Err(e) => error!("Node API task failed: {}", e),
        Ok(Ok(())) => {}
    }
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!("Background task failed: {}", e);
        }
    }

    info!("MeshGuard node stopped");
    Ok(())
}
