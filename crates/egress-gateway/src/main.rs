//! Egress gateway daemon
//!
//! Main entry point. Connects to the node agent, keeps the route table in
//! sync and programs the kernel until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use egress_gateway::netlink::NetlinkHandle;
use egress_gateway::{
    GatewayConfig, HealthAggregator, PolicySyncSource, RouteManager, RouteStore, SyncClient,
};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Egress gateway route sync daemon
#[derive(Parser, Debug)]
#[command(name = "egress-gateway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the route sync daemon
    Start(StartArgs),
}

#[derive(Args, Debug)]
struct StartArgs {
    /// IP address of this gateway's workload
    #[arg(env = "EGRESS_POD_IP")]
    gateway_ip: IpAddr,

    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node agent policy sync socket
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_severity: Option<String>,

    /// VXLAN network identifier
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=16_777_215))]
    vni: Option<u32>,

    /// VXLAN device to program
    #[arg(long)]
    tunnel_interface: Option<String>,

    /// Serve /readiness and /liveness on this port
    #[arg(long)]
    health_port: Option<u16>,
}

impl StartArgs {
    /// File (or default) configuration with command-line overrides applied.
    fn resolve_config(&self) -> Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::load_from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => GatewayConfig::default(),
        };

        if let Some(socket_path) = &self.socket_path {
            config.sync.socket_path = socket_path.clone();
        }
        if let Some(severity) = &self.log_severity {
            config.log_severity = severity.clone();
        }
        if let Some(vni) = self.vni {
            config.routing.vni = vni;
        }
        if let Some(tunnel_interface) = &self.tunnel_interface {
            config.routing.tunnel_interface = tunnel_interface.clone();
        }
        if let Some(port) = self.health_port {
            config.health.port = Some(port);
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Command::Start(args) = cli.command;

    let config = match args.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("egress-gateway: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.log_severity);
    info!(gateway_ip = %args.gateway_ip, "egress-gateway: Starting route sync daemon");

    match run_daemon(args.gateway_ip, config).await {
        Ok(()) => {
            info!("egress-gateway: Daemon exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let message = format!("{:#}", e);
            error!(error = %message, "egress-gateway: Daemon exiting with error");
            ExitCode::FAILURE
        }
    }
}

/// Initialize structured logging; `RUST_LOG` overrides the configured level.
fn init_logging(severity: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(severity));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .init();
}

#[cfg(target_os = "linux")]
fn kernel_handle() -> Result<Arc<dyn NetlinkHandle>> {
    let kernel = egress_gateway::netlink::NetlinkKernel::new()
        .context("Failed to open rtnetlink socket")?;
    Ok(Arc::new(kernel))
}

#[cfg(not(target_os = "linux"))]
fn kernel_handle() -> Result<Arc<dyn NetlinkHandle>> {
    anyhow::bail!("kernel programming is only supported on Linux")
}

async fn run_daemon(gateway_ip: IpAddr, config: GatewayConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let health = HealthAggregator::new();
    let nl = kernel_handle()?;

    let source = PolicySyncSource::new(config.sync.socket_path.clone())
        .with_subscription_type(config.sync.subscription_type.clone());
    let client =
        Arc::new(SyncClient::new(Arc::new(source)).with_reconnect_delay(config.reconnect_delay()));
    let store = RouteStore::new(gateway_ip);
    let manager = RouteManager::new(nl, &store, config.route_manager(), health.clone())
        .context("Failed to initialise route manager")?;

    info!(
        socket = %config.sync.socket_path.display(),
        tunnel = %config.routing.tunnel_interface,
        vni = config.routing.vni,
        "egress-gateway: Components initialised"
    );

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        async move { client.run(cancel).await }
    });
    tasks.spawn({
        let store = store.clone();
        let cancel = cancel.clone();
        async move { store.run(client, cancel).await }
    });
    tasks.spawn(manager.run(cancel.clone()));

    if let Some(port) = config.health.port {
        let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
        let health = health.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = egress_gateway::health::serve(health, addr, cancel).await {
                warn!(error = %e, "egress-gateway: Health server failed");
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "egress-gateway: Task panicked, shutting down");
            cancel.cancel();
        }
    }

    info!("egress-gateway: Graceful shutdown complete");
    Ok(())
}

/// Cancels `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("egress-gateway: Received shutdown signal");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "egress-gateway: Could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
