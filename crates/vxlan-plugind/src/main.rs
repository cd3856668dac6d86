//! vxlan-plugind: Docker remote network driver for VXLAN overlays.

use anyhow::Context;
use clap::Parser;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vxlan_plugind::config::{DEFAULT_DRIVER_NAME, DEFAULT_SOCKET_PATH};
use vxlan_plugind::docker::DockerClient;
use vxlan_plugind::ebtables::Ebtables;
use vxlan_plugind::ip_links::IpLinks;
use vxlan_plugind::{api, Driver, DriverConfig, DriverContext, Scope};

/// VXLAN overlay network driver
#[derive(Parser, Debug)]
#[command(name = "vxlan-plugind")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Network scope reported to the daemon (local or global)
    #[arg(long, env = "VXLAN_SCOPE", default_value = "local")]
    scope: Scope,

    /// Default tunnel-endpoint device for networks that do not set VtepDev
    #[arg(long = "vtepdev", env = "VXLAN_VTEPDEV")]
    vtep_dev: Option<String>,

    /// Keep devices without endpoints and provision remote networks ahead of use
    #[arg(long, env = "VXLAN_ALLOW_EMPTY")]
    allow_empty: bool,

    /// Assign gateway addresses on this host regardless of scope
    #[arg(long, env = "VXLAN_LOCAL_GATEWAY")]
    local_gateway: bool,

    /// Assign gateway addresses on networks with globalGateway set
    #[arg(long, env = "VXLAN_GLOBAL_GATEWAY")]
    global_gateway: bool,

    /// Block gateway ARP on networks with blockGatewayArp set
    #[arg(long, env = "VXLAN_BLOCK_GATEWAY_ARP")]
    block_gateway_arp: bool,

    /// Leave devices in place on exit
    #[arg(long, env = "VXLAN_NO_REMOVE_DEVICE")]
    no_remove_device: bool,

    /// Discovery poll interval in seconds
    #[arg(long, env = "VXLAN_POLL_INTERVAL", default_value = "5")]
    poll_interval: u64,

    /// Driver kind this plugin answers for
    #[arg(long, env = "VXLAN_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// Plugin socket path
    #[arg(long, env = "VXLAN_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Enable debug logging
    #[arg(short, long, env = "VXLAN_DEBUG")]
    debug: bool,
}

impl Args {
    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            scope: self.scope,
            vtep_dev: self.vtep_dev.clone(),
            allow_empty: self.allow_empty,
            local_gateway: self.local_gateway,
            global_gateway: self.global_gateway,
            block_gateway_arp: self.block_gateway_arp,
            no_remove_device: self.no_remove_device,
            driver_name: self.driver_name.clone(),
            poll_interval: Duration::from_secs(self.poll_interval),
            socket_path: self.socket.clone(),
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}

/// Registers the handlers now and resolves once SIGINT, SIGTERM or SIGQUIT
/// arrives.
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()> + Send + 'static> {
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigquit = signal(SignalKind::quit()).context("failed to register SIGQUIT")?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigquit.recv() => info!("Received SIGQUIT"),
        }
    })
}

fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if path.exists() {
        warn!(socket = %path.display(), "Removing stale plugin socket");
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let config = args.driver_config();
    info!(
        scope = %config.scope,
        vtep_dev = config.vtep_dev.as_deref().unwrap_or("-"),
        allow_empty = config.allow_empty,
        local_gateway = config.local_gateway,
        global_gateway = config.global_gateway,
        block_gateway_arp = config.block_gateway_arp,
        no_remove_device = config.no_remove_device,
        "Starting vxlan-plugind"
    );

    let daemon = DockerClient::connect().context("failed to connect to the Docker daemon")?;
    let socket_path = config.socket_path.clone();
    let ctx = DriverContext::new(
        config,
        Arc::new(IpLinks::new()),
        Arc::new(daemon),
        Arc::new(Ebtables::new()),
    );
    let driver = Driver::new(ctx);
    driver.spawn_background();

    let listener = bind_socket(&socket_path)?;
    info!(socket = %socket_path.display(), "Serving plugin API");

    axum::serve(listener, api::router(driver.clone()))
        .with_graceful_shutdown(shutdown_signal()?)
        .await
        .context("plugin API server failed")?;

    driver.shutdown().await;
    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!(socket = %socket_path.display(), error = %e, "Failed to remove plugin socket");
    }
    info!("vxlan-plugind stopped");
    Ok(())
}
