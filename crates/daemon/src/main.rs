//! wgmint daemon
//!
//! Provisions WireGuard devices and peers: reconciles durable records
//! against live interfaces at startup, serves the provisioning API, and
//! unwinds every host-level side effect on shutdown.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod accounts;
mod command;
mod config;
mod http;
mod lifecycle;
mod peers;

use accounts::Authorizer;
use command::{Commander, SystemExecutor};
use config::DaemonConfig;
use lifecycle::DeviceManager;
use peers::Provisioner;
use wgmint_common::{OsRandom, RandomSource, Store};

#[derive(Parser)]
#[command(name = "wgmintd")]
#[command(about = "wgmint daemon - WireGuard device and peer provisioning")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.wgmint/config.toml")]
    config: PathBuf,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    listen: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("wgmint daemon v{}", env!("CARGO_PKG_VERSION"));

    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    config.http_listen = cli.listen;

    tokio::fs::create_dir_all(&config.store_path).await?;
    let store = Store::open(config.db_path())?;

    let executor = Arc::new(SystemExecutor::new(config.use_sudo));
    let commander = Arc::new(Commander::new(executor));
    let devices = Arc::new(DeviceManager::new(
        store.clone(),
        commander.clone(),
        config.clone(),
    ));
    let authorizer = Authorizer::new(store.clone(), &config.accounts);
    let provisioner = Provisioner::new(store.clone(), commander, devices.clone());
    let rng: Arc<dyn RandomSource> = Arc::new(OsRandom);

    // Startup order is strict: devices first, then the master account, then
    // peer replay. A failure anywhere leaves the host network untouched.
    devices.startup(rng.as_ref()).await?;
    if let Err(e) = startup_records(&authorizer, &provisioner, rng.as_ref()).await {
        error!("startup failed, tearing down: {}", e);
        devices.teardown().await;
        return Err(e.into());
    }
    info!("initialization complete");

    let state = Arc::new(http::AppState {
        store,
        authorizer,
        provisioner,
        devices: devices.clone(),
        rng,
    });
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&config.http_listen).await?;
    info!("listening on {}", config.http_listen);

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("http server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    devices.teardown().await;
    info!("daemon shutdown complete");
    Ok(())
}

/// Durable-record startup after the interfaces are live: seed the master
/// account on first run, then replay every stored peer.
async fn startup_records(
    authorizer: &Authorizer,
    provisioner: &Provisioner,
    rng: &dyn RandomSource,
) -> wgmint_common::Result<()> {
    authorizer.ensure_master(rng)?;
    provisioner.replay_all().await?;
    Ok(())
}
