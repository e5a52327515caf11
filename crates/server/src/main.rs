//! VPS Forge daemon: ephemeral single-node QEMU/KVM VM control plane.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vps_common::ServerConfig;
use vps_core::Controller;

mod auth;
mod error;
mod routes;

#[derive(Parser)]
#[command(name = "vpsd")]
#[command(about = "Ephemeral VM control plane daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/vps-forge/config.toml")]
    config: PathBuf,

    /// Store directory (overrides the config file's store_path)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP listen address (overrides the config file's listen address)
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Run in the foreground (logs to stdout either way; reserved for service-manager parity)
    #[arg(short, long)]
    foreground: bool,
}

/// Installs a panic hook that reclaims all tracked VMs before handing off to the default
/// hook. Panic hooks run synchronously on the panicking thread, so cleanup runs on a throwaway
/// single-threaded runtime rather than trying to reach back into the main Tokio runtime.
fn install_panic_hook(controller: Arc<Controller>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("daemon panicked, reclaiming all VMs before unwinding: {info}");
        let controller = controller.clone();
        let cleanup = std::thread::spawn(move || {
            match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt.block_on(controller.lifecycle.shutdown_all()),
                Err(e) => error!("could not build cleanup runtime during panic: {e}"),
            }
        });
        let _ = cleanup.join();
        default_hook(info);
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    info!("vps-forge daemon v{}", vps_common::VERSION);

    let api_key = std::env::var("API_KEY")
        .map_err(|_| anyhow::anyhow!("API_KEY must be set in the environment"))?;

    let mut config = ServerConfig::load(&cli.config, api_key)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    tokio::fs::create_dir_all(config.base_dir()).await?;
    tokio::fs::create_dir_all(config.disks_dir()).await?;
    tokio::fs::create_dir_all(config.logs_dir()).await?;

    let config = Arc::new(config);
    let controller = Arc::new(Controller::new(config.clone()));
    install_panic_hook(controller.clone());
    let metrics_handle = controller.spawn_metrics_loop();

    let app = routes::build_router(controller.clone(), config.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("listening on {}", config.listen);

    let shutdown_controller = controller.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, reclaiming all VMs"),
            _ = sigterm.recv() => info!("received SIGTERM, reclaiming all VMs"),
        }
        shutdown_controller.lifecycle.shutdown_all().await;
    });

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("HTTP server error: {e}");
            }
        }
        result = metrics_handle => {
            if let Err(e) = result {
                error!("metrics loop panicked: {e}");
            }
        }
    }

    info!("vps-forge daemon shutdown complete");
    Ok(())
}
