use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use listenstats::config::loader::{load_config, load_from_env};
use listenstats::config::watcher::ConfigWatcher;
use listenstats::http::tls::load_tls_config;
use listenstats::lifecycle::{build_state, signals::spawn_signal_handler, spawn_rate_store_sweeper};
use listenstats::observability::{logging::init_logging, metrics::init_metrics};
use listenstats::{HttpServer, ServiceRoutes, Shutdown};

#[derive(Parser)]
#[command(name = "listenstats")]
#[command(
    about = "Session and upstream gateway for the listening-statistics service",
    long_about = None
)]
struct Args {
    /// TOML config file. Without it, defaults plus LISTENSTATS_* environment variables are used.
    #[arg(short, long, env = "LISTENSTATS_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => load_from_env()?,
    };

    init_logging(&config.observability, config.environment);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.environment,
        bind_address = %config.listener.bind_address,
        rate_store = ?config.rate_limit.store,
        "listenstats starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let state = build_state(config).await?;
    let sweeper = spawn_rate_store_sweeper(&state, &shutdown);

    // The watcher must stay alive for reloads to keep arriving.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let limiter = state.limiter.clone();
            tokio::spawn(async move {
                while let Some(next) = updates.recv().await {
                    limiter.update_policies(&next.rate_limit);
                }
            });
            match watcher.run() {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(error = %e, "Config hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    let bind_address = state.config.listener.bind_address.clone();
    let tls = state.config.listener.tls.clone();
    let server = HttpServer::new(state, ServiceRoutes::default());

    match tls {
        Some(tls) => {
            let rustls = load_tls_config(&tls).await?;
            server.run_tls(bind_address.parse()?, rustls, shutdown.wait()).await?;
        }
        None => {
            let listener = TcpListener::bind(&bind_address).await?;
            server.run(listener, shutdown.wait()).await?;
        }
    }

    shutdown.trigger();
    let _ = sweeper.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
