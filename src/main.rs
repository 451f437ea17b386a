//! maestro-offline - offline caching proxy for the Maestro music quiz

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use maestro_offline::{
    cache::{CacheStorage, DiskCacheStorage, MemoryCacheStorage},
    clock::SystemClock,
    config::{Args, ControllerConfig},
    network::HttpNetwork,
    server::{self, AppState, ProxyPage},
    CoordinatorConfig, UpdateCoordinator, WorkerHost,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("maestro_offline={},info", args.log_level).into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }
    let controller_config = match args.controller_config().await {
        Ok(config) => config,
        Err(e) => {
            error!("Controller configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!("======================================");
    info!("  maestro-offline");
    info!("  Offline caching proxy for Maestro");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Origin: {}", controller_config.origin);
    info!("Version: {}", controller_config.version);
    info!("Prefix: {}", controller_config.prefix);
    info!("Manifest: {} path(s)", controller_config.manifest.len());
    match &args.cache_dir {
        Some(dir) => info!("Cache storage: {}", dir.display()),
        None => info!("Cache storage: in-memory"),
    }
    match &args.config {
        Some(path) => info!("Controller config: {}", path.display()),
        None => info!("Controller config: built-in defaults"),
    }
    info!("======================================");

    let storage: Arc<dyn CacheStorage> = match &args.cache_dir {
        Some(dir) => Arc::new(DiskCacheStorage::new(dir.clone())),
        None => Arc::new(MemoryCacheStorage::new()),
    };
    let network = Arc::new(HttpNetwork::new(args.request_timeout())?);

    let host = WorkerHost::new(storage, network, Arc::new(SystemClock));
    host.deploy(controller_config.clone());

    let page = Arc::new(ProxyPage::default());
    let coordinator = Arc::new(UpdateCoordinator::new(
        Some(host.connect()),
        page,
        CoordinatorConfig {
            update_interval: args.update_interval(),
            install_timeout: args.install_timeout(),
            ..CoordinatorConfig::default()
        },
    ));
    if let Err(e) = coordinator.register().await {
        warn!("Continuing without offline caching: {}", e);
    }
    coordinator.on_update_available(|notice| {
        info!(
            current = ?notice.current_version,
            new = ?notice.new_version,
            "Update available, POST /__offline/update to apply"
        );
    });

    if let Some(path) = args.config.clone() {
        spawn_config_reload_task(
            path,
            args.clone(),
            host.clone(),
            Arc::clone(&coordinator),
            controller_config.clone(),
        );
    }

    let state = Arc::new(AppState {
        listen: args.listen,
        origin: controller_config.origin.clone(),
        host,
        coordinator,
        reply_timeout: CoordinatorConfig::default().reply_timeout,
    });

    server::run(state).await?;
    Ok(())
}

/// Re-read the controller config file and deploy it when it changed
fn spawn_config_reload_task(
    path: PathBuf,
    args: Args,
    host: WorkerHost,
    coordinator: Arc<UpdateCoordinator>,
    mut deployed: ControllerConfig,
) {
    let interval: Duration = args.update_interval();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let config = match args.controller_config().await {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to reload {}: {}", path.display(), e);
                    continue;
                }
            };
            if config == deployed {
                debug!("Controller config unchanged");
                continue;
            }

            info!(
                from = %deployed.version,
                to = %config.version,
                "Controller config changed, deploying"
            );
            host.deploy(config.clone());
            deployed = config;
            coordinator.check_for_update().await;
        }
    });
}
