use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ddf_serve::api::admission::AdmissionControl;
use ddf_serve::api::routes::{create_router, AppState};
use ddf_serve::config::Config;
use ddf_serve::services::assets::create_store;
use ddf_serve::services::catalog::Catalog;
use ddf_serve::storage::MySqlStorage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    init_tracing(&config)?;

    let storage = MySqlStorage::new(&config.database);
    if let Err(e) = storage.migrate().await {
        error!("catalog migration failed: {}", e);
        return Err(e.into());
    }

    let catalog = Catalog::new(storage.clone());
    let assets = create_store(&config.assets)?;
    let admission = AdmissionControl::start(
        config.server.cpu_throttle_ms,
        config.server.db_throttle,
    );

    let state = AppState {
        storage,
        catalog,
        assets,
        admission,
        config: config.clone(),
    };
    let app = create_router(state);

    let address = config.server_address();
    info!("Server listening on {}", address);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Console logging filtered by `LOG_LEVEL` (or `RUST_LOG`), with an
/// optional duplicate stream into the external log file.
fn init_tracing(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    if config.logging.external != "none" {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.external)?;
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
            .init();
    } else {
        registry.init();
    }
    Ok(())
}
