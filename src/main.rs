use std::sync::Arc;

use ride_dispatch::api::rest::router;
use ride_dispatch::config::{Config, LogFormat};
use ride_dispatch::engine::dispatch::run_sweeper;
use ride_dispatch::error::AppError;
use ride_dispatch::state::AppState;
use ride_dispatch::store::{MemoryStore, PgStore, Store};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false);
    match config.log_format {
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Json => subscriber.json().init(),
    }

    if config.uses_dev_secret() {
        tracing::warn!("JWT_SECRET not set, using the development secret");
    }

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, config.database_max_connections).await?;
            store.migrate().await?;
            tracing::info!("postgres store ready");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, rides are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let http_port = config.http_port;
    let (app_state, hub) = AppState::new(config, store);
    let shared_state = Arc::new(app_state);

    tokio::spawn(hub.run());
    tokio::spawn(run_sweeper(shared_state.clone()));

    let app = router(shared_state);

    let bind_addr = format!("0.0.0.0:{http_port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    tracing::info!("http server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
