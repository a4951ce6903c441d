pub mod app;
pub mod query_engine;

use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tracing::info;

use shared::services::influx::Influx;
use shared::utilities::config::{PMDS_CONF_FILE, PmdsConfig, load_config};
use shared::utilities::observability::init_observability;

use crate::app::AppState;
use crate::query_engine::QueryEngine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::var("SERRANO_PMDS_CONFIG").unwrap_or_else(|_| PMDS_CONF_FILE.to_owned());
    let config: PmdsConfig = match load_config(Path::new(&path)) {
        Ok(Some(config)) => config,
        Ok(None) => {
            eprintln!("No PMDS configuration found at {path}, exiting.");
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("Invalid PMDS configuration {path}: {err}");
            std::process::exit(0);
        }
    };

    init_observability(config.log_level);
    info!("Initialize services ...");

    let influx = Influx::new(&config.influx_db)?;
    let state = AppState {
        engine: Arc::new(QueryEngine::new(influx)),
        buckets: config.buckets.clone(),
    };
    let app = app::app(state);

    let listener = tokio::net::TcpListener::bind((
        config.rest_interface.address.as_str(),
        config.rest_interface.port,
    ))
    .await?;

    info!(
        "🚀 PMDS serving at {}:{}",
        config.rest_interface.address, config.rest_interface.port
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
