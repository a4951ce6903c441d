pub mod app;
pub mod collector;
pub mod data_engine;

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::signal;
use tracing::info;

use shared::models::RuntimeOptions;
use shared::services::mongo::Mongo;
use shared::utilities::config::{CENTRAL_CONF_FILE, CentralConfig, load_config};
use shared::utilities::observability::init_observability;

use crate::app::AppState;
use crate::data_engine::CentralEngine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path =
        std::env::var("SERRANO_CENTRAL_CONFIG").unwrap_or_else(|_| CENTRAL_CONF_FILE.to_owned());
    let config: CentralConfig = match load_config(Path::new(&path)) {
        Ok(Some(config)) => config,
        Ok(None) => {
            eprintln!("No central handler configuration found at {path}, exiting.");
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("Invalid central handler configuration {path}: {err}");
            std::process::exit(0);
        }
    };

    init_observability(config.log_level);
    info!("Initialize services ...");

    let mongo = Mongo::new(&config.operational_db).await?;
    let engine = Arc::new(CentralEngine::new(&mongo, &config.uuid));

    let options = Arc::new(Mutex::new(RuntimeOptions {
        query_interval: config.query_interval,
        query_timeout: config.query_timeout,
        active_monitoring: config.active_monitoring,
    }));

    tokio::spawn(collector::run(
        engine.clone(),
        options.clone(),
        config.cloud_storage_locations.address.clone(),
    ));

    let state = AppState {
        handler_uuid: config.uuid.clone(),
        engine,
        options,
        rest_interface: config.rest_interface.clone(),
        gateway_address: config.cloud_storage_locations.address.clone(),
        http: reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?,
    };
    let app = app::app(state);

    let listener = tokio::net::TcpListener::bind((
        config.rest_interface.address.as_str(),
        config.rest_interface.port,
    ))
    .await?;

    info!(
        "🚀 Central telemetry handler '{}' serving at {}:{}",
        config.uuid, config.rest_interface.address, config.rest_interface.port
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
