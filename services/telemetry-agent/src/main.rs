pub mod app;
pub mod collector;
pub mod controller;
pub mod data_engine;
pub mod pmds_writer;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;

use shared::models::RuntimeOptions;
use shared::services::{influx::Influx, kafka::Notifier, mongo::Mongo};
use shared::utilities::config::{AGENT_CONF_FILE, AgentConfig, load_config};
use shared::utilities::observability::init_observability;

use crate::app::AppState;
use crate::collector::Collector;
use crate::data_engine::DataEngine;
use crate::pmds_writer::PmdsWriter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::var("SERRANO_AGENT_CONFIG").unwrap_or_else(|_| AGENT_CONF_FILE.to_owned());
    let config: AgentConfig = match load_config(Path::new(&path)) {
        Ok(Some(config)) => config,
        Ok(None) => {
            eprintln!("No agent configuration found at {path}, exiting.");
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("Invalid agent configuration {path}: {err}");
            std::process::exit(0);
        }
    };

    init_observability(config.log_level);
    info!("Initialize services ...");

    let mongo = Mongo::new(&config.operational_db).await?;
    let influx = Influx::new(&config.influx_db)?;
    let notifier = Arc::new(Notifier::new(&config.notification_engine.bootstrap_servers)?);

    let (events_tx, events_rx) = mpsc::channel(256);
    let (pmds_tx, pmds_rx) = mpsc::channel(256);

    let engine = Arc::new(
        DataEngine::new(
            &mongo,
            &config.agent_uuid,
            &config.rest_interface.exposed_service(),
            config.retain_data_period,
            pmds_tx,
        )
        .await?,
    );

    let registry = Arc::new(Mutex::new(HashMap::new()));
    let options = Arc::new(Mutex::new(RuntimeOptions {
        query_interval: config.query_interval,
        query_timeout: config.query_timeout,
        active_monitoring: config.active_monitoring,
    }));

    let collector = Arc::new(Collector::new(
        &config.agent_uuid,
        registry.clone(),
        options.clone(),
        engine.clone(),
        notifier.clone(),
    )?);
    collector.boot_load_probes().await;

    tokio::spawn(pmds_writer::run(pmds_rx, PmdsWriter::new(influx)));
    tokio::spawn(controller::run(
        events_rx,
        collector.clone(),
        engine.clone(),
        notifier.clone(),
    ));
    tokio::spawn(collector.clone().run());

    let state = AppState {
        agent_uuid: config.agent_uuid.clone(),
        events: events_tx,
        registry,
        options,
        rest_interface: config.rest_interface.clone(),
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
        "🚀 Enhanced telemetry agent '{}' serving at {}:{}",
        config.agent_uuid, config.rest_interface.address, config.rest_interface.port
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
