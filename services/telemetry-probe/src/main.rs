pub mod app;
pub mod backend;
pub mod probes;
pub mod prom_text;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{error, info};

use shared::schemas::RegisterProbeRequest;
use shared::utilities::config::{
    PROBE_CONF_FILES, ProbeConfig, load_config, resolve_config_path,
};
use shared::utilities::observability::init_observability;

use crate::app::AppState;
use crate::backend::{Backend, ProbeQuery};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Some(path) = resolve_config_path("SERRANO_PROBE_CONFIG", &PROBE_CONF_FILES) else {
        eprintln!("No probe configuration found, exiting.");
        std::process::exit(0);
    };
    let config: ProbeConfig = match load_config(&path) {
        Ok(Some(config)) => config,
        Ok(None) => std::process::exit(0),
        Err(err) => {
            eprintln!("Invalid probe configuration {}: {err}", path.display());
            std::process::exit(0);
        }
    };

    init_observability(config.log_level);

    let backend = Arc::new(Backend::init(&config).await?);
    register_probe(&config, &backend).await;

    let state = AppState {
        backend,
        credentials: config
            .probe_interface
            .username
            .clone()
            .zip(config.probe_interface.password.clone()),
        collection_config: Arc::new(Mutex::new(Value::Null)),
    };
    let app = app::app(state);

    let listener = tokio::net::TcpListener::bind((
        config.probe_interface.address.as_str(),
        config.probe_interface.port,
    ))
    .await?;

    info!(
        "🚀 {} '{}' serving at {}:{}",
        config.kind, config.probe_uuid, config.probe_interface.address, config.probe_interface.port
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Announce this probe to its telemetry agent, carrying the full inventory.
/// Best effort: the agent may come up later and pick the probe up from the
/// operational store instead.
async fn register_probe(config: &ProbeConfig, backend: &Backend) {
    let inventory = backend.inventory(&ProbeQuery::default()).await;
    let request = RegisterProbeRequest {
        probe_uuid: config.probe_uuid.clone(),
        url: config.probe_interface.exposed_url(),
        cluster_uuid: config.cluster_uuid.clone(),
        kind: config.kind,
        inventory: Some(inventory),
    };

    let agent_url = config.telemetry_handler.url();
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .danger_accept_invalid_certs(true)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            error!("Unable to build registration client: {err}");
            return;
        }
    };

    match client
        .post(format!("{agent_url}/api/v1/telemetry/agent/register"))
        .basic_auth(
            &config.telemetry_handler.username,
            Some(&config.telemetry_handler.password),
        )
        .json(&request)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            info!("Probe registered to telemetry agent: {agent_url}");
        }
        Ok(response) => {
            error!(
                "Telemetry agent rejected the registration: {}",
                response.status()
            );
        }
        Err(err) => {
            error!("Unable to register probe to telemetry agent {agent_url}: {err}");
        }
    }
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
