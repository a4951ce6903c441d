use std::sync::{Arc, Mutex};
use std::time::Duration;

use mongodb::bson::Document;
use tracing::{error, info};

use shared::models::RuntimeOptions;

use crate::data_engine::CentralEngine;

/// Platform-level acquisition loop of the central handler: the mirrored
/// cloud storage locations are refreshed from the storage gateway at boot
/// and on every interval tick.
pub async fn run(
    engine: Arc<CentralEngine>,
    options: Arc<Mutex<RuntimeOptions>>,
    gateway_address: String,
) {
    let http = match reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            error!("Unable to build storage gateway client: {err}");
            return;
        }
    };

    loop {
        let timeout = {
            let options = options.lock().unwrap();
            Duration::from_secs(options.query_timeout.max(1))
        };
        refresh_cloud_storage_locations(&engine, &http, &gateway_address, timeout).await;

        let interval = options.lock().unwrap().query_interval.max(1);
        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
}

async fn refresh_cloud_storage_locations(
    engine: &CentralEngine,
    http: &reqwest::Client,
    gateway_address: &str,
    timeout: Duration,
) {
    let response = http
        .get(format!("https://{gateway_address}/cloud_locations"))
        .timeout(timeout)
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            match response.json::<Vec<Document>>().await {
                Ok(locations) => {
                    info!("Refreshed {} cloud storage locations", locations.len());
                    if let Err(err) = engine.handle_cloud_storage_locations(locations).await {
                        error!("Unable to store cloud storage locations: {err}");
                    }
                }
                Err(err) => error!("Unable to parse cloud storage locations: {err}"),
            }
        }
        Ok(_) => error!("Unable to query cloud storage locations"),
        Err(err) => {
            error!("Unable to query cloud storage locations");
            error!("{err}");
        }
    }
}
