use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info};

use shared::schemas::{HpcInventory, HpcMonitoringData, MonitorEnvelope};
use shared::utilities::config::HpcGatewayConfig;
use shared::utilities::errors::AppError;

#[derive(Debug, Default, Deserialize)]
struct GatewayTelemetry {
    name: Option<String>,
    scheduler: Option<String>,
    #[serde(default)]
    partitions: Vec<Value>,
}

/// Probe against one HPC site, forwarding its gateway's telemetry.
pub struct HpcProbe {
    http: reqwest::Client,
    probe_uuid: String,
    address: String,
    infrastructure: String,
}

impl HpcProbe {
    pub fn new(
        probe_uuid: &str,
        config: &HpcGatewayConfig,
        query_timeout: u64,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(query_timeout))
            .build()?;
        Ok(Self {
            http,
            probe_uuid: probe_uuid.to_owned(),
            address: config.address.clone(),
            infrastructure: config.infrastructure.clone(),
        })
    }

    async fn gateway_telemetry(&self) -> Result<GatewayTelemetry, AppError> {
        let response = self
            .http
            .get(format!(
                "{}/infrastructure/{}/telemetry",
                self.address, self.infrastructure
            ))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::UpstreamStatus(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    pub async fn inventory(&self) -> HpcInventory {
        info!("Query HPC gateway for inventory information");

        let mut inventory = HpcInventory::default();

        match self.http.get(format!("{}/services", self.address)).send().await {
            Ok(response) if response.status().is_success() => {
                inventory.services = response.json().await.unwrap_or(Value::Null);
            }
            Ok(response) => {
                error!("HPC gateway services query returned {}", response.status())
            }
            Err(err) => error!("Unable to query HPC gateway: {err}"),
        }

        match self.gateway_telemetry().await {
            Ok(telemetry) => {
                inventory.name = telemetry.name;
                inventory.scheduler = telemetry.scheduler;
                inventory.partitions = telemetry
                    .partitions
                    .iter()
                    .map(|partition| {
                        json!({
                            "name": partition.get("name").cloned().unwrap_or(Value::Null),
                            "total_nodes": partition.get("total_nodes").cloned().unwrap_or(Value::Null),
                            "total_cpus": partition.get("total_cpus").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect();
            }
            Err(err) => error!("Unable to query HPC gateway: {err}"),
        }

        inventory
    }

    pub async fn monitoring(&self) -> MonitorEnvelope {
        info!("Query HPC gateway for monitoring information");

        let data = match self.gateway_telemetry().await {
            Ok(telemetry) => HpcMonitoringData {
                name: telemetry.name,
                scheduler: telemetry.scheduler,
                partitions: telemetry
                    .partitions
                    .into_iter()
                    .filter_map(|partition| serde_json::from_value(partition).ok())
                    .collect(),
            },
            Err(err) => {
                error!("Unable to query HPC gateway: {err}");
                HpcMonitoringData::default()
            }
        };

        MonitorEnvelope::Hpc {
            uuid: self.probe_uuid.clone(),
            hpc_monitoring_data: data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn forwards_gateway_partitions() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/infrastructure/hpc-site/telemetry");
                then.status(200).json_body(serde_json::json!({
                    "name": "hpc-site",
                    "scheduler": "slurm",
                    "partitions": [{
                        "name": "batch",
                        "avail_cpus": 128,
                        "avail_nodes": 4,
                        "queued_jobs": 7,
                        "running_jobs": 3,
                        "total_nodes": 6,
                        "total_cpus": 192
                    }]
                }));
            })
            .await;

        let probe = HpcProbe::new(
            "d2b1b7a3-5cc4-4f4f-9b55-7f4f9b8a2a51",
            &HpcGatewayConfig {
                address: server.base_url(),
                infrastructure: "hpc-site".to_owned(),
            },
            5,
        )
        .unwrap();

        match probe.monitoring().await {
            MonitorEnvelope::Hpc {
                hpc_monitoring_data,
                ..
            } => {
                assert_eq!(hpc_monitoring_data.name.as_deref(), Some("hpc-site"));
                assert_eq!(hpc_monitoring_data.partitions.len(), 1);
                let partition = &hpc_monitoring_data.partitions[0];
                assert_eq!(partition.name, "batch");
                assert_eq!(partition.avail_cpus, 128);
                assert_eq!(partition.queued_jobs, 7);
            }
            _ => panic!("wrong envelope"),
        }
    }

    #[tokio::test]
    async fn gateway_failure_yields_empty_monitoring_data() {
        let probe = HpcProbe::new(
            "d2b1b7a3-5cc4-4f4f-9b55-7f4f9b8a2a51",
            &HpcGatewayConfig {
                address: "http://127.0.0.1:1".to_owned(),
                infrastructure: "hpc-site".to_owned(),
            },
            1,
        )
        .unwrap();

        match probe.monitoring().await {
            MonitorEnvelope::Hpc {
                hpc_monitoring_data,
                ..
            } => assert!(hpc_monitoring_data.partitions.is_empty()),
            _ => panic!("wrong envelope"),
        }
    }
}
