use std::collections::HashMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use shared::schemas::{
    EdgeDeviceInventory, EdgeDeviceMetrics, EdgeStorageInventory, MonitorEnvelope,
};
use shared::utilities::config::{EdgeStorageConfig, K8sApiConfig};
use shared::utilities::errors::AppError;

use crate::probes::kubernetes::{build_client, discover_worker_nodes};
use crate::prom_text;

#[derive(Clone, Debug)]
struct EdgeDevice {
    node: String,
    url: String,
}

/// Probe over the MinIO pods of one edge site. Devices are detected from
/// the configured namespace/app selector and re-detected on demand.
pub struct EdgeStorageProbe {
    client: Client,
    http: reqwest::Client,
    probe_uuid: String,
    cluster_uuid: String,
    config: EdgeStorageConfig,
    worker_nodes: HashMap<String, String>,
    devices: Mutex<HashMap<String, EdgeDevice>>,
}

impl EdgeStorageProbe {
    pub async fn new(
        probe_uuid: &str,
        cluster_uuid: &str,
        k8s_config: &K8sApiConfig,
        config: &EdgeStorageConfig,
        query_timeout: u64,
    ) -> Result<Self, AppError> {
        let client = build_client(k8s_config).await?;
        let worker_nodes = discover_worker_nodes(&client).await?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(query_timeout))
            .build()?;

        let probe = Self {
            client,
            http,
            probe_uuid: probe_uuid.to_owned(),
            cluster_uuid: cluster_uuid.to_owned(),
            config: config.clone(),
            worker_nodes,
            devices: Mutex::new(HashMap::new()),
        };
        probe.detect_devices().await?;

        info!(
            "Edge storage probe ready: {} devices detected",
            probe.devices.lock().await.len()
        );
        Ok(probe)
    }

    /// List the MinIO pods of the configured namespace/app selector.
    async fn detect_devices(&self) -> Result<(), AppError> {
        let pods = Api::<Pod>::namespaced(self.client.clone(), &self.config.namespace)
            .list(&ListParams::default().labels(&format!("app={}", self.config.app_selector)))
            .await?;

        let mut devices = HashMap::new();
        for pod in pods.items {
            let Some(name) = pod.metadata.name.clone() else {
                continue;
            };
            let node = pod
                .status
                .and_then(|status| status.host_ip)
                .and_then(|host_ip| self.worker_nodes.get(&host_ip).cloned())
                .unwrap_or_default();
            devices.insert(
                name.clone(),
                EdgeDevice {
                    node,
                    url: format!("{name}.edge-storage-devices"),
                },
            );
        }

        *self.devices.lock().await = devices;
        Ok(())
    }

    async fn scrape_device(&self, device: &EdgeDevice) -> Result<String, AppError> {
        let response = self
            .http
            .get(format!("http://{}:7000/minio/v2/metrics/cluster", device.url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::UpstreamStatus(response.status().as_u16()));
        }
        Ok(response.text().await?)
    }

    async fn device_inventory(&self, name: &str, device: &EdgeDevice) -> Option<EdgeDeviceInventory> {
        debug!("Query edge storage device '{name}'");
        match self.scrape_device(device).await {
            Ok(page) => Some(EdgeDeviceInventory {
                name: name.to_owned(),
                node: device.node.clone(),
                cluster_uuid: self.cluster_uuid.clone(),
                lat: self.config.location.lat,
                lng: self.config.location.lng,
                minio_node_disk_total_bytes: prom_text::family_total(
                    &page,
                    "minio_node_disk_total_bytes",
                ),
            }),
            Err(err) => {
                error!("Unable to retrieve inventory data for edge storage device '{name}': {err}");
                None
            }
        }
    }

    async fn device_monitoring(&self, name: &str, device: &EdgeDevice) -> Option<EdgeDeviceMetrics> {
        debug!("Query edge storage device '{name}'");
        match self.scrape_device(device).await {
            Ok(page) => {
                let mut metrics = prom_text::edge_metrics_from_text(&page);
                metrics.name = name.to_owned();
                metrics.node = device.node.clone();
                metrics.cluster_uuid = self.cluster_uuid.clone();
                Some(metrics)
            }
            Err(err) => {
                error!(
                    "Unable to retrieve monitoring data for edge storage device '{name}': {err}"
                );
                None
            }
        }
    }

    async fn selected_devices(
        &self,
        device_name: Option<&str>,
        detect: bool,
    ) -> Vec<(String, EdgeDevice)> {
        if detect {
            info!("Refresh the list of deployed edge storage devices");
            if let Err(err) = self.detect_devices().await {
                error!("Unable to detect edge storage devices: {err}");
            }
        }
        let devices = self.devices.lock().await;
        match device_name {
            Some(name) => devices
                .get(name)
                .map(|device| vec![(name.to_owned(), device.clone())])
                .unwrap_or_default(),
            None => devices
                .iter()
                .map(|(name, device)| (name.clone(), device.clone()))
                .collect(),
        }
    }

    pub async fn inventory(&self, device_name: Option<&str>, detect: bool) -> EdgeStorageInventory {
        let mut inventory = EdgeStorageInventory::default();
        for (name, device) in self.selected_devices(device_name, detect).await {
            if let Some(entry) = self.device_inventory(&name, &device).await {
                inventory.edge_storage_devices.push(entry);
            }
        }
        inventory
    }

    pub async fn monitoring(&self, device_name: Option<&str>, detect: bool) -> MonitorEnvelope {
        let mut devices = Vec::new();
        for (name, device) in self.selected_devices(device_name, detect).await {
            if let Some(metrics) = self.device_monitoring(&name, &device).await {
                devices.push(metrics);
            }
        }
        MonitorEnvelope::EdgeStorage {
            uuid: self.probe_uuid.clone(),
            edge_storage_devices: devices,
        }
    }
}
