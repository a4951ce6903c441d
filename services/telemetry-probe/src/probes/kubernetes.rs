use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Endpoints, Node, PersistentVolume, Pod, Service};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::config::{
    AuthInfo, Cluster, Context, KubeConfigOptions, Kubeconfig, NamedAuthInfo, NamedCluster,
    NamedContext,
};
use kube::{Client, Config as KubeConfig};
use serde_json::{Value, json};
use tracing::{error, info};

use shared::schemas::{
    DeploymentSample, K8sInventory, K8sMonitoringData, K8sNodeInventory, MonitorEnvelope,
    PodSample, PvSample, ResourceUsage, ServiceSample,
};
use shared::utilities::config::K8sApiConfig;
use shared::utilities::errors::AppError;

use crate::prom_text;

const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MonitorTarget {
    All,
    Resources,
    Applications,
}

impl MonitorTarget {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("resources") => MonitorTarget::Resources,
            Some("applications") => MonitorTarget::Applications,
            _ => MonitorTarget::All,
        }
    }
}

/// Probe against one Kubernetes cluster: inventory from the API server,
/// node metrics from per-node node-exporter endpoints, pod usage joined
/// from the metrics API.
pub struct K8sProbe {
    client: Client,
    http: reqwest::Client,
    probe_uuid: String,
    /// internal IP -> node name, workers only
    worker_nodes: HashMap<String, String>,
    /// node name -> node-exporter endpoint IP
    node_exporter_endpoints: HashMap<String, String>,
}

fn is_control_plane(labels: &BTreeMap<String, String>) -> bool {
    CONTROL_PLANE_LABELS
        .iter()
        .any(|label| labels.contains_key(*label))
}

pub async fn build_client(config: &K8sApiConfig) -> Result<Client, AppError> {
    let kubeconfig = Kubeconfig {
        clusters: vec![NamedCluster {
            name: "serrano".to_owned(),
            cluster: Some(Cluster {
                server: Some(format!("https://{}:{}", config.address, config.port)),
                insecure_skip_tls_verify: Some(true),
                ..Default::default()
            }),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: "serrano".to_owned(),
            auth_info: Some(AuthInfo {
                token: Some(config.token.clone().into()),
                ..Default::default()
            }),
        }],
        contexts: vec![NamedContext {
            name: "serrano".to_owned(),
            context: Some(Context {
                cluster: "serrano".to_owned(),
                user: Some("serrano".to_owned()),
                ..Default::default()
            }),
        }],
        current_context: Some("serrano".to_owned()),
        ..Default::default()
    };

    let kube_config =
        KubeConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(kube_config)?)
}

/// internal IP -> node name for every non-control-plane node.
pub async fn discover_worker_nodes(client: &Client) -> Result<HashMap<String, String>, AppError> {
    let mut workers = HashMap::new();
    let nodes = Api::<Node>::all(client.clone())
        .list(&ListParams::default())
        .await?;
    for node in nodes.items {
        let labels = node.metadata.labels.clone().unwrap_or_default();
        if is_control_plane(&labels) {
            continue;
        }
        let Some(name) = node.metadata.name.clone() else {
            continue;
        };
        for address in node
            .status
            .and_then(|status| status.addresses)
            .unwrap_or_default()
        {
            if address.type_ == "InternalIP" {
                workers.insert(address.address, name.clone());
            }
        }
    }
    Ok(workers)
}

impl K8sProbe {
    pub async fn new(
        probe_uuid: &str,
        config: &K8sApiConfig,
        query_timeout: u64,
    ) -> Result<Self, AppError> {
        let client = build_client(config).await?;
        let worker_nodes = discover_worker_nodes(&client).await?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(query_timeout))
            .danger_accept_invalid_certs(true)
            .build()?;

        let mut probe = Self {
            client,
            http,
            probe_uuid: probe_uuid.to_owned(),
            worker_nodes,
            node_exporter_endpoints: HashMap::new(),
        };
        probe
            .discover_node_exporter_endpoints(
                &config.node_exporter.service,
                &config.node_exporter.namespace,
            )
            .await?;

        info!(
            "K8s probe ready: {} worker nodes, {} node-exporter endpoints",
            probe.worker_nodes.len(),
            probe.node_exporter_endpoints.len()
        );
        Ok(probe)
    }

    /// Read the node-exporter service's endpoint list and keep the addresses
    /// that sit on worker nodes.
    async fn discover_node_exporter_endpoints(
        &mut self,
        service: &str,
        namespace: &str,
    ) -> Result<(), AppError> {
        let endpoints = Api::<Endpoints>::namespaced(self.client.clone(), namespace)
            .get(service)
            .await?;
        if let Some(subset) = endpoints.subsets.unwrap_or_default().into_iter().next() {
            for address in subset.addresses.unwrap_or_default() {
                let Some(node_name) = address.node_name else {
                    continue;
                };
                if self.worker_nodes.values().any(|name| *name == node_name) {
                    self.node_exporter_endpoints.insert(node_name, address.ip);
                }
            }
        }
        Ok(())
    }

    pub async fn inventory(&self) -> K8sInventory {
        match self.try_inventory().await {
            Ok(inventory) => inventory,
            Err(err) => {
                error!("Unable to retrieve cluster inventory: {err}");
                K8sInventory::default()
            }
        }
    }

    async fn try_inventory(&self) -> Result<K8sInventory, AppError> {
        let mut inventory = K8sInventory::default();
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;

        for node in nodes.items {
            let labels = node.metadata.labels.clone().unwrap_or_default();
            if is_control_plane(&labels) {
                continue;
            }

            let mut node_labels = BTreeMap::new();
            node_labels.insert(
                "vaccel".to_owned(),
                labels
                    .get("vaccel")
                    .map(|v| Value::String(v.clone()))
                    .unwrap_or_else(|| json!("false")),
            );
            node_labels.insert(
                "security-tier".to_owned(),
                labels
                    .get("security-tier")
                    .map(|v| Value::String(v.clone()))
                    .unwrap_or_else(|| json!(0)),
            );

            let status = node.status.unwrap_or_default();
            let mut capacity: BTreeMap<String, String> = status
                .capacity
                .unwrap_or_default()
                .into_iter()
                .map(|(key, quantity)| (key, quantity.0))
                .collect();

            let mut total_gpu: i64 = 0;
            let mut total_fpga: i64 = 0;
            for (key, value) in &capacity {
                let amount = value.parse::<i64>().unwrap_or(0);
                if key.contains("nvidia.com/gpu") {
                    total_gpu += amount;
                }
                if key.contains("xilinx.com/fpga-xilinx") {
                    total_fpga += amount;
                }
            }
            capacity.insert("total_gpu".to_owned(), total_gpu.to_string());
            capacity.insert("total_fpga".to_owned(), total_fpga.to_string());
            capacity.insert("node_storage".to_owned(), "0".to_owned());

            inventory.kubernetes_inventory_data.push(K8sNodeInventory {
                node_role: "worker".to_owned(),
                node_name: node.metadata.name.unwrap_or_default(),
                node_annotations: Vec::new(),
                node_labels,
                node_capacity: capacity,
                node_info: status
                    .node_info
                    .map(|info| serde_json::to_value(info).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null),
            });
        }

        Ok(inventory)
    }

    pub async fn monitoring(&self, target: Option<&str>) -> MonitorEnvelope {
        let target = MonitorTarget::parse(target);
        let mut data = K8sMonitoringData::default();

        if matches!(target, MonitorTarget::All | MonitorTarget::Resources) {
            self.cluster_monitoring(&mut data).await;
        }
        if matches!(target, MonitorTarget::All | MonitorTarget::Applications) {
            self.applications_monitoring(&mut data).await;
        }

        MonitorEnvelope::K8s {
            uuid: self.probe_uuid.clone(),
            kubernetes_monitoring_data: data,
        }
    }

    async fn cluster_monitoring(&self, data: &mut K8sMonitoringData) {
        let running_pods = match self.count_running_pods().await {
            Ok(counts) => counts,
            Err(err) => {
                error!("Unable to count running pods: {err}");
                HashMap::new()
            }
        };

        match self.persistent_volumes().await {
            Ok(volumes) => data.persistent_volumes = Some(volumes),
            Err(err) => error!("Unable to list persistent volumes: {err}"),
        }

        let mut nodes = Vec::new();
        for (node_name, endpoint_ip) in &self.node_exporter_endpoints {
            match self
                .http
                .get(format!("http://{endpoint_ip}:9100/metrics"))
                .send()
                .await
                .and_then(|response| response.error_for_status())
            {
                Ok(response) => match response.text().await {
                    Ok(page) => {
                        let mut node = prom_text::node_sample_from_exporter(&page);
                        node.node_name = node_name.clone();
                        node.node_total_running_pods =
                            running_pods.get(node_name).copied().unwrap_or(0);
                        nodes.push(node);
                    }
                    Err(err) => error!("Unable to read node-exporter page of '{node_name}': {err}"),
                },
                Err(err) => error!("Unable to scrape node-exporter of '{node_name}': {err}"),
            }
        }
        data.nodes = Some(nodes);
    }

    async fn applications_monitoring(&self, data: &mut K8sMonitoringData) {
        match self.deployments().await {
            Ok(deployments) => data.deployments = Some(deployments),
            Err(err) => error!("Unable to list deployments: {err}"),
        }
        match self.pods().await {
            Ok(pods) => data.pods = Some(pods),
            Err(err) => error!("Unable to list pods: {err}"),
        }
        match self.services().await {
            Ok(services) => data.services = Some(services),
            Err(err) => error!("Unable to list services: {err}"),
        }
    }

    async fn count_running_pods(&self) -> Result<HashMap<String, i64>, AppError> {
        let mut counts: HashMap<String, i64> = self
            .worker_nodes
            .values()
            .map(|name| (name.clone(), 0))
            .collect();
        let pods = Api::<Pod>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        for pod in pods.items {
            let Some(status) = pod.status else { continue };
            let Some(host_ip) = status.host_ip else { continue };
            let Some(node_name) = self.worker_nodes.get(&host_ip) else {
                continue;
            };
            if status.phase.as_deref() == Some("Running") {
                *counts.entry(node_name.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn persistent_volumes(&self) -> Result<Vec<PvSample>, AppError> {
        let volumes = Api::<PersistentVolume>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(volumes
            .items
            .into_iter()
            .map(|pv| PvSample {
                name: pv.metadata.name.clone().unwrap_or_default(),
                creation_timestamp: pv
                    .metadata
                    .creation_timestamp
                    .map(|time| time.0.timestamp() as f64)
                    .unwrap_or(0.0),
                capacity: pv
                    .spec
                    .and_then(|spec| spec.capacity)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(key, quantity)| (key, quantity.0))
                    .collect(),
            })
            .collect())
    }

    async fn deployments(&self) -> Result<Vec<DeploymentSample>, AppError> {
        let deployments = Api::<Deployment>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(deployments
            .items
            .into_iter()
            .map(|deployment| {
                let status = deployment.status.unwrap_or_default();
                DeploymentSample {
                    name: deployment.metadata.name.clone().unwrap_or_default(),
                    namespace: deployment.metadata.namespace.clone().unwrap_or_default(),
                    creation_timestamp: deployment
                        .metadata
                        .creation_timestamp
                        .map(|time| time.0.timestamp() as f64)
                        .unwrap_or(0.0),
                    replicas: status.replicas.unwrap_or(0) as i64,
                    available_replicas: status.available_replicas.unwrap_or(0) as i64,
                    ready_replicas: status.ready_replicas.unwrap_or(0) as i64,
                }
            })
            .collect())
    }

    async fn services(&self) -> Result<Vec<ServiceSample>, AppError> {
        let services = Api::<Service>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(services
            .items
            .into_iter()
            .map(|service| ServiceSample {
                name: service.metadata.name.clone().unwrap_or_default(),
                namespace: service.metadata.namespace.clone().unwrap_or_default(),
                creation_timestamp: service
                    .metadata
                    .creation_timestamp
                    .map(|time| time.0.timestamp() as f64)
                    .unwrap_or(0.0),
                labels: service.metadata.labels.clone(),
                spec_type: service.spec.and_then(|spec| spec.type_),
            })
            .collect())
    }

    /// Pods on worker nodes, each joined with its usage from the metrics
    /// API; pods the metrics API does not know yet are skipped.
    async fn pods(&self) -> Result<Vec<PodSample>, AppError> {
        let pods = Api::<Pod>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;

        let mut samples = Vec::new();
        for pod in pods.items {
            let Some(status) = pod.status else { continue };
            let Some(host_ip) = status.host_ip.clone() else {
                continue;
            };
            let Some(node_name) = self.worker_nodes.get(&host_ip) else {
                continue;
            };
            let name = pod.metadata.name.clone().unwrap_or_default();
            let labels = pod.metadata.labels.clone().unwrap_or_default();

            let Some(usage) = self.pod_usage(&name).await else {
                continue;
            };

            samples.push(PodSample {
                name,
                namespace: pod.metadata.namespace.clone().unwrap_or_default(),
                creation_timestamp: pod
                    .metadata
                    .creation_timestamp
                    .map(|time| time.0.timestamp() as f64)
                    .unwrap_or(0.0),
                phase: status.phase.clone().unwrap_or_default(),
                node: node_name.clone(),
                serrano_deployment_uuid: labels
                    .get("serrano_deployment_uuid")
                    .cloned()
                    .unwrap_or_default(),
                group_id: labels.get("group_id").cloned().unwrap_or_default(),
                start_time: status
                    .start_time
                    .map(|time| time.0.timestamp() as f64)
                    .unwrap_or(0.0),
                pod_ip: status.pod_ip.clone(),
                host_ip: Some(host_ip),
                restarts: status
                    .container_statuses
                    .as_ref()
                    .and_then(|statuses| statuses.first())
                    .map(|first| first.restart_count as i64)
                    .unwrap_or(0),
                usage,
            });
        }
        Ok(samples)
    }

    async fn pod_usage(&self, pod_name: &str) -> Option<ResourceUsage> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);

        let list = api
            .list(&ListParams::default().fields(&format!("metadata.name={pod_name}")))
            .await
            .ok()?;
        let item = list.items.into_iter().next()?;
        let usage = item.data.get("containers")?.get(0)?.get("usage")?;
        serde_json::from_value(usage.clone()).ok()
    }
}
