use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ProbeKind, RuntimeOptions};

// ============================================
// PROBE REGISTRATION
// ============================================

/// Body of `POST /api/v1/telemetry/agent/register`. Probes send their full
/// inventory along with the registration so the cluster mirror is populated
/// before the first monitoring tick.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegisterProbeRequest {
    pub probe_uuid: String,
    pub url: String,
    pub cluster_uuid: String,
    #[serde(rename = "type")]
    pub kind: ProbeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Value>,
}

/// Identity of a registered probe attached to inventory/monitor events.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProbeDescriptor {
    pub probe_uuid: String,
    #[serde(rename = "type")]
    pub kind: ProbeKind,
    pub cluster_uuid: String,
}

// ============================================
// MONITORING ENVELOPES
// ============================================

/// Typed envelope returned by `GET /api/v1/telemetry/probe/monitor`. The
/// `type` tag selects the payload field, which keeps the historical names.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum MonitorEnvelope {
    #[serde(rename = "Probe.k8s", alias = "Probe.K8s")]
    K8s {
        uuid: String,
        kubernetes_monitoring_data: K8sMonitoringData,
    },
    #[serde(rename = "Probe.HPC")]
    Hpc {
        uuid: String,
        hpc_monitoring_data: HpcMonitoringData,
    },
    #[serde(rename = "Probe.EdgeStorage")]
    EdgeStorage {
        uuid: String,
        edge_storage_devices: Vec<EdgeDeviceMetrics>,
    },
}

impl MonitorEnvelope {
    pub fn probe_uuid(&self) -> &str {
        match self {
            MonitorEnvelope::K8s { uuid, .. }
            | MonitorEnvelope::Hpc { uuid, .. }
            | MonitorEnvelope::EdgeStorage { uuid, .. } => uuid,
        }
    }

    pub fn kind(&self) -> ProbeKind {
        match self {
            MonitorEnvelope::K8s { .. } => ProbeKind::K8s,
            MonitorEnvelope::Hpc { .. } => ProbeKind::Hpc,
            MonitorEnvelope::EdgeStorage { .. } => ProbeKind::EdgeStorage,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct K8sMonitoringData {
    #[serde(rename = "Nodes", default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeSample>>,
    #[serde(
        rename = "PersistentVolumes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub persistent_volumes: Option<Vec<PvSample>>,
    #[serde(rename = "Pods", default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<Vec<PodSample>>,
    #[serde(
        rename = "Deployments",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deployments: Option<Vec<DeploymentSample>>,
    #[serde(rename = "Services", default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ServiceSample>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CpuSample {
    pub label: String,
    pub idle: f64,
    pub used: f64,
}

/// One worker node sample, aggregated from its node-exporter scrape.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NodeSample {
    pub node_name: String,
    #[serde(default)]
    pub node_boot_time_seconds: f64,
    #[serde(default)]
    pub node_total_running_pods: i64,
    #[serde(default)]
    pub node_cpus: Vec<CpuSample>,

    // memory group
    #[serde(rename = "node_memory_Buffers_bytes", default)]
    pub node_memory_buffers_bytes: f64,
    #[serde(rename = "node_memory_Cached_bytes", default)]
    pub node_memory_cached_bytes: f64,
    #[serde(rename = "node_memory_MemAvailable_bytes", default)]
    pub node_memory_mem_available_bytes: f64,
    #[serde(rename = "node_memory_MemFree_bytes", default)]
    pub node_memory_mem_free_bytes: f64,
    #[serde(rename = "node_memory_MemTotal_bytes", default)]
    pub node_memory_mem_total_bytes: f64,
    #[serde(rename = "node_memory_MemUsed_bytes", default)]
    pub node_memory_mem_used_bytes: f64,
    #[serde(default)]
    pub node_memory_usage_percentage: f64,

    // storage group (root mountpoint)
    #[serde(default)]
    pub node_filesystem_avail_bytes: f64,
    #[serde(default)]
    pub node_filesystem_free_bytes: f64,
    #[serde(default)]
    pub node_filesystem_size_bytes: f64,
    #[serde(default)]
    pub node_filesystem_usage_percentage: f64,
    #[serde(default)]
    pub node_filesystem_used_bytes: f64,

    // network group, summed over interfaces
    #[serde(default)]
    pub node_network_receive_bytes_total: f64,
    #[serde(default)]
    pub node_network_receive_drop_total: f64,
    #[serde(default)]
    pub node_network_receive_errs_total: f64,
    #[serde(default)]
    pub node_network_receive_packets_total: f64,
    #[serde(default)]
    pub node_network_transmit_bytes_total: f64,
    #[serde(default)]
    pub node_network_transmit_drop_total: f64,
    #[serde(default)]
    pub node_network_transmit_errs_total: f64,
    #[serde(default)]
    pub node_network_transmit_packets_total: f64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PvSample {
    pub name: String,
    #[serde(default)]
    pub creation_timestamp: f64,
    #[serde(default)]
    pub capacity: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ResourceUsage {
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub memory: String,
}

/// Pod sample with the two downstream join keys (`serrano_deployment_uuid`,
/// `group_id`) carried as plain strings, empty when the labels are absent.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PodSample {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub creation_timestamp: f64,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub serrano_deployment_uuid: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub restarts: i64,
    #[serde(default)]
    pub usage: ResourceUsage,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeploymentSample {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub creation_timestamp: f64,
    #[serde(default)]
    pub replicas: i64,
    #[serde(default)]
    pub available_replicas: i64,
    #[serde(default)]
    pub ready_replicas: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ServiceSample {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub creation_timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_type: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct HpcMonitoringData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(default)]
    pub partitions: Vec<HpcPartition>,
}

/// Partition record forwarded from the HPC gateway. Fields beyond the four
/// scheduler counters are carried opaquely.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct HpcPartition {
    pub name: String,
    #[serde(default)]
    pub avail_cpus: i64,
    #[serde(default)]
    pub avail_nodes: i64,
    #[serde(default)]
    pub queued_jobs: i64,
    #[serde(default)]
    pub running_jobs: i64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

// ============================================
// EDGE STORAGE
// ============================================

/// Per-device MinIO counters, each the sum of the samples of one family.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EdgeDeviceMetrics {
    pub name: String,
    pub node: String,
    pub cluster_uuid: String,
    #[serde(default)]
    pub minio_node_process_uptime_seconds: f64,
    #[serde(default)]
    pub minio_bucket_usage_object_total: f64,
    #[serde(default)]
    pub minio_bucket_usage_total_bytes: f64,
    #[serde(default)]
    pub minio_node_disk_total_bytes: f64,
    #[serde(default)]
    pub minio_node_disk_free_bytes: f64,
    #[serde(default)]
    pub minio_node_disk_used_bytes: f64,
    #[serde(default)]
    pub minio_node_process_cpu_total_seconds: f64,
    #[serde(default)]
    pub minio_node_process_resident_memory_bytes: f64,
    #[serde(default)]
    pub minio_s3_requests_total: f64,
    #[serde(default)]
    pub minio_s3_requests_errors_total: f64,
    #[serde(default)]
    pub minio_s3_requests_waiting_total: f64,
    #[serde(default)]
    pub minio_s3_requests_rejected_invalid_total: f64,
    #[serde(default)]
    pub minio_s3_traffic_received_bytes: f64,
    #[serde(default)]
    pub minio_s3_traffic_sent_bytes: f64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EdgeDeviceInventory {
    pub name: String,
    pub node: String,
    pub cluster_uuid: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lng: f64,
    #[serde(default)]
    pub minio_node_disk_total_bytes: f64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EdgeStorageInventory {
    pub edge_storage_devices: Vec<EdgeDeviceInventory>,
}

// ============================================
// KUBERNETES / HPC INVENTORY
// ============================================

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct K8sNodeInventory {
    pub node_role: String,
    pub node_name: String,
    #[serde(default)]
    pub node_annotations: Vec<String>,
    #[serde(default)]
    pub node_labels: BTreeMap<String, Value>,
    #[serde(default)]
    pub node_capacity: BTreeMap<String, String>,
    #[serde(default)]
    pub node_info: Value,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct K8sInventory {
    pub kubernetes_inventory_data: Vec<K8sNodeInventory>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct HpcInventory {
    #[serde(default)]
    pub services: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(default)]
    pub partitions: Vec<Value>,
}

// ============================================
// DEPLOYMENT OVERLAY
// ============================================

/// A tracked user deployment as stored by the central handler. Per-cluster
/// pod-label selectors live under `per_cluster`, keyed by cluster UUID.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeploymentDoc {
    pub deployment_uuid: String,
    pub clusters: Vec<String>,
    #[serde(default)]
    pub per_cluster: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Body of `POST /api/v1/telemetry/agent/deployments`: the selector subset
/// for the one cluster owned by the receiving agent.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AgentDeploymentsRequest {
    pub deployment_uuid: String,
    pub k8s_deployments: Vec<Value>,
}

/// Deployment-specific metrics pushed by the user-side sidecar.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeploymentSpecificMetrics {
    pub deployment_uuid: String,
    pub cluster_uuid: String,
    pub service_id: String,
    pub metrics: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// A pod sample that matched the deployment overlay, re-keyed for the
/// `cluster_deployment_metrics` collection and the time-series store.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeploymentPodMetric {
    pub deployment_uuid: String,
    pub cluster_uuid: String,
    pub timestamp: i64,
    pub name: String,
    pub namespace: String,
    pub node: String,
    pub phase: String,
    pub group_id: String,
    pub creation_timestamp: f64,
    pub start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    pub restarts: i64,
    pub usage: ResourceUsage,
}

impl DeploymentPodMetric {
    pub fn from_pod(pod: &PodSample, cluster_uuid: &str, timestamp: i64) -> Self {
        Self {
            deployment_uuid: pod.serrano_deployment_uuid.clone(),
            cluster_uuid: cluster_uuid.to_owned(),
            timestamp,
            name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            node: pod.node.clone(),
            phase: pod.phase.clone(),
            group_id: pod.group_id.clone(),
            creation_timestamp: pod.creation_timestamp,
            start_time: pod.start_time,
            pod_ip: pod.pod_ip.clone(),
            host_ip: pod.host_ip.clone(),
            restarts: pod.restarts,
            usage: pod.usage.clone(),
        }
    }
}

// ============================================
// CENTRAL HANDLER SCHEMAS
// ============================================

/// Body of `PUT /api/v1/telemetry/central/serrano_kernel_deployments`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KernelDeploymentUpdate {
    pub counter_diff: i64,
    pub cluster_uuid: String,
    pub deployment_mode: String,
    pub kernel_mode: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KernelMetricsPost {
    pub logs: Vec<Value>,
}

// ============================================
// CONFIGURATION VIEWS
// ============================================

/// Partial runtime-option mutation accepted over PUT.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RuntimeOptionsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_monitoring: Option<bool>,
}

impl RuntimeOptionsUpdate {
    pub fn apply(&self, options: &mut RuntimeOptions) {
        if let Some(interval) = self.query_interval {
            options.query_interval = interval;
        }
        if let Some(timeout) = self.query_timeout {
            options.query_timeout = timeout;
        }
        if let Some(active) = self.active_monitoring {
            options.active_monitoring = active;
        }
    }
}

/// Response of `GET /api/v1/telemetry/agent` and `GET /api/v1/telemetry/central`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServiceConfigView {
    pub address: String,
    pub port: u16,
    pub exposed_service: String,
    pub query_interval: u64,
    pub query_timeout: u64,
    pub active_monitoring: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_envelope_decodes_by_type_tag() {
        let raw = serde_json::json!({
            "uuid": "11111111-1111-1111-1111-111111111111",
            "type": "Probe.k8s",
            "kubernetes_monitoring_data": {
                "Pods": [{
                    "name": "pod-a",
                    "namespace": "default",
                    "serrano_deployment_uuid": "d-1",
                    "usage": {"cpu": "12000000n", "memory": "1024Ki"}
                }]
            }
        });
        let envelope: MonitorEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.kind(), crate::models::ProbeKind::K8s);
        match envelope {
            MonitorEnvelope::K8s {
                kubernetes_monitoring_data,
                ..
            } => {
                let pods = kubernetes_monitoring_data.pods.unwrap();
                assert_eq!(pods[0].serrano_deployment_uuid, "d-1");
                assert_eq!(pods[0].group_id, "");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn deployment_pod_metric_renames_the_join_key() {
        let pod = PodSample {
            name: "pod-a".into(),
            namespace: "default".into(),
            serrano_deployment_uuid: "d-1".into(),
            ..Default::default()
        };
        let metric = DeploymentPodMetric::from_pod(&pod, "c-1", 1700000000);
        assert_eq!(metric.deployment_uuid, "d-1");
        assert_eq!(metric.cluster_uuid, "c-1");
        let value = serde_json::to_value(&metric).unwrap();
        assert!(value.get("serrano_deployment_uuid").is_none());
        assert_eq!(value["deployment_uuid"], "d-1");
    }

    #[test]
    fn node_sample_round_trips_the_exporter_field_names() {
        let node = NodeSample {
            node_name: "worker-0".into(),
            node_memory_mem_total_bytes: 2048.0,
            ..Default::default()
        };
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["node_memory_MemTotal_bytes"], 2048.0);
    }
}
