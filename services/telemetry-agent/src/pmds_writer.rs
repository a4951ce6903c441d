use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info};

use shared::schemas::{
    DeploymentPodMetric, DeploymentSpecificMetrics, EdgeDeviceMetrics, HpcMonitoringData,
    HpcPartition, K8sMonitoringData, NodeSample,
};
use shared::services::influx::{DEFAULT_RETENTION_SECONDS, Influx, Point};
use shared::utilities::errors::AppError;

pub const DEPLOYMENTS_BUCKET: &str = "SERRANO_Deployments";
pub const DEPLOYMENTS_METRICS_BUCKET: &str = "SERRANO_Deployments_Metrics";
pub const DEPLOYMENTS_SPECIFIC_METRICS_BUCKET: &str = "SERRANO_Deployments_Specific_Metrics";

/// One semantic sample group on its way into the time-series store.
#[derive(Clone, Debug)]
pub enum PmdsSample {
    K8s {
        probe_uuid: String,
        cluster_uuid: String,
        data: K8sMonitoringData,
    },
    Hpc {
        probe_uuid: String,
        cluster_uuid: String,
        data: HpcMonitoringData,
    },
    EdgeStorage {
        probe_uuid: String,
        cluster_uuid: String,
        data: Vec<EdgeDeviceMetrics>,
    },
    DeploymentMonitoring {
        data: Vec<DeploymentPodMetric>,
    },
    DeploymentSpecificMetrics {
        data: DeploymentSpecificMetrics,
    },
}

/// Writes typed, tag-structured points. Per-probe sample streams land in a
/// bucket named after the probe UUID; deployment overlay outputs use the
/// three fixed buckets. Buckets are created lazily with the configured
/// retention.
pub struct PmdsWriter {
    influx: Influx,
    retention_seconds: i64,
}

pub async fn run(mut samples: mpsc::Receiver<PmdsSample>, writer: PmdsWriter) {
    info!("Time-series writer is running ...");
    while let Some(sample) = samples.recv().await {
        writer.handle(sample).await;
    }
}

impl PmdsWriter {
    pub fn new(influx: Influx) -> Self {
        Self {
            influx,
            retention_seconds: DEFAULT_RETENTION_SECONDS,
        }
    }

    pub async fn handle(&self, sample: PmdsSample) {
        if let Err(err) = self.try_handle(sample).await {
            error!("Unable to update PMDS: {err}");
        }
    }

    async fn try_handle(&self, sample: PmdsSample) -> Result<(), AppError> {
        match sample {
            PmdsSample::K8s {
                probe_uuid,
                cluster_uuid,
                data,
            } => {
                info!("Store K8s monitoring data for cluster '{cluster_uuid}' from probe '{probe_uuid}'");
                self.influx
                    .ensure_bucket(&probe_uuid, self.retention_seconds)
                    .await?;
                self.influx.write(&probe_uuid, &k8s_points(&data)).await
            }
            PmdsSample::Hpc {
                probe_uuid,
                cluster_uuid,
                data,
            } => {
                info!("Store HPC monitoring data for cluster '{cluster_uuid}' from probe '{probe_uuid}'");
                let Some(infrastructure_name) = data.name.as_deref() else {
                    return Ok(());
                };
                if data.partitions.is_empty() {
                    return Ok(());
                }
                self.influx
                    .ensure_bucket(&probe_uuid, self.retention_seconds)
                    .await?;
                self.influx
                    .write(
                        &probe_uuid,
                        &hpc_partition_points(infrastructure_name, &data.partitions),
                    )
                    .await
            }
            PmdsSample::EdgeStorage {
                probe_uuid,
                cluster_uuid,
                data,
            } => {
                info!(
                    "Store edge storage devices data for cluster '{cluster_uuid}' from probe '{probe_uuid}'"
                );
                self.influx
                    .ensure_bucket(&probe_uuid, self.retention_seconds)
                    .await?;
                self.influx
                    .write(&probe_uuid, &edge_storage_points(&data))
                    .await
            }
            PmdsSample::DeploymentMonitoring { data } => {
                self.influx
                    .ensure_bucket(DEPLOYMENTS_BUCKET, self.retention_seconds)
                    .await?;
                self.influx
                    .ensure_bucket(DEPLOYMENTS_METRICS_BUCKET, self.retention_seconds)
                    .await?;

                let mut primary = Vec::new();
                let mut dashboards = Vec::new();
                for metric in &data {
                    primary.push(deployment_monitoring_point(metric));
                    if let Some(point) = deployment_dashboard_point(metric) {
                        dashboards.push(point);
                    }
                }
                self.influx.write(DEPLOYMENTS_BUCKET, &primary).await?;
                self.influx
                    .write(DEPLOYMENTS_METRICS_BUCKET, &dashboards)
                    .await
            }
            PmdsSample::DeploymentSpecificMetrics { data } => {
                self.influx
                    .ensure_bucket(DEPLOYMENTS_SPECIFIC_METRICS_BUCKET, self.retention_seconds)
                    .await?;
                self.influx
                    .write(
                        DEPLOYMENTS_SPECIFIC_METRICS_BUCKET,
                        &[deployment_specific_metrics_point(&data)],
                    )
                    .await
            }
        }
    }
}

/// "123456789n" nanocores -> millicores.
pub(crate) fn cpu_usage_millicores(raw: &str) -> Option<f64> {
    let nanocores: i64 = raw.strip_suffix('n')?.parse().ok()?;
    Some(nanocores as f64 / 1_000_000.0)
}

/// "1024Ki" -> megabytes.
pub(crate) fn memory_usage_mb(raw: &str) -> Option<f64> {
    let kibibytes: i64 = raw.strip_suffix("Ki")?.parse().ok()?;
    Some(kibibytes as f64 * 0.001024)
}

fn k8s_points(data: &K8sMonitoringData) -> Vec<Point> {
    let mut points = Vec::new();

    for node in data.nodes.as_deref().unwrap_or_default() {
        points.extend(node_points(node));
    }
    for pv in data.persistent_volumes.as_deref().unwrap_or_default() {
        points.push(
            Point::new("persistentVolumes")
                .tag("name", &pv.name)
                .field_str(
                    "capacity_storage",
                    pv.capacity.get("storage").cloned().unwrap_or_default(),
                ),
        );
    }
    for pod in data.pods.as_deref().unwrap_or_default() {
        points.push(
            Point::new("pods")
                .tag("name", &pod.name)
                .tag("namespace", &pod.namespace)
                .tag("node", &pod.node)
                .tag("phase", &pod.phase)
                .tag("creation_timestamp", pod.creation_timestamp)
                .field_str("cpu_usage", pod.usage.cpu.clone())
                .field_str("memory_usage", pod.usage.memory.clone())
                .field_i64("restarts", pod.restarts),
        );
    }
    for deployment in data.deployments.as_deref().unwrap_or_default() {
        points.push(
            Point::new("deployments")
                .tag("name", &deployment.name)
                .tag("namespace", &deployment.namespace)
                .field_i64("replicas", deployment.replicas)
                .field_i64("ready_replicas", deployment.ready_replicas)
                .field_i64("available_replicas", deployment.available_replicas),
        );
    }

    points
}

/// One point per node-metric group: general, cpu, memory, storage, network.
fn node_points(node: &NodeSample) -> Vec<Point> {
    let general = Point::new("nodes")
        .tag("node_name", &node.node_name)
        .tag("group", "general")
        .field_f64("node_boot_time_seconds", node.node_boot_time_seconds)
        .field_i64("node_total_running_pods", node.node_total_running_pods);

    let mut cpu = Point::new("nodes")
        .tag("node_name", &node.node_name)
        .tag("group", "cpu")
        .tag("node_cpus", node.node_cpus.len());
    for sample in &node.node_cpus {
        cpu = cpu
            .field_f64(&format!("cpu_{}_idle", sample.label), sample.idle)
            .field_f64(&format!("cpu_{}_used", sample.label), sample.used);
    }

    let memory = Point::new("nodes")
        .tag("node_name", &node.node_name)
        .tag("group", "memory")
        .field_f64("node_memory_Buffers_bytes", node.node_memory_buffers_bytes)
        .field_f64("node_memory_Cached_bytes", node.node_memory_cached_bytes)
        .field_f64(
            "node_memory_MemAvailable_bytes",
            node.node_memory_mem_available_bytes,
        )
        .field_f64("node_memory_MemFree_bytes", node.node_memory_mem_free_bytes)
        .field_f64("node_memory_MemTotal_bytes", node.node_memory_mem_total_bytes)
        .field_f64("node_memory_MemUsed_bytes", node.node_memory_mem_used_bytes)
        .field_f64(
            "node_memory_usage_percentage",
            node.node_memory_usage_percentage,
        );

    let storage = Point::new("nodes")
        .tag("node_name", &node.node_name)
        .tag("group", "storage")
        .field_f64("node_filesystem_avail_bytes", node.node_filesystem_avail_bytes)
        .field_f64("node_filesystem_free_bytes", node.node_filesystem_free_bytes)
        .field_f64("node_filesystem_size_bytes", node.node_filesystem_size_bytes)
        .field_f64(
            "node_filesystem_usage_percentage",
            node.node_filesystem_usage_percentage,
        )
        .field_f64("node_filesystem_used_bytes", node.node_filesystem_used_bytes);

    let network = Point::new("nodes")
        .tag("node_name", &node.node_name)
        .tag("group", "network")
        .field_f64(
            "node_network_receive_bytes_total",
            node.node_network_receive_bytes_total,
        )
        .field_f64(
            "node_network_receive_drop_total",
            node.node_network_receive_drop_total,
        )
        .field_f64(
            "node_network_receive_errs_total",
            node.node_network_receive_errs_total,
        )
        .field_f64(
            "node_network_receive_packets_total",
            node.node_network_receive_packets_total,
        )
        .field_f64(
            "node_network_transmit_bytes_total",
            node.node_network_transmit_bytes_total,
        )
        .field_f64(
            "node_network_transmit_drop_total",
            node.node_network_transmit_drop_total,
        )
        .field_f64(
            "node_network_transmit_errs_total",
            node.node_network_transmit_errs_total,
        )
        .field_f64(
            "node_network_transmit_packets_total",
            node.node_network_transmit_packets_total,
        );

    vec![general, cpu, memory, storage, network]
}

fn hpc_partition_points(infrastructure_name: &str, partitions: &[HpcPartition]) -> Vec<Point> {
    partitions
        .iter()
        .map(|partition| {
            Point::new("hpc_partitions")
                .tag("infrastructure_name", infrastructure_name)
                .tag("partition_name", &partition.name)
                .field_i64("avail_cpus", partition.avail_cpus)
                .field_i64("avail_nodes", partition.avail_nodes)
                .field_i64("queued_jobs", partition.queued_jobs)
                .field_i64("running_jobs", partition.running_jobs)
        })
        .collect()
}

fn edge_storage_points(devices: &[EdgeDeviceMetrics]) -> Vec<Point> {
    devices
        .iter()
        .map(|device| {
            Point::new("edge_storage")
                .tag("cluster_uuid", &device.cluster_uuid)
                .tag("node", &device.node)
                .tag("name", &device.name)
                .field_f64(
                    "minio_bucket_usage_object_total",
                    device.minio_bucket_usage_object_total,
                )
                .field_f64(
                    "minio_bucket_usage_total_bytes",
                    device.minio_bucket_usage_total_bytes,
                )
                .field_f64(
                    "minio_node_disk_free_bytes",
                    device.minio_node_disk_free_bytes,
                )
                .field_f64(
                    "minio_node_disk_total_bytes",
                    device.minio_node_disk_total_bytes,
                )
                .field_f64(
                    "minio_node_disk_used_bytes",
                    device.minio_node_disk_used_bytes,
                )
                .field_f64("minio_s3_requests_total", device.minio_s3_requests_total)
        })
        .collect()
}

fn deployment_monitoring_point(metric: &DeploymentPodMetric) -> Point {
    Point::new("serrano_deployments")
        .tag("cluster_uuid", &metric.cluster_uuid)
        .tag("node", &metric.node)
        .tag("name", &metric.name)
        .tag("deployment_uuid", &metric.deployment_uuid)
        .tag("group_id", &metric.group_id)
        .tag("namespace", &metric.namespace)
        .field_str("phase", metric.phase.clone())
        .field_i64("restarts", metric.restarts)
        .field_str("cpu_usage", metric.usage.cpu.clone())
        .field_str("memory_usage", metric.usage.memory.clone())
}

/// Dashboard rendition with converted units; skipped when the usage strings
/// do not parse, the raw record above still carries them.
fn deployment_dashboard_point(metric: &DeploymentPodMetric) -> Option<Point> {
    let cpu_usage_m = cpu_usage_millicores(&metric.usage.cpu)?;
    let memory_mb = memory_usage_mb(&metric.usage.memory)?;
    Some(
        Point::new("serrano_deployments")
            .tag("cluster_uuid", &metric.cluster_uuid)
            .tag("node", &metric.node)
            .tag("name", &metric.name)
            .tag("deployment_uuid", &metric.deployment_uuid)
            .tag("group_id", &metric.group_id)
            .field_i64("restarts", metric.restarts)
            .field_f64("cpu_usage_m", cpu_usage_m)
            .field_f64("memory_usage_mb", memory_mb),
    )
}

fn deployment_specific_metrics_point(data: &DeploymentSpecificMetrics) -> Point {
    let mut point = Point::new("serrano_deployments_specific_metrics")
        .tag("cluster_uuid", &data.cluster_uuid)
        .tag("deployment_uuid", &data.deployment_uuid)
        .tag("service_id", &data.service_id);

    if let Value::Object(fields) = &data.metrics {
        for (key, value) in fields {
            point = match value {
                Value::Number(number) if number.is_i64() => {
                    point.field_i64(key, number.as_i64().unwrap_or(0))
                }
                Value::Number(number) => point.field_f64(key, number.as_f64().unwrap_or(0.0)),
                Value::String(text) => point.field_str(key, text.clone()),
                Value::Bool(flag) => point.field_str(key, flag.to_string()),
                _ => point,
            };
        }
    }
    point
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::schemas::{CpuSample, ResourceUsage};

    fn metric() -> DeploymentPodMetric {
        DeploymentPodMetric {
            deployment_uuid: "d-1".into(),
            cluster_uuid: "c-1".into(),
            timestamp: 1_700_000_000,
            name: "pod-a".into(),
            namespace: "default".into(),
            node: "worker-0".into(),
            phase: "Running".into(),
            group_id: "g-1".into(),
            creation_timestamp: 0.0,
            start_time: 0.0,
            pod_ip: None,
            host_ip: None,
            restarts: 2,
            usage: ResourceUsage {
                cpu: "12000000n".into(),
                memory: "2048Ki".into(),
            },
        }
    }

    #[test]
    fn unit_conversions_follow_the_wire_suffixes() {
        assert_eq!(cpu_usage_millicores("12000000n"), Some(12.0));
        assert_eq!(memory_usage_mb("2048Ki"), Some(2.097152));
        assert_eq!(cpu_usage_millicores("12m"), None);
        assert_eq!(memory_usage_mb(""), None);
    }

    #[test]
    fn node_fans_out_into_five_groups() {
        let node = NodeSample {
            node_name: "worker-0".into(),
            node_boot_time_seconds: 1.0,
            node_total_running_pods: 4,
            node_cpus: vec![
                CpuSample {
                    label: "0".into(),
                    idle: 10.0,
                    used: 2.0,
                },
                CpuSample {
                    label: "1".into(),
                    idle: 11.0,
                    used: 3.0,
                },
            ],
            ..Default::default()
        };
        let points = node_points(&node);
        assert_eq!(points.len(), 5);

        let lines: Vec<String> = points.iter().map(Point::to_line_protocol).collect();
        assert!(lines[0].contains("group=general"));
        assert!(lines[0].contains("node_total_running_pods=4i"));
        assert!(lines[1].contains("group=cpu"));
        assert!(lines[1].contains("node_cpus=2"));
        assert!(lines[1].contains("cpu_0_idle=10"));
        assert!(lines[1].contains("cpu_1_used=3"));
        assert!(lines[2].contains("node_memory_MemTotal_bytes"));
        assert!(lines[3].contains("group=storage"));
        assert!(lines[4].contains("node_network_transmit_packets_total"));
    }

    #[test]
    fn dashboard_point_converts_units_and_drops_namespace() {
        let primary = deployment_monitoring_point(&metric()).to_line_protocol();
        assert!(primary.contains("namespace=default"));
        assert!(primary.contains("cpu_usage=\"12000000n\""));

        let dashboard = deployment_dashboard_point(&metric())
            .unwrap()
            .to_line_protocol();
        assert!(!dashboard.contains("namespace="));
        assert!(dashboard.contains("cpu_usage_m=12"));
        assert!(dashboard.contains("memory_usage_mb=2.097152"));
        assert!(dashboard.contains("restarts=2i"));
    }

    #[test]
    fn unparsable_usage_skips_only_the_dashboard_record() {
        let mut sample = metric();
        sample.usage.cpu = "".into();
        assert!(deployment_dashboard_point(&sample).is_none());
        let primary = deployment_monitoring_point(&sample).to_line_protocol();
        assert!(primary.contains("memory_usage=\"2048Ki\""));
    }

    #[test]
    fn specific_metrics_fields_are_typed_by_value() {
        let point = deployment_specific_metrics_point(&DeploymentSpecificMetrics {
            deployment_uuid: "d-1".into(),
            cluster_uuid: "c-1".into(),
            service_id: "svc-1".into(),
            metrics: serde_json::json!({"latency_ms": 12.5, "requests": 42, "status": "ok"}),
            timestamp: None,
        });
        let line = point.to_line_protocol();
        assert!(line.contains("latency_ms=12.5"));
        assert!(line.contains("requests=42i"));
        assert!(line.contains("status=\"ok\""));
        assert!(line.contains("service_id=svc-1"));
    }
}
