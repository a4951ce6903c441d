use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::error;

use shared::services::influx::{FluxTable, Influx};
use shared::utilities::errors::AppError;

const NODES_GENERAL: [&str; 2] = ["node_boot_time_seconds", "node_total_running_pods"];
const NODES_STORAGE: [&str; 5] = [
    "node_filesystem_avail_bytes",
    "node_filesystem_free_bytes",
    "node_filesystem_size_bytes",
    "node_filesystem_usage_percentage",
    "node_filesystem_used_bytes",
];
const NODES_MEMORY: [&str; 7] = [
    "node_memory_Buffers_bytes",
    "node_memory_Cached_bytes",
    "node_memory_MemAvailable_bytes",
    "node_memory_MemFree_bytes",
    "node_memory_MemTotal_bytes",
    "node_memory_MemUsed_bytes",
    "node_memory_usage_percentage",
];
const NODES_NETWORK: [&str; 8] = [
    "node_network_receive_bytes_total",
    "node_network_receive_drop_total",
    "node_network_receive_errs_total",
    "node_network_receive_packets_total",
    "node_network_transmit_bytes_total",
    "node_network_transmit_drop_total",
    "node_network_transmit_errs_total",
    "node_network_transmit_packets_total",
];
const DEPLOYMENTS: [&str; 3] = ["replicas", "ready_replicas", "available_replicas"];
const PODS: [&str; 3] = ["cpu_usage", "memory_usage", "restarts"];
const EDGE_STORAGE: [&str; 6] = [
    "minio_bucket_usage_object_total",
    "minio_bucket_usage_total_bytes",
    "minio_node_disk_free_bytes",
    "minio_node_disk_total_bytes",
    "minio_node_disk_used_bytes",
    "minio_s3_requests_total",
];
const SERRANO_DEPLOYMENTS: [&str; 4] = ["cpu_usage", "memory_usage", "restarts", "phase"];

fn default_start() -> String {
    "-1d".to_owned()
}

fn default_format() -> String {
    "compact".to_owned()
}

/// Query options shared by every measurement endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct QueryParams {
    #[serde(default = "default_start")]
    pub start: String,
    #[serde(default)]
    pub stop: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub cluster_uuid: Option<String>,
    #[serde(default)]
    pub field_measurement: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            start: default_start(),
            stop: None,
            name: None,
            node_name: None,
            namespace: None,
            phase: None,
            cluster_uuid: None,
            field_measurement: None,
            group: None,
            format: default_format(),
        }
    }
}

impl QueryParams {
    fn compact(&self) -> bool {
        self.format != "raw"
    }
}

fn flux_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

pub(crate) fn tag_filter(key: &str, value: &str) -> String {
    format!("r.{key} == \"{}\"", flux_escape(value))
}

pub(crate) fn flux_query(bucket: &str, params: &QueryParams, filters: &[String]) -> String {
    let mut range = format!("start: {}", params.start);
    if let Some(stop) = &params.stop {
        range.push_str(&format!(", stop: {stop}"));
    }
    format!(
        "from(bucket: \"{}\") |> range({}) |> filter(fn: (r) => {})",
        flux_escape(bucket),
        range,
        filters.join(" and ")
    )
}

// ============================================
// RESULT SHAPING
// ============================================

/// Raw format: one flat record per result row, restricted to `columns`.
pub(crate) fn to_json_object(tables: &[FluxTable], columns: &[&str]) -> Vec<Value> {
    tables
        .iter()
        .flat_map(|table| &table.records)
        .map(|record| {
            let mut object = Map::new();
            for column in columns {
                if let Some(value) = record.get(column) {
                    object.insert((*column).to_owned(), value.clone());
                }
            }
            Value::Object(object)
        })
        .collect()
}

/// Compact format: consecutive tables in blocks of `fields.len()` belong to
/// one value of the `group_by` tag; each inner record carries every field
/// of the block at a single timestamp plus the requested extra labels.
pub(crate) fn to_json_object_grouped_by(
    tables: &[FluxTable],
    fields_count: usize,
    group_by: &str,
    labels: &[&str],
) -> Value {
    let mut data = Map::new();
    if fields_count == 0 {
        return Value::Object(data);
    }

    for block in tables.chunks(fields_count) {
        if block.len() < fields_count {
            break;
        }
        let Some(first) = block[0].records.first() else {
            continue;
        };
        let key = first.get_str(group_by).unwrap_or_default().to_owned();
        data.insert(key, Value::Array(block_entries(block, labels)));
    }

    Value::Object(data)
}

/// Nodes/cpu compact format: each node owns `2 × cpu_count` consecutive
/// tables (idle and used per CPU).
pub(crate) fn cpus_to_json_object_grouped_by(tables: &[FluxTable], cpus: &[usize]) -> Value {
    let mut data = Map::new();
    let mut start = 0usize;

    for &cpu_count in cpus {
        let end = (start + cpu_count * 2).min(tables.len());
        let block = &tables[start..end];
        start = end;
        let Some(first) = block.first().and_then(|table| table.records.first()) else {
            continue;
        };
        let node_name = first.get_str("node_name").unwrap_or_default().to_owned();
        data.insert(node_name, Value::Array(block_entries(block, &[])));
    }

    Value::Object(data)
}

fn block_entries(block: &[FluxTable], labels: &[&str]) -> Vec<Value> {
    let records_count = block
        .iter()
        .map(|table| table.records.len())
        .min()
        .unwrap_or(0);

    (0..records_count)
        .map(|row| {
            let mut entry = Map::new();
            for table in block {
                let record = &table.records[row];
                if let Some(field) = record.get_str("_field") {
                    entry.insert(
                        field.to_owned(),
                        record.get("_value").cloned().unwrap_or(Value::Null),
                    );
                }
                if let Some(time) = record.get("_time") {
                    entry.insert("time".to_owned(), time.clone());
                }
                for label in labels {
                    if let Some(value) = record.get(label) {
                        entry.insert((*label).to_owned(), value.clone());
                    }
                }
            }
            Value::Object(entry)
        })
        .collect()
}

// ============================================
// ENGINE
// ============================================

/// Read-only Flux façade over the time-series store.
pub struct QueryEngine {
    influx: Influx,
}

impl QueryEngine {
    pub fn new(influx: Influx) -> Self {
        Self { influx }
    }

    async fn run(&self, flux: &str) -> Option<Vec<FluxTable>> {
        match self.influx.query(flux).await {
            Ok(tables) => Some(tables),
            Err(err) => {
                error!("Unable to query the time-series store: {err}");
                None
            }
        }
    }

    pub async fn query_nodes(&self, bucket: &str, params: &QueryParams) -> Result<Value, AppError> {
        let group = if params.compact() && params.group.is_none() {
            Some("general".to_owned())
        } else {
            params.group.clone()
        };

        let mut filters = vec![tag_filter("_measurement", "nodes")];
        let mut target_fields: Option<usize> = None;
        let mut cpus: Vec<usize> = Vec::new();
        let mut cpus_by_node: HashMap<String, usize> = HashMap::new();

        match group.as_deref() {
            Some("general") => {
                filters.push(tag_filter("group", "general"));
                target_fields = Some(NODES_GENERAL.len());
            }
            Some("storage") => {
                filters.push(tag_filter("group", "storage"));
                target_fields = Some(NODES_STORAGE.len());
            }
            Some("memory") => {
                filters.push(tag_filter("group", "memory"));
                target_fields = Some(NODES_MEMORY.len());
            }
            Some("network") => {
                filters.push(tag_filter("group", "network"));
                target_fields = Some(NODES_NETWORK.len());
            }
            Some("cpu") => {
                filters.push(tag_filter("group", "cpu"));
                // learn the per-node CPU counts before partitioning tables
                let probe = format!(
                    "from(bucket:\"{}\") |> range(start: -30m) |> \
                     filter(fn:(r) => r._measurement == \"nodes\" and r.group == \"cpu\" \
                     and r._field==\"cpu_0_idle\") |> last() |> distinct(column: \"tag\")",
                    flux_escape(bucket)
                );
                for table in self.run(&probe).await.unwrap_or_default() {
                    for record in &table.records {
                        let Some(count) = record
                            .get_str("node_cpus")
                            .and_then(|raw| raw.parse::<usize>().ok())
                        else {
                            continue;
                        };
                        if let Some(node_name) = record.get_str("node_name") {
                            cpus_by_node.insert(node_name.to_owned(), count);
                        }
                        cpus.push(count);
                    }
                }
            }
            _ => {}
        }

        if let Some(node_name) = &params.node_name {
            filters.push(tag_filter("node_name", node_name));
            cpus = vec![cpus_by_node.get(node_name).copied().unwrap_or(0)];
        }
        if let Some(field) = &params.field_measurement {
            filters.push(tag_filter("_field", field));
            target_fields = Some(1);
        }

        let flux = flux_query(bucket, params, &filters);
        let Some(tables) = self.run(&flux).await else {
            return Ok(json!({}));
        };

        if params.compact() {
            Ok(match target_fields {
                Some(fields_count) => {
                    to_json_object_grouped_by(&tables, fields_count, "node_name", &[])
                }
                None => cpus_to_json_object_grouped_by(&tables, &cpus),
            })
        } else {
            Ok(Value::Array(to_json_object(
                &tables,
                &["group", "_field", "_time", "_value", "node_name"],
            )))
        }
    }

    pub async fn query_persistent_volumes(
        &self,
        bucket: &str,
        params: &QueryParams,
    ) -> Result<Value, AppError> {
        let mut filters = vec![tag_filter("_measurement", "persistentVolumes")];
        if let Some(name) = &params.name {
            filters.push(tag_filter("name", name));
        }

        let flux = flux_query(bucket, params, &filters);
        let Some(tables) = self.run(&flux).await else {
            return Ok(json!({}));
        };

        if params.compact() {
            Ok(to_json_object_grouped_by(&tables, 1, "name", &[]))
        } else {
            Ok(Value::Array(to_json_object(
                &tables,
                &["name", "_field", "_time", "_value"],
            )))
        }
    }

    pub async fn query_deployments(
        &self,
        bucket: &str,
        params: &QueryParams,
    ) -> Result<Value, AppError> {
        let mut filters = vec![tag_filter("_measurement", "deployments")];
        if let Some(name) = &params.name {
            filters.push(tag_filter("name", name));
        }
        if let Some(namespace) = &params.namespace {
            filters.push(tag_filter("namespace", namespace));
        }

        let flux = flux_query(bucket, params, &filters);
        let Some(tables) = self.run(&flux).await else {
            return Ok(json!({}));
        };

        if params.compact() {
            Ok(to_json_object_grouped_by(&tables, DEPLOYMENTS.len(), "name", &[]))
        } else {
            Ok(Value::Array(to_json_object(
                &tables,
                &["name", "namespace", "_field", "_time", "_value"],
            )))
        }
    }

    pub async fn query_pods(&self, bucket: &str, params: &QueryParams) -> Result<Value, AppError> {
        let mut filters = vec![tag_filter("_measurement", "pods")];
        if let Some(namespace) = &params.namespace {
            filters.push(tag_filter("namespace", namespace));
        }
        if let Some(name) = &params.name {
            filters.push(tag_filter("name", name));
        }
        if let Some(node) = &params.node_name {
            filters.push(tag_filter("node", node));
        }
        if let Some(phase) = &params.phase {
            filters.push(tag_filter("phase", phase));
        }

        let flux = flux_query(bucket, params, &filters);
        let Some(tables) = self.run(&flux).await else {
            return Ok(json!({}));
        };

        if params.compact() {
            Ok(to_json_object_grouped_by(&tables, PODS.len(), "name", &[]))
        } else {
            Ok(Value::Array(to_json_object(
                &tables,
                &["name", "namespace", "node", "phase", "_field", "_time", "_value"],
            )))
        }
    }

    pub async fn query_edge_storage_devices(
        &self,
        bucket: &str,
        params: &QueryParams,
    ) -> Result<Value, AppError> {
        let mut filters = vec![tag_filter("_measurement", "edge_storage")];
        if let Some(name) = &params.name {
            filters.push(tag_filter("name", name));
        }
        if let Some(node) = &params.node_name {
            filters.push(tag_filter("node", node));
        }

        let flux = flux_query(bucket, params, &filters);
        let Some(tables) = self.run(&flux).await else {
            return Ok(json!({}));
        };

        if params.compact() {
            Ok(to_json_object_grouped_by(&tables, EDGE_STORAGE.len(), "name", &[]))
        } else {
            Ok(Value::Array(to_json_object(
                &tables,
                &["name", "node", "_field", "_time", "_value"],
            )))
        }
    }

    pub async fn query_serrano_deployments(
        &self,
        deployment_uuid: &str,
        bucket: &str,
        params: &QueryParams,
    ) -> Result<Value, AppError> {
        let mut filters = vec![
            tag_filter("_measurement", "serrano_deployments"),
            tag_filter("deployment_uuid", deployment_uuid),
        ];
        if let Some(node) = &params.node_name {
            filters.push(tag_filter("node", node));
        }
        if let Some(cluster_uuid) = &params.cluster_uuid {
            filters.push(tag_filter("cluster_uuid", cluster_uuid));
        }

        let flux = flux_query(bucket, params, &filters);
        let Some(tables) = self.run(&flux).await else {
            return Ok(json!({}));
        };

        if params.compact() {
            Ok(to_json_object_grouped_by(
                &tables,
                SERRANO_DEPLOYMENTS.len(),
                "name",
                &["group_id"],
            ))
        } else {
            Ok(Value::Array(to_json_object(
                &tables,
                &[
                    "deployment_uuid",
                    "cluster_uuid",
                    "name",
                    "group_id",
                    "node",
                    "_field",
                    "_time",
                    "_value",
                ],
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::services::influx::parse_flux_csv;

    fn pod_tables() -> Vec<FluxTable> {
        // two pods, three fields each, two timestamps
        let body = "\
result,table,_time,_value,_field,name
_result,0,t0,12,cpu_usage,pod-a
_result,0,t1,13,cpu_usage,pod-a
_result,1,t0,100,memory_usage,pod-a
_result,1,t1,101,memory_usage,pod-a
_result,2,t0,0,restarts,pod-a
_result,2,t1,1,restarts,pod-a
_result,3,t0,20,cpu_usage,pod-b
_result,4,t0,200,memory_usage,pod-b
_result,5,t0,2,restarts,pod-b
";
        parse_flux_csv(body).unwrap()
    }

    #[test]
    fn flux_query_renders_range_and_filters() {
        let params = QueryParams {
            stop: Some("-5m".to_owned()),
            ..Default::default()
        };
        let filters = vec![
            tag_filter("_measurement", "pods"),
            tag_filter("namespace", "default"),
        ];
        assert_eq!(
            flux_query("bucket-1", &params, &filters),
            "from(bucket: \"bucket-1\") |> range(start: -1d, stop: -5m) |> \
             filter(fn: (r) => r._measurement == \"pods\" and r.namespace == \"default\")"
        );
    }

    #[test]
    fn compact_format_groups_fields_per_primary_tag() {
        let data = to_json_object_grouped_by(&pod_tables(), 3, "name", &[]);

        let pod_a = data["pod-a"].as_array().unwrap();
        assert_eq!(pod_a.len(), 2);
        assert_eq!(pod_a[0]["cpu_usage"], json!(12));
        assert_eq!(pod_a[0]["memory_usage"], json!(100));
        assert_eq!(pod_a[0]["restarts"], json!(0));
        assert_eq!(pod_a[0]["time"], json!("t0"));
        assert_eq!(pod_a[1]["restarts"], json!(1));

        let pod_b = data["pod-b"].as_array().unwrap();
        assert_eq!(pod_b.len(), 1);
        assert_eq!(pod_b[0]["cpu_usage"], json!(20));
    }

    #[test]
    fn raw_format_returns_flat_records() {
        let records = to_json_object(&pod_tables(), &["name", "_field", "_time", "_value"]);
        assert_eq!(records.len(), 9);
        assert_eq!(records[0]["name"], json!("pod-a"));
        assert_eq!(records[0]["_field"], json!("cpu_usage"));
        assert_eq!(records[0]["_value"], json!(12));
    }

    #[test]
    fn cpu_grouping_partitions_per_node_blocks() {
        // worker-0 has 2 CPUs (4 tables), worker-1 has 1 CPU (2 tables)
        let body = "\
result,table,_time,_value,_field,node_name
_result,0,t0,10,cpu_0_idle,worker-0
_result,1,t0,1,cpu_0_used,worker-0
_result,2,t0,11,cpu_1_idle,worker-0
_result,3,t0,2,cpu_1_used,worker-0
_result,4,t0,20,cpu_0_idle,worker-1
_result,5,t0,3,cpu_0_used,worker-1
";
        let tables = parse_flux_csv(body).unwrap();
        let data = cpus_to_json_object_grouped_by(&tables, &[2, 1]);

        let worker0 = data["worker-0"].as_array().unwrap();
        assert_eq!(worker0.len(), 1);
        assert_eq!(worker0[0]["cpu_0_idle"], json!(10));
        assert_eq!(worker0[0]["cpu_1_used"], json!(2));

        let worker1 = data["worker-1"].as_array().unwrap();
        assert_eq!(worker1[0]["cpu_0_idle"], json!(20));
        assert_eq!(worker1[0]["cpu_0_used"], json!(3));
    }

    #[test]
    fn extra_labels_ride_along_in_compact_entries() {
        let body = "\
result,table,_time,_value,_field,name,group_id
_result,0,t0,Running,phase,pod-a,g-1
";
        let tables = parse_flux_csv(body).unwrap();
        let data = to_json_object_grouped_by(&tables, 1, "name", &["group_id"]);
        assert_eq!(data["pod-a"][0]["group_id"], json!("g-1"));
        assert_eq!(data["pod-a"][0]["phase"], json!("Running"));
    }
}
